//! Per-backend connection array: the "connection manager" half of the
//! component design (spec.md §2, §4.3).
//!
//! A [`ConnSlot`] pairs a `tokio::sync::Mutex`-guarded connection with a
//! lock-free `freed` flag, so the backend registry can mark a connection
//! for destruction during reload without blocking on whoever currently
//! holds it (spec.md §4.3 step 6: "mark freed=true; the borrower will
//! close on release").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::connection::BackendConnection;

pub struct ConnSlot {
    conn: Mutex<BackendConnection>,
    freed: AtomicBool,
}

impl ConnSlot {
    pub fn new(conn: BackendConnection) -> Arc<Self> {
        Arc::new(Self {
            conn: Mutex::new(conn),
            freed: AtomicBool::new(false),
        })
    }

    pub fn mark_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Lock the connection for the duration of one query. Holding the
    /// guard across `.await` points is how "one query per connection at a
    /// time" (spec.md §5) is enforced.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, BackendConnection> {
        self.conn.lock().await
    }

    pub fn try_lock(&self) -> Result<tokio::sync::MutexGuard<'_, BackendConnection>, tokio::sync::TryLockError> {
        self.conn.try_lock()
    }
}

/// A borrowed connection, acquired from a [`crate::registry::BackendSlot`]'s
/// connection pool via [`crate::registry::acquire_connection`]. There is no
/// `Drop` impl: releasing the pool slot requires awaiting
/// [`crate::registry::release_connection`] against the owning `BackendSlot`,
/// which this type doesn't hold a reference to. Dropping an `AcquiredConn`
/// without calling `release_connection` leaks its slot — the pool considers
/// it permanently held and it is never handed out again — so every caller
/// must release on every exit path, including error returns.
pub struct AcquiredConn {
    pub index: usize,
    pub slot: Arc<ConnSlot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // BackendConnection has no constructor outside `connect_backend` (which
    // requires a live socket), so the freed-flag bookkeeping is exercised
    // directly rather than through a real ConnSlot here; registry.rs's
    // integration-style tests cover the flag through the full acquire/
    // release path against an in-memory listener.
    #[test]
    fn freed_flag_round_trips() {
        let freed = AtomicBool::new(false);
        assert!(!freed.load(Ordering::Acquire));
        freed.store(true, Ordering::Release);
        assert!(freed.load(Ordering::Acquire));
    }
}
