//! Generic lock pool — a bounded set of reusable slots.
//!
//! Used to allocate client-worker threads, per-backend connections, and
//! per-backend dispatch threads. A slot is either free or held by exactly
//! one borrower. `acquire` blocks until a slot is free; `release` returns
//! one. `lock`/`unlock` is a second, coarser mutex, used by the backend
//! registry to freeze acquisition during a reload: both `acquire` and
//! `try_acquire` take the coarse lock before touching slot state, so a
//! held `PoolLockGuard` genuinely excludes new acquisitions rather than
//! merely running alongside them.
//!
//! Modeled on the availability-array-plus-condvar shape of the legacy
//! `proxy_pool_t`, adapted to `tokio::sync::Notify` the way
//! `warp-runtime::pool::InstancePool` guards its idle queue with a
//! `tokio::sync::Mutex`.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Notify};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool size must be greater than zero")]
    InvalidSize,
    #[error("index {0} out of range for pool of size {1}")]
    OutOfRange(usize, usize),
    #[error("releasing slot {0} which is not held")]
    NotHeld(usize),
}

struct PoolState {
    /// Logical size (number of addressable slots).
    size: usize,
    /// Availability of each slot up to `avail.len()` (a power of two >= size).
    avail: Vec<bool>,
    /// Count of slots currently held.
    locked: usize,
}

impl PoolState {
    fn backing_capacity(size: usize) -> usize {
        let mut alloc = 1usize;
        while alloc < size.max(1) {
            alloc <<= 1;
        }
        alloc
    }

    fn new(size: usize) -> Self {
        let alloc = Self::backing_capacity(size);
        Self {
            size,
            avail: vec![true; alloc],
            locked: 0,
        }
    }
}

/// A bounded pool of `size` reusable slots.
///
/// Cloning a `Pool` is cheap (it is an `Arc` handle) and all clones refer
/// to the same underlying state, matching the legacy pool's single shared
/// `pool_t*` passed between threads.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<PoolState>,
    /// Signalled whenever a slot transitions from held to free.
    available: Notify,
    /// Coarse mutex independent of per-slot availability (registry reload).
    coarse: Mutex<()>,
}

/// Guard returned by [`Pool::lock`]. Dropping it is equivalent to `unlock`.
pub struct PoolLockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl Pool {
    /// Create a new pool with `size` slots, all initially free.
    pub fn new(size: usize) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(PoolState::new(size)),
                available: Notify::new(),
                coarse: Mutex::new(()),
            }),
        })
    }

    /// Current logical size of the pool.
    pub async fn size(&self) -> usize {
        self.inner.state.lock().await.size
    }

    /// Number of slots currently held.
    pub async fn locked(&self) -> usize {
        self.inner.state.lock().await.locked
    }

    /// Non-blocking variant: returns `Some(index)` if a slot is free.
    ///
    /// Picks a random starting slot and scans linearly, matching the
    /// reference pool's starvation-avoidance behavior under bounded
    /// contention (no FIFO ordering is guaranteed). Also non-blocking on
    /// the coarse lock: if a reload currently holds it, this returns
    /// `None` rather than waiting.
    pub async fn try_acquire(&self) -> Option<usize> {
        let _coarse = self.inner.coarse.try_lock().ok()?;
        let mut state = self.inner.state.lock().await;
        try_acquire_locked(&mut state)
    }

    /// Block until a slot is free, then mark it held and return its index.
    ///
    /// Every attempt first takes the coarse lock, so a held
    /// [`PoolLockGuard`] (a reload in progress) blocks new acquisitions
    /// until it is dropped, not just concurrent `lock()` callers.
    pub async fn acquire(&self) -> usize {
        if let Some(idx) = self.try_acquire_coarsely().await {
            return idx;
        }
        loop {
            let notified = self.inner.available.notified();
            // Re-check before awaiting: avoid missing a signal that fired
            // between the failed attempt above and registering interest.
            if let Some(idx) = self.try_acquire_coarsely().await {
                return idx;
            }
            notified.await;
            if let Some(idx) = self.try_acquire_coarsely().await {
                return idx;
            }
        }
    }

    /// Like `try_acquire`, but blocks on the coarse lock rather than
    /// giving up when a reload holds it — used by `acquire`'s retry loop,
    /// which must wait out a reload rather than treat it as "no slot".
    async fn try_acquire_coarsely(&self) -> Option<usize> {
        let _coarse = self.inner.coarse.lock().await;
        let mut state = self.inner.state.lock().await;
        try_acquire_locked(&mut state)
    }

    /// Return a previously-acquired slot to the pool.
    ///
    /// Releasing a slot that is already free is a usage error: logged,
    /// not fatal (spec.md §7 "Usage error").
    pub async fn release(&self, idx: usize) {
        {
            let mut state = self.inner.state.lock().await;
            if idx >= state.avail.len() || state.avail[idx] {
                tracing::error!(index = idx, "releasing an unheld pool slot");
                return;
            }
            state.avail[idx] = true;
            state.locked -= 1;
        }
        self.inner.available.notify_waiters();
    }

    /// Return the index of any currently-held slot, or `None`. Used during
    /// shutdown to drain outstanding borrowers.
    pub async fn any_held(&self) -> Option<usize> {
        let state = self.inner.state.lock().await;
        (0..state.size).find(|&i| !state.avail[i])
    }

    /// Whether slot `idx` is currently free.
    pub async fn is_free(&self, idx: usize) -> bool {
        let state = self.inner.state.lock().await;
        idx < state.avail.len() && state.avail[idx]
    }

    /// Resize the pool. Growing adds free slots; shrinking truncates from
    /// the tail. A no-op if `n` equals the current size.
    pub async fn set_size(&self, n: usize) {
        let mut state = self.inner.state.lock().await;
        set_size_locked(&mut state, n);
    }

    /// Remove slot `idx`, shifting the availability of `idx+1..size` down
    /// by one and shrinking the pool by one.
    pub async fn remove(&self, idx: usize) {
        let mut state = self.inner.state.lock().await;
        if idx >= state.size {
            return;
        }
        for i in idx..state.size - 1 {
            state.avail[i] = state.avail[i + 1];
        }
        let new_size = state.size - 1;
        set_size_locked(&mut state, new_size);
    }

    /// Acquire the coarse pool lock, independent of per-slot availability.
    /// Held across the entire backend-registry reload critical section.
    pub async fn lock(&self) -> PoolLockGuard<'_> {
        PoolLockGuard {
            _guard: self.inner.coarse.lock().await,
        }
    }
}

fn try_acquire_locked(state: &mut PoolState) -> Option<usize> {
    if state.size == 0 {
        return None;
    }
    let start = fastrand::usize(..state.size);
    for step in 0..state.size {
        let idx = (start + step) % state.size;
        if state.avail[idx] {
            state.avail[idx] = false;
            state.locked += 1;
            return Some(idx);
        }
    }
    None
}

fn set_size_locked(state: &mut PoolState, n: usize) {
    if n == state.size {
        return;
    }
    let alloc = PoolState::backing_capacity(n);
    if alloc != state.avail.len() {
        let mut new_avail = vec![true; alloc];
        let keep = state.size.min(alloc);
        new_avail[..keep].copy_from_slice(&state.avail[..keep]);
        state.avail = new_avail;
    }
    state.size = n;
}
