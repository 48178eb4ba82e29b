//! The backend registry: the authoritative, atomically-reloadable list of
//! backends and their attached resources (spec.md §4.3).
//!
//! Grounded in `ConnectionPoolManager` (`warpgrid-host::db_proxy`) for the
//! acquire/release shape, adapted from a generic keyed map to the spec's
//! ordered, index-addressed layout. Reload is implemented as "build a
//! fresh `Vec<BackendSlot>` off to the side, reusing `Arc`-backed pools and
//! connections for backends that survive unchanged, then publish with one
//! atomic swap" rather than the original's in-place mutation under a
//! held lock — see DESIGN.md for why this satisfies the same invariants
//! without the original's unbounded "spin past a null pool slot" loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};

use shardsql_pool::Pool as LockPool;

use crate::connection::{connect_backend, BackendOptions};
use crate::error::{BackendError, BackendResult};
use crate::slot::{AcquiredConn, ConnSlot};
use crate::types::{parse_backend_source, Backend};
use crate::worker::{spawn_dispatch_worker, DispatchWorkerHandle};

/// One backend's full attached state: its identity, its connection pool
/// (for the ANY branch), and its dispatch-worker pool (for the ALL
/// branch). The four collections form the "parallel arrays" of spec.md
/// §3's Backend registry data model.
pub struct BackendSlot {
    pub backend: Backend,
    pub conn_pool: LockPool,
    pub connections: Vec<Arc<ConnSlot>>,
    pub worker_pool: LockPool,
    pub workers: Vec<Arc<DispatchWorkerHandle>>,
}

impl BackendSlot {
    async fn fresh(
        backend: Backend,
        options: &BackendOptions,
        num_conns: usize,
        num_workers: usize,
    ) -> BackendResult<Self> {
        let mut connections = Vec::with_capacity(num_conns);
        for _ in 0..num_conns {
            let conn = connect_backend(&backend, options).await?;
            connections.push(ConnSlot::new(conn));
        }

        let conn_pool = LockPool::new(num_conns)?;

        let worker_pool = LockPool::new(num_workers)?;
        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let conn = connect_backend(&backend, options).await?;
            let (handle, mut idle_rx) = spawn_dispatch_worker(conn);
            let handle = Arc::new(handle);
            let pool_for_reaper = worker_pool.clone();
            tokio::spawn(async move {
                while idle_rx.recv().await.is_some() {
                    let _ = pool_for_reaper.release(i).await;
                }
            });
            workers.push(handle);
        }

        Ok(Self {
            backend,
            conn_pool,
            connections,
            worker_pool,
            workers,
        })
    }

    async fn close(&self) {
        for conn_slot in &self.connections {
            conn_slot.lock().await.shutdown().await;
        }
        for worker in &self.workers {
            worker.cancel().await;
        }
    }
}

/// The authoritative, hot-swappable backend list (spec.md §4.3).
pub struct BackendRegistry {
    slots: RwLock<Arc<Vec<BackendSlot>>>,
    options: BackendOptions,
    num_conns: usize,
    num_workers: usize,
    /// Count of in-flight dispatcher calls (spec.md §3 "Global counters:
    /// querying"). `reload` waits for this to reach zero before touching
    /// any per-backend state, which is what makes "cancel the dispatch
    /// workers of a removed backend" (step 6) safe: no fan-out query can
    /// still be relying on them by the time reload gets there.
    querying: AtomicUsize,
    quiescent: Notify,
}

/// RAII guard marking one dispatcher call as in-flight. Held for the
/// duration of `Dispatcher::dispatch` in `shardsql-dispatch`.
pub struct QueryGuard<'a> {
    registry: &'a BackendRegistry,
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        if self.registry.querying.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.registry.quiescent.notify_waiters();
        }
    }
}

impl BackendRegistry {
    pub async fn load_initial(
        source: &str,
        options: BackendOptions,
        num_conns: usize,
        num_workers: usize,
    ) -> BackendResult<Self> {
        let backends = parse_backend_source(source)?;
        let mut slots = Vec::with_capacity(backends.len());
        for backend in backends {
            slots.push(BackendSlot::fresh(backend, &options, num_conns, num_workers).await?);
        }
        Ok(Self {
            slots: RwLock::new(Arc::new(slots)),
            options,
            num_conns,
            num_workers,
            querying: AtomicUsize::new(0),
            quiescent: Notify::new(),
        })
    }

    /// Mark one dispatcher call as in-flight (spec.md §3 `querying`
    /// counter). The returned guard decrements the count on drop.
    pub fn begin_query(&self) -> QueryGuard<'_> {
        self.querying.fetch_add(1, Ordering::AcqRel);
        QueryGuard { registry: self }
    }

    async fn wait_for_quiescence(&self) {
        loop {
            if self.querying.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.quiescent.notified();
            if self.querying.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// A consistent, point-in-time view of the backend list. A dispatcher
    /// holds this for the lifetime of one query; because it is an `Arc`
    /// clone of a list that is only ever replaced (never mutated in
    /// place), a query that began before a reload's publish step
    /// transparently "completes using the snapshot it started with"
    /// (spec.md §8) without any spin-wait.
    pub async fn snapshot(&self) -> Arc<Vec<BackendSlot>> {
        Arc::clone(&self.slots.read().await)
    }

    /// Re-read the backend source and atomically publish the new layout
    /// (spec.md §4.3's 9-step reload protocol).
    pub async fn reload(&self, source: &str) -> BackendResult<()> {
        // Wait until no dispatcher call is mid-flight before touching any
        // per-backend state (spec.md §8: "querying == 0 whenever reload's
        // backend-swap step runs"). This is what makes step 6's worker
        // cancellation safe against a fan-out query already in progress.
        self.wait_for_quiescence().await;

        let new_backends = parse_backend_source(source)?;
        if new_backends.is_empty() {
            return Err(BackendError::EmptyReload);
        }

        let old = self.snapshot().await;

        // Step 2/3: compute keep[i] = j (old index -> new index), or none.
        let keep: Vec<Option<usize>> = old
            .iter()
            .map(|slot| new_backends.iter().position(|b| *b == slot.backend))
            .collect();

        // Step 4: identical layout (by length and full mapping) — no-op.
        let identical = old.len() == new_backends.len()
            && keep.iter().enumerate().all(|(i, j)| *j == Some(i));
        if identical {
            return Ok(());
        }

        // Step 2 (coarse lock): freeze new acquisitions on every surviving
        // or removed old slot while we build the new layout.
        let mut guards = Vec::with_capacity(old.len());
        for slot in old.iter() {
            guards.push((slot.conn_pool.lock().await, slot.worker_pool.lock().await));
        }

        // Step 5/6: build the new parallel arrays, reusing Arc-backed
        // state for backends that survive at their old index.
        let mut new_slots: Vec<Option<BackendSlot>> = (0..new_backends.len()).map(|_| None).collect();
        for (i, slot) in old.iter().enumerate() {
            match keep[i] {
                Some(j) => {
                    new_slots[j] = Some(BackendSlot {
                        backend: slot.backend.clone(),
                        conn_pool: slot.conn_pool.clone(),
                        connections: slot.connections.clone(),
                        worker_pool: slot.worker_pool.clone(),
                        workers: slot.workers.clone(),
                    });
                }
                None => {
                    for (idx, conn_slot) in slot.connections.iter().enumerate() {
                        if slot.conn_pool.is_free(idx).await {
                            conn_slot.lock().await.shutdown().await;
                        } else {
                            conn_slot.mark_freed();
                        }
                    }
                    for worker in &slot.workers {
                        worker.cancel().await;
                    }
                }
            }
        }

        // Step 8: new slots that did not inherit from an old one.
        for (j, backend) in new_backends.into_iter().enumerate() {
            if new_slots[j].is_none() {
                let fresh =
                    BackendSlot::fresh(backend, &self.options, self.num_conns, self.num_workers)
                        .await?;
                new_slots[j] = Some(fresh);
            }
        }

        let new_slots: Vec<BackendSlot> = new_slots.into_iter().map(|s| s.expect("every slot filled")).collect();

        // Step 7: publish.
        {
            let mut guard = self.slots.write().await;
            *guard = Arc::new(new_slots);
        }

        // Step 9: release pool locks (guards drop here).
        drop(guards);
        Ok(())
    }

    pub async fn close_all(&self) {
        let slots = self.snapshot().await;
        for slot in slots.iter() {
            slot.close().await;
        }
    }
}

/// Pick a uniformly random backend index (spec.md §4.5 ANY branch).
pub fn pick_random_backend(slots: &[BackendSlot]) -> usize {
    fastrand::usize(..slots.len())
}

/// Acquire a connection from `slots[backend_idx]`'s connection pool,
/// blocking until one is free.
pub async fn acquire_connection(slots: &[BackendSlot], backend_idx: usize) -> AcquiredConn {
    let slot = &slots[backend_idx];
    let index = slot.conn_pool.acquire().await;
    AcquiredConn {
        index,
        slot: Arc::clone(&slot.connections[index]),
    }
}

/// Release a connection acquired via [`acquire_connection`], destroying it
/// first if it has been marked `freed` by an intervening reload.
pub async fn release_connection(slots: &[BackendSlot], backend_idx: usize, acquired: AcquiredConn) {
    if acquired.slot.is_freed() {
        acquired.slot.lock().await.shutdown().await;
    }
    slots[backend_idx].conn_pool.release(acquired.index).await;
}
