//! Backend registry, connection manager, and dispatch-worker pool.
//!
//! Owns everything the dispatcher needs to talk to backends: the
//! authoritative, reloadable backend list; one pool of pooled connections
//! per backend (for single-backend routing); and one pool of long-lived
//! dispatch-worker tasks per backend, each with its own dedicated
//! connection (for fan-out routing).

mod connection;
mod error;
mod registry;
mod slot;
mod types;
mod worker;

pub use connection::{BackendConnection, BackendOptions};
pub use error::{BackendError, BackendResult};
pub use registry::{
    acquire_connection, pick_random_backend, release_connection, BackendRegistry, BackendSlot,
    QueryGuard,
};
pub use slot::{AcquiredConn, ConnSlot};
pub use types::{parse_backend_source, Backend, BackendSource};
pub use worker::{forward_result_stream, CommitContext, DispatchWorkerHandle, ReplyTarget, WorkItem};
