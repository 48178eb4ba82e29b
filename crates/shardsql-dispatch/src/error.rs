use thiserror::Error;

/// Errors surfaced by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Backend(#[from] shardsql_backend::BackendError),
    #[error(transparent)]
    Wire(#[from] shardsql_wire::WireError),
    #[error("dispatch worker for backend {host}:{port} is no longer accepting work")]
    WorkerGone { host: String, port: u16 },
}

pub type DispatchResult<T> = Result<T, DispatchError>;
