use thiserror::Error;

/// Errors surfaced by the backend registry, connection manager, and
/// dispatch-worker machinery.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend source is empty")]
    EmptySource,

    #[error("invalid backend token {0:?}")]
    InvalidToken(String),

    #[error("reload rejected: new backend list is empty")]
    EmptyReload,

    #[error("failed to connect to backend {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("backend {host}:{port} rejected handshake: {reason}")]
    HandshakeRejected {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("wire error talking to backend: {0}")]
    Wire(#[from] shardsql_wire::WireError),

    #[error("pool error: {0}")]
    Pool(#[from] shardsql_pool::PoolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;
