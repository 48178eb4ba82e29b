//! MySQL client/server wire protocol (>= 4.1) codec.
//!
//! Covers exactly what the dispatcher and protocol relay need: packet
//! framing, the OK/ERR/EOF markers, row streaming with bounded buffering,
//! and the connection handshake. No SQL parsing, no prepared statements.

mod handshake;
mod lenenc;
mod packet;
mod rows;

pub use handshake::{handshake, ClientHello};
pub use packet::{Conn, PacketSink, MAX_PACKET_LENGTH};
pub use rows::stream_rows;

use thiserror::Error;

/// Errors surfaced by the wire codec.
///
/// Mirrors spec.md §7's error-category table: `Disconnected` is the
/// "client/backend went away" case (logged at debug, not an error), while
/// `Protocol` covers malformed packets (logged at warn).
#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection closed by peer")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WireResult<T> = Result<T, WireError>;

/// Per-connection byte/query counters, accumulated for a client session.
#[derive(Debug, Default, Clone, Copy)]
pub struct Status {
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub queries: u64,
}

/// MySQL command byte values relevant to the core (spec.md §6).
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_INIT_DB: u8 = 0x02;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_PING: u8 = 0x0e;
}

/// Server status flags (subset used by the core).
pub mod status_flag {
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
}

/// Capability flags (subset used by the core handshake).
pub mod capability {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;

    /// Matches spec.md §6: advertise the basic flag set minus
    /// `CLIENT_CONNECT_WITH_DB` and `CLIENT_MULTI_STATEMENTS`.
    pub const CLIENT_BASIC_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION;
}

/// Known MySQL error codes used by the dispatcher (spec.md §4.5 step 4) and
/// the protocol relay (spec.md §4.6).
pub mod error_code {
    pub const ER_ERROR_DURING_COMMIT: u16 = 1180;
    /// "Unknown command" — used for unsupported/malformed client commands.
    pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
}
