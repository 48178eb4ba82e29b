//! Backend-side MySQL client: connects to one downstream server, performs
//! the client half of the handshake, and carries one query at a time.
//!
//! Grounded in `backend_connect()` in the original C proxy: reconnect is
//! handled at the socket level (the proxy simply reconnects on next use
//! rather than relying on a client-library auto-reconnect flag), and
//! autocommit is set unconditionally to `autocommit && !two_pc`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use shardsql_wire::{command, Conn};

use crate::error::{BackendError, BackendResult};
use crate::types::Backend;

/// Credentials and session options used when connecting to every backend.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub autocommit: bool,
    pub two_pc: bool,
}

/// One live connection to a backend. Carries the `freed` flag externally
/// (see [`crate::pool::ConnSlot`]) rather than as a field here, since the
/// flag must be settable without holding the connection's own lock.
pub struct BackendConnection {
    pub backend: Backend,
    conn: Conn<TcpStream>,
}

impl BackendConnection {
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Send a `COM_QUERY` and return immediately; the caller reads the
    /// response via [`Self::conn_mut`].
    pub async fn send_query(&mut self, query: &[u8]) -> BackendResult<()> {
        self.conn.reset_seq();
        let mut payload = Vec::with_capacity(query.len() + 1);
        payload.push(command::COM_QUERY);
        payload.extend_from_slice(query);
        self.conn.write_packet(&payload).await?;
        self.conn.flush().await?;
        Ok(())
    }

    /// Send a plain statement with no result set expected (`COMMIT`,
    /// `ROLLBACK`, `SET SESSION ...`), and consume its OK/ERR reply.
    async fn exec_statement(&mut self, statement: &str) -> BackendResult<()> {
        self.send_query(statement.as_bytes()).await?;
        let reply = self.conn.read_packet().await?;
        if reply.first() == Some(&0xFF) {
            return Err(BackendError::HandshakeRejected {
                host: self.backend.host.clone(),
                port: self.backend.port,
                reason: String::from_utf8_lossy(&reply).into_owned(),
            });
        }
        Ok(())
    }

    pub fn conn_mut(&mut self) -> &mut Conn<TcpStream> {
        &mut self.conn
    }

    pub async fn shutdown(&mut self) {
        let _ = self.conn.get_mut().shutdown().await;
    }
}

fn client_response_packet(options: &BackendOptions) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&shardsql_wire::capability::CLIENT_BASIC_FLAGS.to_le_bytes());
    buf.extend_from_slice(&(shardsql_wire::MAX_PACKET_LENGTH).to_le_bytes());
    buf.push(33); // utf8_general_ci
    buf.extend_from_slice(&[0u8; 23]);
    buf.extend_from_slice(options.user.as_bytes());
    buf.push(0);
    // Authentication is a stub on both sides of this proxy (spec.md §9):
    // send the configured password's length and bytes as-is, no hashing.
    buf.push(options.password.len() as u8);
    buf.extend_from_slice(options.password.as_bytes());
    buf
}

/// Connect to `backend`, perform the client half of the handshake, select
/// the default database if configured, and set autocommit.
pub async fn connect_backend(
    backend: &Backend,
    options: &BackendOptions,
) -> BackendResult<BackendConnection> {
    let stream = TcpStream::connect((backend.host.as_str(), backend.port))
        .await
        .map_err(|source| BackendError::Connect {
            host: backend.host.clone(),
            port: backend.port,
            source,
        })?;
    stream.set_nodelay(true).ok();

    let mut conn = Conn::new(stream);

    // Server greeting: we don't need its contents beyond having read it off
    // the wire before sending our response.
    let _greeting = conn.read_packet().await?;

    let response = client_response_packet(options);
    conn.write_packet(&response).await?;
    conn.flush().await?;

    let reply = conn.read_packet().await?;
    if reply.first() == Some(&0xFF) {
        return Err(BackendError::HandshakeRejected {
            host: backend.host.clone(),
            port: backend.port,
            reason: String::from_utf8_lossy(&reply).into_owned(),
        });
    }

    let mut connection = BackendConnection {
        backend: backend.clone(),
        conn,
    };

    if let Some(database) = &options.database {
        connection.init_db(database).await?;
    }

    let autocommit_value = if options.autocommit && !options.two_pc {
        1
    } else {
        0
    };
    connection
        .exec_statement(&format!("SET SESSION autocommit={autocommit_value}"))
        .await?;

    Ok(connection)
}

impl BackendConnection {
    async fn init_db(&mut self, database: &str) -> BackendResult<()> {
        self.conn.reset_seq();
        let mut payload = Vec::with_capacity(database.len() + 1);
        payload.push(command::COM_INIT_DB);
        payload.extend_from_slice(database.as_bytes());
        self.conn.write_packet(&payload).await?;
        self.conn.flush().await?;
        let reply = self.conn.read_packet().await?;
        if reply.first() == Some(&0xFF) {
            return Err(BackendError::HandshakeRejected {
                host: self.backend.host.clone(),
                port: self.backend.port,
                reason: String::from_utf8_lossy(&reply).into_owned(),
            });
        }
        Ok(())
    }

    /// Send `COMMIT` or `ROLLBACK` as part of two-phase commit (spec.md
    /// §4.5 step 4). No result set is expected.
    pub async fn send_commit_or_rollback(&mut self, commit: bool) -> BackendResult<()> {
        let statement = if commit { "COMMIT" } else { "ROLLBACK" };
        self.exec_statement(statement).await
    }
}
