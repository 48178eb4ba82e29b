//! One client session: handshake, then a read-command loop relaying each
//! query through the dispatcher (spec.md §4.6).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use shardsql_dispatch::{ClientWriter, Dispatcher};
use shardsql_wire::{command, error_code, handshake, Conn, WireError};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const KEEPALIVE_RETRIES: u32 = 4;

/// Per-session tunables (spec.md §6's client-read-timeout configuration item).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(300),
        }
    }
}

/// Tune the accepted socket: disable Nagle's algorithm and set keepalive to
/// probes=4, idle=60s, interval=60s (spec.md §4.6 step 2).
fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_RETRIES);
    sock_ref.set_tcp_keepalive(&keepalive)
}

/// Drive one client connection end to end: handshake, then a read-command
/// loop until the client disconnects, sends `COM_QUIT`, a protocol
/// violation occurs, or `shutdown_rx` reports `true`. Never panics; every
/// failure path logs and returns.
pub async fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: SessionConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if let Err(e) = tune_socket(&stream) {
        tracing::warn!(%peer_addr, error = %e, "failed to tune accepted socket");
    }

    let mut conn = Conn::new(stream);
    if let Err(e) = handshake(&mut conn, peer_addr).await {
        tracing::warn!(%peer_addr, error = %e, "handshake failed");
        return;
    }

    let stream = conn.into_inner();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = Conn::new(read_half);
    let writer: ClientWriter = Arc::new(Mutex::new(Conn::new(write_half)));

    tracing::debug!(%peer_addr, "session established");

    loop {
        if *shutdown_rx.borrow() {
            tracing::debug!(%peer_addr, "session closing for daemon shutdown");
            break;
        }

        let outcome = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                tracing::debug!(%peer_addr, "session closing for daemon shutdown");
                break;
            }
            outcome = tokio::time::timeout(config.read_timeout, reader.read_packet()) => outcome,
        };
        let packet = match outcome {
            Ok(Ok(p)) => p,
            Ok(Err(WireError::Disconnected)) => {
                tracing::debug!(%peer_addr, "client disconnected");
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!(%peer_addr, error = %e, "protocol error reading command");
                break;
            }
            Err(_) => {
                tracing::debug!(%peer_addr, "client read timed out, closing session");
                break;
            }
        };

        // The socket was split into independent read/write halves, so the
        // writer's own sequence counter tracks nothing about the request
        // it's about to answer. Splice it onto the request's sequence — the
        // value `reader` advanced to on this read — so the reply continues
        // the single `NET.pkt_nr` a real client expects (spec.md §4.6).
        writer.lock().await.set_seq(reader.seq());

        let Some((&command_byte, body)) = packet.split_first() else {
            send_command_error(&writer, "empty command packet").await;
            break;
        };

        match command_byte {
            command::COM_QUERY => {
                if let Err(e) = dispatcher.dispatch(body, &writer).await {
                    tracing::warn!(%peer_addr, error = %e, "dispatch failed");
                    send_command_error(&writer, "dispatch failed").await;
                }
            }
            command::COM_PING => {
                let mut w = writer.lock().await;
                if w.send_ok(0, 0, 0).await.and(w.flush().await).is_err() {
                    break;
                }
            }
            command::COM_QUIT => {
                tracing::debug!(%peer_addr, "client sent COM_QUIT");
                break;
            }
            command::COM_INIT_DB => {
                // Single default-database assumption (spec.md §4.6 step 5):
                // the core has no per-session database switch.
                send_command_error(&writer, "COM_INIT_DB is not supported").await;
                break;
            }
            _ => {
                send_command_error(&writer, "unsupported command").await;
                break;
            }
        }
    }

    let mut w = writer.lock().await;
    let _ = w.get_mut().shutdown().await;
}

async fn send_command_error(writer: &ClientWriter, message: &str) {
    let mut w = writer.lock().await;
    let _ = w.send_error(error_code::ER_UNKNOWN_COM_ERROR, message).await;
    let _ = w.flush().await;
}
