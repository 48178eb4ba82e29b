//! The acceptor: binds the listening socket and drives the accept loop,
//! reacting to shutdown and reload signals (spec.md §4.7).

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use shardsql_backend::{BackendRegistry, BackendSource};
use shardsql_dispatch::Dispatcher;
use shardsql_pool::Pool as LockPool;

use crate::session::{run_session, SessionConfig};

pub struct AcceptorConfig {
    pub bind_addr: SocketAddr,
    pub client_workers: usize,
    pub session: SessionConfig,
    pub backend_source: BackendSource,
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Accept connections until told to shut down, applying admission control
/// via a fixed-size client-worker pool and reacting to `SIGUSR1`/`SIGUSR2`
/// reload signals. Returns once `shutdown_rx` reports `true` and every
/// session spawned before that point has run to completion (spec.md §4.7's
/// drain-before-teardown requirement — a caller that tears down the
/// backend registry right after this returns must not race an orphaned
/// session still using it).
pub async fn run_acceptor(
    config: AcceptorConfig,
    registry: Arc<BackendRegistry>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = bind_listener(config.bind_addr)?;
    tracing::info!(addr = %config.bind_addr, "acceptor listening");

    let worker_pool =
        LockPool::new(config.client_workers).expect("client-worker pool size must be non-zero");

    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    let mut session_handles: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("acceptor draining on shutdown signal");
                    break;
                }
            }

            _ = sigusr1.recv() => {
                reload_backends(&registry, &config.backend_source).await;
            }
            _ = sigusr2.recv() => {
                reload_backends(&registry, &config.backend_source).await;
            }

            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                // Admission control: block until a client-worker slot is
                // free before spawning the session (spec.md §4.7).
                let slot = worker_pool.acquire().await;
                let release_pool = worker_pool.clone();
                let dispatcher = Arc::clone(&dispatcher);
                let session_config = config.session.clone();
                let session_shutdown = shutdown_rx.clone();
                session_handles.retain(|h| !h.is_finished());
                session_handles.push(tokio::spawn(async move {
                    run_session(stream, peer_addr, dispatcher, session_config, session_shutdown).await;
                    release_pool.release(slot).await;
                }));
            }
        }
    }

    tracing::info!(
        sessions = session_handles.len(),
        "waiting for in-flight sessions to drain"
    );
    for handle in session_handles {
        let _ = handle.await;
    }

    Ok(())
}

/// Reload the backend registry from its configured source. `reload` itself
/// waits for `querying == 0` before touching any per-backend state, so the
/// "wait until quiescent, then reload" half of spec.md §4.7's signal
/// handling lives there, not here.
async fn reload_backends(registry: &Arc<BackendRegistry>, source: &BackendSource) {
    tracing::info!("reload signal received");
    let text = match source.resolve() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "failed to read backend source for reload");
            return;
        }
    };
    if let Err(e) = registry.reload(&text).await {
        tracing::error!(error = %e, "backend reload failed");
    }
}
