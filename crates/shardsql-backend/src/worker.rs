//! Dispatch workers: long-lived tasks bound to one backend index, each
//! holding its own dedicated connection (spec.md §3 "Dispatch worker",
//! §4.5 "Per-worker protocol for the ALL branch").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Barrier, Mutex};
use tokio::task::JoinHandle;

use shardsql_wire::{error_code, Conn, PacketSink, Status, WireResult};

use crate::connection::BackendConnection;

/// Where a fan-out worker's reply goes: exactly one participating worker
/// per query owns the client's socket; all others discard (spec.md §4.5
/// step 5: "all others get a null sink that discards results").
pub enum ReplyTarget {
    Owning(Arc<Mutex<Conn<WriteHalf<TcpStream>>>>),
    Discard,
}

/// Shared state for one fan-out query (spec.md §3 "Commit context").
pub struct CommitContext {
    pub barrier: Barrier,
    pub backend_count: usize,
    pub results: Arc<[AtomicBool]>,
    pub two_pc: bool,
}

impl CommitContext {
    pub fn new(backend_count: usize, two_pc: bool) -> Self {
        let results = (0..backend_count)
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into();
        Self {
            barrier: Barrier::new(backend_count + 1),
            backend_count,
            results,
            two_pc,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|b| b.load(Ordering::Acquire))
    }
}

/// One unit of fan-out work handed to a dispatch worker's mailbox.
pub struct WorkItem {
    pub query: Vec<u8>,
    pub reply: ReplyTarget,
    pub commit: Arc<CommitContext>,
    pub result_index: usize,
}

/// Handle to a running dispatch worker: a mailbox to send it work, and a
/// join handle used for cancellation during a backend reload (spec.md §9
/// REDESIGN FLAGS: "the replacement should use a join on the worker's task
/// handle" rather than the legacy double-lock cancellation dance).
///
/// `cancel` takes `&self` rather than consuming the handle so it can be
/// called through the `Arc<DispatchWorkerHandle>` that both the registry
/// and any dispatcher holding an older snapshot may share; the join handle
/// is taken by whichever caller gets there first.
pub struct DispatchWorkerHandle {
    mailbox: mpsc::UnboundedSender<WorkItem>,
    shutdown: mpsc::UnboundedSender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchWorkerHandle {
    pub fn send(&self, item: WorkItem) -> Result<(), WorkItem> {
        self.mailbox.send(item).map_err(|e| e.0)
    }

    /// Cancel the worker: send it a shutdown signal and join its task.
    pub async fn cancel(&self) {
        let _ = self.shutdown.send(());
        let taken = {
            let mut guard = self.handle.lock().await;
            guard.take()
        };
        if let Some(handle) = taken {
            let _ = handle.await;
        }
    }
}

/// Relay one backend reply to `sink`: the first packet verbatim, then — if
/// it isn't a bare OK/ERR — the field-definitions and row sections of a
/// result set. Shared by the ALL-branch workers below and the ANY-branch
/// single-backend path in `shardsql-dispatch`.
pub async fn forward_result_stream(
    conn: &mut Conn<TcpStream>,
    first_packet: &[u8],
    sink: &mut PacketSink<'_, WriteHalf<TcpStream>>,
) -> WireResult<()> {
    sink.write_packet(first_packet).await?;
    sink.flush().await?;

    let is_ok_or_err = matches!(first_packet.first(), Some(0x00) | Some(0xFF));
    if is_ok_or_err {
        return Ok(());
    }

    // Column-count packet: a result set follows — field descriptions
    // terminated by EOF, then rows terminated by EOF.
    let mut status = Status::default();
    shardsql_wire::stream_rows(conn, sink, 0, &mut status).await?;
    shardsql_wire::stream_rows(conn, sink, 0, &mut status).await?;
    Ok(())
}

/// Spawn a dispatch worker bound to `result_index` within its backend's
/// commit contexts, driving `connection` for the lifetime of the task.
pub fn spawn_dispatch_worker(
    mut connection: BackendConnection,
) -> (DispatchWorkerHandle, mpsc::UnboundedReceiver<()>) {
    let (work_tx, mut work_rx) = mpsc::unbounded_channel::<WorkItem>();
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();
    let (idle_tx, idle_rx) = mpsc::unbounded_channel::<()>();

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    connection.shutdown().await;
                    break;
                }
                maybe_item = work_rx.recv() => {
                    let Some(item) = maybe_item else { break };
                    run_one(&mut connection, item).await;
                    // Signal the registry's worker pool that this slot is
                    // idle again (the registry owns the actual pool index
                    // release; this channel only wakes it up to do so).
                    let _ = idle_tx.send(());
                }
            }
        }
    });

    (
        DispatchWorkerHandle {
            mailbox: work_tx,
            shutdown: shutdown_tx,
            handle: Mutex::new(Some(handle)),
        },
        idle_rx,
    )
}

async fn run_one(connection: &mut BackendConnection, item: WorkItem) {
    let WorkItem {
        query,
        reply,
        commit,
        result_index,
    } = item;

    let send_result = connection.send_query(&query).await;
    let first_packet = match send_result {
        Ok(()) => connection.conn_mut().read_packet().await,
        Err(e) => Err(e.into()),
    };

    let first_packet = match first_packet {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(backend = %connection.backend().host, error = %e, "fan-out worker failed before reaching barrier");
            commit.barrier.wait().await;
            return;
        }
    };

    let succeeded = first_packet.first() != Some(&0xFF);
    commit.results[result_index].store(succeeded, Ordering::Release);
    commit.barrier.wait().await;

    if commit.two_pc {
        let overall = commit.all_succeeded();
        if let Err(e) = connection.send_commit_or_rollback(overall).await {
            tracing::warn!(backend = %connection.backend().host, error = %e, "commit/rollback failed");
        }
        if let ReplyTarget::Owning(client) = &reply {
            let mut client_conn = client.lock().await;
            let result = if overall {
                client_conn.send_ok(0, 0, 0).await
            } else {
                client_conn
                    .send_error(error_code::ER_ERROR_DURING_COMMIT, "two-phase commit failed")
                    .await
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to reply to client after two-phase commit");
            }
            let _ = client_conn.flush().await;
        }
        return;
    }

    match reply {
        ReplyTarget::Owning(client) => {
            let mut client_conn = client.lock().await;
            let mut sink = PacketSink::Forward(&mut client_conn);
            if let Err(e) = forward_result_stream(connection.conn_mut(), &first_packet, &mut sink).await {
                tracing::warn!(error = %e, "failed forwarding fan-out result to client");
            }
        }
        ReplyTarget::Discard => {
            let mut sink: PacketSink<'_, WriteHalf<TcpStream>> = PacketSink::Discard;
            if let Err(e) = forward_result_stream(connection.conn_mut(), &first_packet, &mut sink).await {
                tracing::warn!(error = %e, "failed draining non-owning fan-out result");
            }
        }
    }
}
