//! The dispatcher: mapper-driven routing, ANY single-backend relay, ALL
//! fan-out with optional two-phase commit (spec.md §4.5, §8).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use shardsql_backend::{
    acquire_connection, forward_result_stream, pick_random_backend, release_connection,
    BackendRegistry, CommitContext, ConnSlot, ReplyTarget, WorkItem,
};
use shardsql_mapper::{MapDecision, QueryMapper};
use shardsql_wire::{Conn, PacketSink};

use crate::error::{DispatchError, DispatchResult};

/// A client connection's write half, shared between the session task (which
/// reads the next command once a query completes) and whichever fan-out
/// worker ends up owning the reply for a given ALL-branch query.
pub type ClientWriter = Arc<Mutex<Conn<WriteHalf<TcpStream>>>>;

/// Routes one query to the right backend(s) and relays the result back to
/// the client. Holds no per-query state itself; everything it needs travels
/// through the call.
pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    mapper: Option<Arc<dyn QueryMapper>>,
    add_ids: bool,
    two_pc: bool,
    next_txn_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<BackendRegistry>,
        mapper: Option<Arc<dyn QueryMapper>>,
        add_ids: bool,
        two_pc: bool,
    ) -> Self {
        Self {
            registry,
            mapper,
            add_ids,
            two_pc,
            next_txn_id: AtomicU64::new(0),
        }
    }

    /// Route and execute `query`, relaying the result to `client`.
    ///
    /// Held for the duration of this call: a [`shardsql_backend::QueryGuard`]
    /// marking the call as in-flight, so a concurrent reload cannot cancel
    /// the dispatch workers this call is about to use (spec.md §8).
    pub async fn dispatch(&self, query: &[u8], client: &ClientWriter) -> DispatchResult<()> {
        let _guard = self.registry.begin_query();

        let decision = self
            .mapper
            .as_ref()
            .map(|m| m.map(query))
            .unwrap_or(MapDecision::Any { rewritten: None });

        let effective_query: Vec<u8> = decision
            .rewritten()
            .map(|r| r.to_vec())
            .unwrap_or_else(|| query.to_vec());

        let snapshot = self.registry.snapshot().await;

        // Single-backend shortcut (spec.md §4.5 step 4): with exactly one
        // backend there is nothing to fan out to, regardless of the
        // mapper's tag.
        let route_all = snapshot.len() > 1 && matches!(decision, MapDecision::All { .. });

        if !route_all {
            let idx = pick_random_backend(&snapshot);
            let acquired = acquire_connection(&snapshot, idx).await;
            let result = relay_any(&acquired.slot, &effective_query, client).await;
            release_connection(&snapshot, idx, acquired).await;
            return result;
        }

        let mut all_query = effective_query;
        if self.add_ids {
            let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
            all_query.extend_from_slice(format!(" -- {id}").as_bytes());
        }

        let backend_count = snapshot.len();
        let commit_ctx = Arc::new(CommitContext::new(backend_count, self.two_pc));
        let start = pick_random_backend(&snapshot);

        for step in 0..backend_count {
            let idx = (start + step) % backend_count;
            let slot = &snapshot[idx];
            let worker_idx = slot.worker_pool.acquire().await;

            let reply = if step == 0 {
                ReplyTarget::Owning(Arc::clone(client))
            } else {
                ReplyTarget::Discard
            };

            let item = WorkItem {
                query: all_query.clone(),
                reply,
                commit: Arc::clone(&commit_ctx),
                result_index: step,
            };

            // Unreachable in normal operation: the QueryGuard held above
            // prevents a reload from cancelling any worker in `snapshot`
            // for the lifetime of this call, so every worker's mailbox is
            // still open. Surfaced as an error rather than a panic in case
            // that invariant is ever violated elsewhere.
            if slot.workers[worker_idx].send(item).is_err() {
                tracing::error!(
                    backend = %slot.backend.host,
                    port = slot.backend.port,
                    "dispatch worker mailbox closed while fanning out"
                );
                return Err(DispatchError::WorkerGone {
                    host: slot.backend.host.clone(),
                    port: slot.backend.port,
                });
            }
        }

        commit_ctx.barrier.wait().await;

        if !commit_ctx.all_succeeded() {
            tracing::warn!("fan-out query did not succeed on every backend");
        }

        Ok(())
    }
}

async fn relay_any(
    slot: &ConnSlot,
    query: &[u8],
    client: &ClientWriter,
) -> DispatchResult<()> {
    let mut connection = slot.lock().await;
    connection.send_query(query).await?;
    let first_packet = connection.conn_mut().read_packet().await?;

    let mut client_conn = client.lock().await;
    let mut sink = PacketSink::Forward(&mut client_conn);
    forward_result_stream(connection.conn_mut(), &first_packet, &mut sink).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardsql_backend::BackendOptions;
    use shardsql_mapper::ReadOneWriteAll;
    use shardsql_wire::Conn as WireConn;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    async fn spawn_fake_backend() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut conn = WireConn::new(stream);
                    conn.write_packet(b"\x0a8.0-fake\0\0\0\0\0").await.unwrap();
                    conn.flush().await.unwrap();
                    loop {
                        match conn.read_packet().await {
                            Ok(_) => {
                                conn.send_ok(0, 0, 0).await.unwrap();
                                conn.flush().await.unwrap();
                            }
                            Err(_) => break,
                        }
                    }
                });
            }
        });
        addr
    }

    fn test_options() -> BackendOptions {
        BackendOptions {
            user: "proxy".to_string(),
            password: String::new(),
            database: None,
            autocommit: true,
            two_pc: false,
        }
    }

    #[tokio::test]
    async fn any_query_against_single_backend_relays_ok() {
        let addr = spawn_fake_backend().await;
        let source = format!("{}:{}", addr.ip(), addr.port());
        let registry = Arc::new(
            BackendRegistry::load_initial(&source, test_options(), 2, 1)
                .await
                .unwrap(),
        );
        let dispatcher = Dispatcher::new(registry, Some(Arc::new(ReadOneWriteAll)), false, false);

        let (client_side, server_side) = duplex(4096);
        let (_read_half, write_half) = tokio::io::split(server_side);
        let client: ClientWriter = Arc::new(Mutex::new(Conn::new(write_half)));

        dispatcher
            .dispatch(b"select 1", &client)
            .await
            .unwrap();

        drop(client);
        let mut reader = Conn::new(client_side);
        let reply = reader.read_packet().await.unwrap();
        assert_eq!(reply.first(), Some(&0x00));
    }

    #[tokio::test]
    async fn all_query_fans_out_to_every_backend() {
        let addr1 = spawn_fake_backend().await;
        let addr2 = spawn_fake_backend().await;
        let source = format!("{}:{} {}:{}", addr1.ip(), addr1.port(), addr2.ip(), addr2.port());
        let registry = Arc::new(
            BackendRegistry::load_initial(&source, test_options(), 1, 1)
                .await
                .unwrap(),
        );
        let dispatcher = Dispatcher::new(registry, Some(Arc::new(ReadOneWriteAll)), false, false);

        let (client_side, server_side) = duplex(4096);
        let (_read_half, write_half) = tokio::io::split(server_side);
        let client: ClientWriter = Arc::new(Mutex::new(Conn::new(write_half)));

        dispatcher
            .dispatch(b"insert into t values (1)", &client)
            .await
            .unwrap();

        drop(client);
        let mut reader = Conn::new(client_side);
        let reply = reader.read_packet().await.unwrap();
        assert_eq!(reply.first(), Some(&0x00));
    }

    #[tokio::test]
    async fn single_backend_forces_any_routing_even_for_a_write() {
        let addr = spawn_fake_backend().await;
        let source = format!("{}:{}", addr.ip(), addr.port());
        let registry = Arc::new(
            BackendRegistry::load_initial(&source, test_options(), 1, 1)
                .await
                .unwrap(),
        );
        // With one backend, an ALL-tagged write still completes via the
        // ANY path (no fan-out workers are ever acquired).
        let dispatcher = Dispatcher::new(registry, Some(Arc::new(ReadOneWriteAll)), false, false);

        let (client_side, server_side) = duplex(4096);
        let (_read_half, write_half) = tokio::io::split(server_side);
        let client: ClientWriter = Arc::new(Mutex::new(Conn::new(write_half)));

        dispatcher
            .dispatch(b"delete from t", &client)
            .await
            .unwrap();

        drop(client);
        let mut reader = Conn::new(client_side);
        let reply = reader.read_packet().await.unwrap();
        assert_eq!(reply.first(), Some(&0x00));
    }
}
