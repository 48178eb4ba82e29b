//! End-to-end scenarios driving a real client socket through a real
//! session against fake backends (spec.md §8 scenarios 1, 2, 7, 8).

use std::sync::Arc;
use std::time::Duration;

use shardsql_backend::{BackendOptions, BackendRegistry};
use shardsql_dispatch::Dispatcher;
use shardsql_mapper::ReadOneWriteAll;
use shardsql_relay::{run_session, SessionConfig};
use shardsql_wire::{capability, command, Conn as WireConn};
use tokio::net::{TcpListener, TcpStream};

/// A backend that answers `SELECT 1` with one field, one row, both
/// terminated by EOF, and everything else with a plain OK.
async fn spawn_select_capable_backend() -> std::net::SocketAddr {
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
                    let Ok(body) = conn.read_packet().await else {
                        break;
                    };
                    let query = &body[1..];
                    if query.eq_ignore_ascii_case(b"SELECT 1") {
                        conn.reset_seq();
                        conn.write_packet(&[0x01]).await.unwrap(); // one column
                        conn.write_packet(b"field:1").await.unwrap();
                        conn.send_eof(0).await.unwrap();
                        conn.write_packet(b"row:1").await.unwrap();
                        conn.send_eof(0).await.unwrap();
                        conn.flush().await.unwrap();
                    } else {
                        conn.reset_seq();
                        conn.send_ok(0, 1, 0).await.unwrap();
                        conn.flush().await.unwrap();
                    }
                }
            });
        }
    });
    addr
}

fn handshake_response_packet() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&capability::CLIENT_BASIC_FLAGS.to_le_bytes());
    buf.extend_from_slice(&(16 * 1024 * 1024u32).to_le_bytes());
    buf.push(33);
    buf.extend_from_slice(&[0u8; 23]);
    buf.extend_from_slice(b"tester\0");
    buf.push(0);
    buf
}

async fn connect_and_handshake(server_addr: std::net::SocketAddr) -> WireConn<TcpStream> {
    let stream = TcpStream::connect(server_addr).await.unwrap();
    let mut client = WireConn::new(stream);
    let _greeting = client.read_packet().await.unwrap();
    client
        .write_packet(&handshake_response_packet())
        .await
        .unwrap();
    client.flush().await.unwrap();
    let reply = client.read_packet().await.unwrap();
    assert_eq!(reply.first(), Some(&0x00), "handshake OK expected");
    client
}

async fn spawn_session(
    registry: Arc<BackendRegistry>,
    add_ids: bool,
    two_pc: bool,
    mapper: Option<Arc<ReadOneWriteAll>>,
) -> std::net::SocketAddr {
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        mapper.map(|m| m as Arc<dyn shardsql_mapper::QueryMapper>),
        add_ids,
        two_pc,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        run_session(stream, peer, dispatcher, SessionConfig::default(), shutdown_rx).await;
    });
    server_addr
}

async fn send_query(client: &mut WireConn<TcpStream>, query: &str) {
    client.reset_seq();
    let mut body = vec![command::COM_QUERY];
    body.extend_from_slice(query.as_bytes());
    client.write_packet(&body).await.unwrap();
    client.flush().await.unwrap();
}

/// Scenario 1: a `SELECT` against a single backend returns the field, row,
/// and terminating EOF packets byte-identical to what the backend sent.
#[tokio::test]
async fn simple_select_through_single_backend() {
    let backend_addr = spawn_select_capable_backend().await;
    let registry = Arc::new(
        BackendRegistry::load_initial(
            &format!("{}:{}", backend_addr.ip(), backend_addr.port()),
            BackendOptions {
                user: "proxy".to_string(),
                password: String::new(),
                database: None,
                autocommit: true,
                two_pc: false,
            },
            2,
            2,
        )
        .await
        .unwrap(),
    );
    let server_addr = spawn_session(registry, false, false, Some(Arc::new(ReadOneWriteAll))).await;
    let mut client = connect_and_handshake(server_addr).await;

    send_query(&mut client, "SELECT 1").await;
    let field_count = client.read_packet().await.unwrap();
    assert_eq!(field_count, vec![0x01]);
    let field = client.read_packet().await.unwrap();
    assert_eq!(field, b"field:1");
    let eof1 = client.read_packet().await.unwrap();
    assert_eq!(eof1.first(), Some(&0xFE));
    let row = client.read_packet().await.unwrap();
    assert_eq!(row, b"row:1");
    let eof2 = client.read_packet().await.unwrap();
    assert_eq!(eof2.first(), Some(&0xFE));
}

/// Scenario 2: a write fans out to both backends without two-phase commit;
/// the client sees exactly one OK and the session survives to answer a
/// second query.
#[tokio::test]
async fn fan_out_write_without_two_phase_commit() {
    let backend_a = spawn_select_capable_backend().await;
    let backend_b = spawn_select_capable_backend().await;
    let registry = Arc::new(
        BackendRegistry::load_initial(
            &format!(
                "{}:{} {}:{}",
                backend_a.ip(),
                backend_a.port(),
                backend_b.ip(),
                backend_b.port()
            ),
            BackendOptions {
                user: "proxy".to_string(),
                password: String::new(),
                database: None,
                autocommit: true,
                two_pc: false,
            },
            2,
            2,
        )
        .await
        .unwrap(),
    );
    let server_addr = spawn_session(registry, false, false, Some(Arc::new(ReadOneWriteAll))).await;
    let mut client = connect_and_handshake(server_addr).await;

    send_query(&mut client, "INSERT INTO t VALUES(1)").await;
    let reply = tokio::time::timeout(Duration::from_secs(2), client.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.first(), Some(&0x00), "client sees exactly one OK");

    send_query(&mut client, "SELECT 1").await;
    let field_count = tokio::time::timeout(Duration::from_secs(2), client.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(field_count, vec![0x01], "session still answers queries after fan-out");
}

/// Scenario 7: `COM_INIT_DB` is rejected and the session closes cleanly.
#[tokio::test]
async fn com_init_db_closes_the_session_without_crashing() {
    let backend_addr = spawn_select_capable_backend().await;
    let registry = Arc::new(
        BackendRegistry::load_initial(
            &format!("{}:{}", backend_addr.ip(), backend_addr.port()),
            BackendOptions {
                user: "proxy".to_string(),
                password: String::new(),
                database: None,
                autocommit: true,
                two_pc: false,
            },
            1,
            1,
        )
        .await
        .unwrap(),
    );
    let server_addr = spawn_session(registry, false, false, Some(Arc::new(ReadOneWriteAll))).await;
    let mut client = connect_and_handshake(server_addr).await;

    client.reset_seq();
    client
        .write_packet(&[command::COM_INIT_DB, b'd', b'b'])
        .await
        .unwrap();
    client.flush().await.unwrap();

    let reply = client.read_packet().await.unwrap();
    assert_eq!(reply.first(), Some(&0xFF), "COM_INIT_DB is rejected with an error");

    // The session tears down; a further read observes disconnect rather
    // than a hang.
    let outcome = tokio::time::timeout(Duration::from_secs(2), client.read_packet()).await;
    assert!(outcome.is_ok(), "session must close promptly, not hang");
}

/// Scenario 8: with no mapper configured, every query — including a write —
/// routes to a single backend rather than fanning out.
#[tokio::test]
async fn mapper_absent_routes_every_query_to_one_backend() {
    let backend_a = spawn_select_capable_backend().await;
    let backend_b = spawn_select_capable_backend().await;
    let registry = Arc::new(
        BackendRegistry::load_initial(
            &format!(
                "{}:{} {}:{}",
                backend_a.ip(),
                backend_a.port(),
                backend_b.ip(),
                backend_b.port()
            ),
            BackendOptions {
                user: "proxy".to_string(),
                password: String::new(),
                database: None,
                autocommit: true,
                two_pc: false,
            },
            2,
            2,
        )
        .await
        .unwrap(),
    );
    let server_addr = spawn_session(registry, false, false, None).await;
    let mut client = connect_and_handshake(server_addr).await;

    send_query(&mut client, "INSERT INTO t VALUES(1)").await;
    let reply = tokio::time::timeout(Duration::from_secs(2), client.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.first(), Some(&0x00));
}
