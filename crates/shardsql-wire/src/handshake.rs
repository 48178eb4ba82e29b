//! Connection handshake (spec.md §4.2, §6).
//!
//! Authentication always succeeds in the core; a real policy (native
//! password verification, or outright refusal) is meant to be layered on
//! top later (spec.md §9 Open Questions).

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, Unpin};

use crate::capability::CLIENT_BASIC_FLAGS;
use crate::packet::Conn;
use crate::status_flag::SERVER_STATUS_AUTOCOMMIT;
use crate::{WireError, WireResult};

const PROTOCOL_VERSION: u8 = 10;
const SERVER_VERSION: &str = "8.0-shardsql";
const DEFAULT_CHARSET: u8 = 33; // utf8_general_ci
const SCRAMBLE_LEN_1: usize = 8;
const SCRAMBLE_LEN_2: usize = 12;
const MIN_HANDSHAKE_RESPONSE: usize = 32;

/// What the client told us during the handshake response.
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub capabilities: u32,
    pub charset: u8,
    pub username: String,
    pub database: Option<String>,
}

fn random_scramble(len: usize) -> Vec<u8> {
    // Printable ASCII, matching `create_random_string` in the original.
    (0..len)
        .map(|_| (fastrand::u8(33..127)))
        .collect()
}

fn read_c_string(buf: &[u8], start: usize) -> WireResult<(String, usize)> {
    let end = buf[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| WireError::Protocol("unterminated string in handshake response".into()))?;
    let s = String::from_utf8_lossy(&buf[start..start + end]).into_owned();
    Ok((s, start + end + 1))
}

/// Perform the server side of the handshake: write the greeting, read and
/// parse the client's response, then send an OK (auth always succeeds).
pub async fn handshake<S>(conn: &mut Conn<S>, _peer_addr: SocketAddr) -> WireResult<ClientHello>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let scramble_1 = random_scramble(SCRAMBLE_LEN_1);
    let scramble_2 = random_scramble(SCRAMBLE_LEN_2);

    let mut greeting = Vec::with_capacity(64);
    greeting.push(PROTOCOL_VERSION);
    greeting.extend_from_slice(SERVER_VERSION.as_bytes());
    greeting.push(0); // server_version terminator
    greeting.extend_from_slice(&0u32.to_le_bytes()); // thread-id placeholder
    greeting.extend_from_slice(&scramble_1);
    greeting.push(0); // filler
    greeting.extend_from_slice(&(CLIENT_BASIC_FLAGS as u16).to_le_bytes());
    greeting.push(DEFAULT_CHARSET);
    greeting.extend_from_slice(&SERVER_STATUS_AUTOCOMMIT.to_le_bytes());
    greeting.extend_from_slice(&((CLIENT_BASIC_FLAGS >> 16) as u16).to_le_bytes());
    greeting.push(0); // auth-plugin-data-len (unused)
    greeting.extend_from_slice(&[0u8; 10]); // reserved
    greeting.extend_from_slice(&scramble_2);
    greeting.push(0); // scramble_2 terminator

    conn.write_packet(&greeting).await?;
    conn.flush().await?;

    let resp = conn.read_packet().await?;
    if resp.len() < MIN_HANDSHAKE_RESPONSE {
        return Err(WireError::Protocol(format!(
            "handshake response too short: {} bytes",
            resp.len()
        )));
    }

    let client_caps = u32::from_le_bytes([resp[0], resp[1], resp[2], resp[3]]);
    let effective_caps = client_caps & CLIENT_BASIC_FLAGS;
    let charset = resp[8];

    let mut pos = 32;
    let (username, next) = read_c_string(&resp, pos)?;
    pos = next;

    let password_len = *resp
        .get(pos)
        .ok_or_else(|| WireError::Protocol("truncated auth response".into()))?
        as usize;
    pos += 1;
    if pos + password_len > resp.len() {
        return Err(WireError::Protocol(
            "client sent oversized auth packet".to_string(),
        ));
    }
    pos += password_len;

    let database = if effective_caps & crate::capability::CLIENT_CONNECT_WITH_DB != 0 && pos < resp.len() {
        let (db, _) = read_c_string(&resp, pos)?;
        Some(db)
    } else {
        None
    };

    // Authentication always succeeds in the core.
    conn.send_ok(0, 0, 0).await?;
    conn.flush().await?;

    Ok(ClientHello {
        capabilities: effective_caps,
        charset,
        username,
        database,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    fn build_handshake_response(user: &str, password: &[u8], db: Option<&str>) -> Vec<u8> {
        let mut buf = Vec::new();
        let caps = CLIENT_BASIC_FLAGS
            | if db.is_some() {
                crate::capability::CLIENT_CONNECT_WITH_DB
            } else {
                0
            };
        buf.extend_from_slice(&caps.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // max packet size
        buf.push(33); // charset
        buf.extend_from_slice(&[0u8; 23]); // reserved
        buf.extend_from_slice(user.as_bytes());
        buf.push(0);
        buf.push(password.len() as u8);
        buf.extend_from_slice(password);
        if let Some(db) = db {
            buf.extend_from_slice(db.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[tokio::test]
    async fn full_handshake_round_trip() {
        let (client_side, server_side) = duplex(8192);
        let addr: SocketAddr = "127.0.0.1:3306".parse().unwrap();

        let server_task = tokio::spawn(async move {
            let mut conn = Conn::new(server_side);
            handshake(&mut conn, addr).await
        });

        // Act as the client: read the greeting, send a response, read OK.
        let mut client_conn = Conn::new(client_side);
        let greeting = client_conn.read_packet().await.unwrap();
        assert_eq!(greeting[0], PROTOCOL_VERSION);

        let response = build_handshake_response("alice", b"secret", Some("appdb"));
        client_conn.write_packet(&response).await.unwrap();
        client_conn.flush().await.unwrap();

        let ok = client_conn.read_packet().await.unwrap();
        assert_eq!(ok[0], 0x00);

        let hello = server_task.await.unwrap().unwrap();
        assert_eq!(hello.username, "alice");
        // Server never advertises CLIENT_CONNECT_WITH_DB, so even though
        // the client tried to set it, the effective flag is stripped.
        assert_eq!(
            hello.capabilities & crate::capability::CLIENT_CONNECT_WITH_DB,
            0
        );
    }

    #[tokio::test]
    async fn oversized_password_length_is_rejected() {
        let (client_side, server_side) = duplex(8192);
        let addr: SocketAddr = "127.0.0.1:3306".parse().unwrap();

        let server_task = tokio::spawn(async move {
            let mut conn = Conn::new(server_side);
            handshake(&mut conn, addr).await
        });

        let mut client_conn = Conn::new(client_side);
        let _greeting = client_conn.read_packet().await.unwrap();

        let mut response = build_handshake_response("bob", b"", None);
        // Claim a password length far beyond the packet's actual size.
        let password_len_pos = 32 + "bob".len() + 1;
        response[password_len_pos] = 250;
        client_conn.write_packet(&response).await.unwrap();
        client_conn.flush().await.unwrap();
        client_conn.get_mut().shutdown().await.ok();

        let result = server_task.await.unwrap();
        assert!(result.is_err());
    }
}
