//! Packet framing: `[len:3 LE][seq:1][payload]`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::lenenc;
use crate::{Status, WireError, WireResult};

/// Maximum payload size of a single physical packet (2^24 - 1), from
/// `sql/net_serv.cc` in the original MySQL client library.
pub const MAX_PACKET_LENGTH: u32 = (1 << 24) - 1;

/// A framed MySQL connection: a byte stream plus sequence-id bookkeeping
/// and a running byte/query status accumulator.
///
/// Generic over the transport so the same codec drives both the
/// client-facing socket and backend connections, and so tests can run it
/// over an in-memory duplex stream.
pub struct Conn<S> {
    stream: S,
    seq: u8,
    pub status: Status,
    /// Length of the most recently read packet's payload — needed by
    /// `stream_rows` to recognise the EOF marker (first byte 0xFE *and*
    /// length < 8).
    pub(crate) last_read_len: usize,
}

impl<S> Conn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            seq: 0,
            status: Status::default(),
            last_read_len: usize::MAX,
        }
    }

    /// Reset the sequence counter to zero, as happens at the start of each
    /// new client command.
    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    /// Current sequence counter: the id the next packet written (or read)
    /// on this connection will carry.
    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Set the sequence counter explicitly. Needed when a connection has
    /// been split into independent read/write halves (spec.md §4.6): the
    /// single shared `NET.pkt_nr` the wire protocol assumes must be
    /// reconstructed by copying the reader's sequence onto the writer
    /// before replying, since each half otherwise tracks its own.
    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: AsyncRead + Unpin + Send> Conn<S> {
    /// Read one physical packet. Detects client/backend disconnect as
    /// [`WireError::Disconnected`]. A packet whose first byte is `0xFF`
    /// and whose length is `<= 3` is treated as a protocol error
    /// (spec.md §4.2).
    pub async fn read_packet(&mut self) -> WireResult<Vec<u8>> {
        let mut header = [0u8; 4];
        if let Err(e) = self.stream.read_exact(&mut header).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(WireError::Disconnected);
            }
            return Err(WireError::Io(e));
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        self.seq = header[3].wrapping_add(1);

        let mut payload = vec![0u8; len];
        if len > 0 {
            self.stream
                .read_exact(&mut payload)
                .await
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        WireError::Disconnected
                    } else {
                        WireError::Io(e)
                    }
                })?;
        }

        self.status.bytes_recv += (4 + len) as u64;
        self.last_read_len = len;

        if len <= 3 && payload.first() == Some(&0xFF) {
            return Err(WireError::Protocol(
                "malformed error packet from peer".to_string(),
            ));
        }

        Ok(payload)
    }
}

impl<S: AsyncWrite + Unpin + Send> Conn<S> {
    /// Write one physical packet. Payloads larger than
    /// [`MAX_PACKET_LENGTH`] are split across multiple physical packets,
    /// the last of which may be zero-length if the payload is an exact
    /// multiple of the limit.
    pub async fn write_packet(&mut self, mut payload: &[u8]) -> WireResult<()> {
        loop {
            let chunk_len = payload.len().min(MAX_PACKET_LENGTH as usize);
            let chunk = &payload[..chunk_len];

            let mut header = [0u8; 4];
            header[..3].copy_from_slice(&(chunk_len as u32).to_le_bytes()[..3]);
            header[3] = self.seq;
            self.seq = self.seq.wrapping_add(1);

            self.stream.write_all(&header).await?;
            self.stream.write_all(chunk).await?;
            self.status.bytes_sent += (4 + chunk_len) as u64;

            payload = &payload[chunk_len..];
            if chunk_len < MAX_PACKET_LENGTH as usize {
                break;
            }
            if payload.is_empty() {
                // Exact multiple: emit the trailing empty packet.
                let mut header = [0u8; 4];
                header[3] = self.seq;
                self.seq = self.seq.wrapping_add(1);
                self.stream.write_all(&header).await?;
                self.status.bytes_sent += 4;
                break;
            }
        }
        Ok(())
    }

    /// Flush the write buffer. Idempotent when there is no destination.
    pub async fn flush(&mut self) -> WireResult<()> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Emit an OK packet: marker, affected rows, last insert id, status
    /// flags, warning count.
    pub async fn send_ok(
        &mut self,
        warnings: u16,
        affected_rows: u64,
        last_insert_id: u64,
    ) -> WireResult<()> {
        let mut payload = Vec::with_capacity(16);
        payload.push(0x00);
        lenenc::encode_int(&mut payload, affected_rows);
        lenenc::encode_int(&mut payload, last_insert_id);
        payload.extend_from_slice(&crate::status_flag::SERVER_STATUS_AUTOCOMMIT.to_le_bytes());
        payload.extend_from_slice(&warnings.to_le_bytes());
        self.write_packet(&payload).await
    }

    /// Emit an ERR packet: marker, error code, SQLSTATE marker+state, text.
    pub async fn send_error(&mut self, code: u16, text: &str) -> WireResult<()> {
        let mut payload = Vec::with_capacity(9 + text.len());
        payload.push(0xFF);
        payload.extend_from_slice(&code.to_le_bytes());
        payload.push(b'#');
        payload.extend_from_slice(b"HY000");
        payload.extend_from_slice(text.as_bytes());
        self.write_packet(&payload).await
    }

    /// Emit an EOF packet: marker, warning count (always 0 here), status.
    pub async fn send_eof(&mut self, status: u16) -> WireResult<()> {
        let mut payload = Vec::with_capacity(5);
        payload.push(0xFE);
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&status.to_le_bytes());
        self.write_packet(&payload).await
    }
}

/// Destination for forwarded packets: either a real connection, or a
/// discard sink used by non-reply-owning fan-out dispatch workers
/// (spec.md §4.5: "all others get a null sink that discards results").
pub enum PacketSink<'a, W> {
    Discard,
    Forward(&'a mut Conn<W>),
}

impl<'a, W: AsyncWrite + Unpin + Send> PacketSink<'a, W> {
    pub async fn write_packet(&mut self, payload: &[u8]) -> WireResult<()> {
        match self {
            PacketSink::Discard => Ok(()),
            PacketSink::Forward(conn) => conn.write_packet(payload).await,
        }
    }

    /// Idempotent when the sink discards (spec.md §4.2: "allowed: no
    /// destination").
    pub async fn flush(&mut self) -> WireResult<()> {
        match self {
            PacketSink::Discard => Ok(()),
            PacketSink::Forward(conn) => conn.flush().await,
        }
    }
}
