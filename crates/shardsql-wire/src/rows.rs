//! Result-set row streaming with bounded buffering.

use tokio::io::{AsyncRead, AsyncWrite, Unpin};

use crate::packet::{Conn, PacketSink, MAX_PACKET_LENGTH};
use crate::{Status, WireResult};

/// Read packets from `source` until an EOF marker is encountered (first
/// byte `0xFE` *and* the last read length strictly less than 8), forwarding
/// each packet to `sink`. Every [`MAX_PACKET_LENGTH`] bytes forwarded, the
/// sink is flushed to bound buffering; a final flush is always issued on
/// normal termination.
///
/// `field_count` is accepted for parity with the field-description phase
/// of the original result-set walk; forwarding and EOF detection here
/// depend only on the packet stream itself, not on the column count.
pub async fn stream_rows<R, W>(
    source: &mut Conn<R>,
    sink: &mut PacketSink<'_, W>,
    _field_count: u64,
    status: &mut Status,
) -> WireResult<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut forwarded_since_flush: u64 = 0;

    loop {
        let payload = source.read_packet().await?;
        let is_eof = payload.first() == Some(&0xFE) && source.last_read_len < 8;

        sink.write_packet(&payload).await?;
        forwarded_since_flush += payload.len() as u64;
        status.bytes_sent += payload.len() as u64;

        if is_eof {
            break;
        }

        if forwarded_since_flush >= MAX_PACKET_LENGTH as u64 {
            sink.flush().await?;
            forwarded_since_flush = 0;
        }
    }

    sink.flush().await?;
    Ok(())
}
