//! Newline-delimited JSON codec for control messages.
//!
//! Each logical message is one JSON object on a single `\n`-terminated
//! line. The decoder:
//! - returns `Ok(None)` while a line is incomplete (buffer unchanged);
//! - consumes a malformed line before reporting the error, so the caller
//!   can log and keep reading without losing frame sync;
//! - bounds line length at [`MAX_FRAME_SIZE`].
//!
//! [`LineReader`] wraps a read half plus its buffer; after the first frame
//! of a data connection is decoded, `into_parts` hands back any buffered
//! bytes so pipelined payload is forwarded without reframing.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use crate::protocol::Message;

/// Encode a message as one newline-terminated JSON line.
pub fn encode(msg: &Message) -> Result<Bytes> {
    let mut line = serde_json::to_vec(msg).map_err(|e| Error::codec(format!("serialization failed: {e}")))?;

    if line.len() >= MAX_FRAME_SIZE {
        return Err(Error::codec(format!(
            "frame too large: {} bytes (max {})",
            line.len(),
            MAX_FRAME_SIZE
        )));
    }

    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Decode one message from the buffer.
///
/// Returns:
/// - `Ok(Some(msg))` if a complete line was decoded (line consumed)
/// - `Ok(None)` if no complete line is buffered yet (buffer unchanged)
/// - `Err` if a complete line failed to parse (line consumed) or the
///   buffered prefix exceeds the frame size bound
///
/// Empty lines are skipped.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>> {
    loop {
        let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_FRAME_SIZE {
                return Err(Error::codec(format!(
                    "unterminated frame exceeds {MAX_FRAME_SIZE} bytes"
                )));
            }
            return Ok(None);
        };

        let line = buf.split_to(pos + 1);
        let segment = trim_line(&line[..pos]);
        if segment.is_empty() {
            continue;
        }

        return serde_json::from_slice(segment)
            .map(Some)
            .map_err(|e| Error::codec(format!("malformed frame: {e}")));
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Serialize and write one message. Callers that share a socket between
/// tasks must funnel through a single writer so lines never interleave.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered message reader over the read half of a control or data socket.
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` on clean EOF. Malformed lines surface as `Err`
    /// with the line already consumed, so the caller may log and call
    /// again.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            match decode(&mut self.buf) {
                Ok(Some(msg)) => return Ok(Some(msg)),
                Ok(None) => {}
                Err(e) => return Err(e),
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.iter().all(|&b| b == b'\n' || b == b'\r') {
                    return Ok(None);
                }
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Hand back the underlying reader and any bytes buffered beyond the
    /// last decoded frame. Those bytes belong to the tunneled payload on a
    /// data connection.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionId, ConnectionRefPayload, ControlHandshakePayload};

    fn handshake(token: &str) -> Message {
        Message::ControlHandshake(ControlHandshakePayload {
            token: token.into(),
        })
    }

    #[test]
    fn encode_terminates_with_newline() {
        let frame = encode(&Message::Heartbeat {}).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn decode_partial_returns_none() {
        let mut buf = BytesMut::from(&br#"{"type":"heart"#[..]);
        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 14);
    }

    #[test]
    fn decode_multiple_messages_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&handshake("a")).unwrap());
        buf.extend_from_slice(&encode(&Message::Heartbeat {}).unwrap());
        buf.extend_from_slice(&encode(&Message::HeartbeatAck {}).unwrap());

        assert_eq!(decode(&mut buf).unwrap().unwrap(), handshake("a"));
        assert_eq!(decode(&mut buf).unwrap().unwrap(), Message::Heartbeat {});
        assert_eq!(decode(&mut buf).unwrap().unwrap(), Message::HeartbeatAck {});
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_skips_blank_lines() {
        let mut buf = BytesMut::from(&b"\n\r\n{\"type\":\"heartbeat\"}\n"[..]);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), Message::Heartbeat {});
    }

    #[test]
    fn malformed_line_is_consumed_then_stream_recovers() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{not json}\n");
        buf.extend_from_slice(&encode(&Message::Heartbeat {}).unwrap());

        assert!(matches!(decode(&mut buf), Err(Error::Codec { .. })));
        assert_eq!(decode(&mut buf).unwrap().unwrap(), Message::Heartbeat {});
    }

    #[test]
    fn unterminated_oversized_frame_errors() {
        let mut buf = BytesMut::from(vec![b'x'; MAX_FRAME_SIZE + 1].as_slice());
        assert!(matches!(decode(&mut buf), Err(Error::Codec { .. })));
    }

    #[tokio::test]
    async fn reader_preserves_residual_after_data_connection() {
        let first = Message::DataConnection(ConnectionRefPayload {
            connection_id: ConnectionId("c1".into()),
        });
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode(&first).unwrap());
        wire.extend_from_slice(b"tunneled payload bytes");

        let mut reader = LineReader::new(std::io::Cursor::new(wire));
        assert_eq!(reader.next_message().await.unwrap().unwrap(), first);

        let (_inner, residual) = reader.into_parts();
        assert_eq!(&residual[..], b"tunneled payload bytes");
    }

    #[tokio::test]
    async fn reader_clean_eof_returns_none() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode(&Message::Heartbeat {}).unwrap());

        let mut reader = LineReader::new(std::io::Cursor::new(wire));
        assert!(reader.next_message().await.unwrap().is_some());
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_eof_mid_frame_is_an_error() {
        let wire = br#"{"type":"heartbeat""#.to_vec();
        let mut reader = LineReader::new(std::io::Cursor::new(wire));
        assert!(reader.next_message().await.is_err());
    }
}
