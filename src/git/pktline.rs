//! Packet-line framing for the error responses written by the gateway.
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! the prefix itself; `0000` is the flush packet that ends a message.

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Largest payload a single packet line can carry (65520 total minus prefix).
pub const MAX_PKT_PAYLOAD: usize = 65516;

pub const FLUSH_PKT: &[u8] = b"0000";

/// Encode `data` as one packet line.  Oversized payloads are truncated to
/// [`MAX_PKT_PAYLOAD`] bytes rather than producing an unparseable length.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let data = &data[..data.len().min(MAX_PKT_PAYLOAD)];
    let total_len = data.len() + 4;
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Encode a fatal error the way git clients report it (`ERR <msg>`),
/// followed by a flush packet.
pub fn encode_error(message: &str) -> Vec<u8> {
    let mut buf = encode_pkt_line(format!("ERR {message}\n").as_bytes());
    buf.extend_from_slice(FLUSH_PKT);
    buf
}

/// Write an encoded error to `w` and flush it.
pub async fn write_error<W>(w: &mut W, message: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(&encode_error(message)).await?;
    w.flush().await
}
