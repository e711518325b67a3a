//! Framed message transport.
//!
//! Messages are JSON objects carrying a string `id`, framed as a 4-byte
//! big-endian length followed by the encoded body. Beyond pings and pongs
//! the framework does not interpret message contents; user-supplied
//! predicates decide what counts as a request or a response.

use std::io;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::ping;

/// Maximum message size (16 MB) to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// True for any JSON object with a string `id` field.
pub fn has_id(msg: &Value) -> bool {
    msg.get("id").is_some_and(Value::is_string)
}

/// The message's `id`, if it has a string one.
pub fn message_id(msg: &Value) -> Option<&str> {
    msg.get("id")?.as_str()
}

/// Default server-side request classifier: an identified message that is
/// neither a ping nor a pong.
pub fn is_request(msg: &Value) -> bool {
    has_id(msg) && !ping::is_ping(msg) && !ping::is_pong(msg)
}

/// Default client-side response classifier: an identified message that is
/// not a ping. Pongs count as responses so a ping request resolves like any
/// other.
pub fn is_response(msg: &Value) -> bool {
    has_id(msg) && !ping::is_ping(msg)
}

/// Encode a message into a single contiguous buffer (length prefix plus
/// body), so the caller can emit the whole frame in one write.
pub fn encode_frame(msg: &Value) -> io::Result<Vec<u8>> {
    let body = serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if body.len() > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "message too large: {} bytes (max {})",
                body.len(),
                MAX_MESSAGE_SIZE
            ),
        ));
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Read a length-delimited frame from an async reader.
///
/// # Errors
///
/// Returns an error if:
/// - The connection is closed (EOF when reading the length)
/// - The claimed size exceeds `MAX_MESSAGE_SIZE`
/// - Reading fails
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {} bytes (max {})", len, MAX_MESSAGE_SIZE),
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read one framed message and decode it.
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Value> {
    let data = read_frame(reader).await?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Encode and write one framed message as a single write, then flush.
pub async fn write_message<W: AsyncWriteExt + Unpin>(writer: &mut W, msg: &Value) -> io::Result<()> {
    let buf = encode_frame(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_classifiers() {
        let req = json!({ "id": "1-0-0", "op": "build" });
        assert!(has_id(&req));
        assert!(is_request(&req));
        assert!(is_response(&req));

        let anon = json!({ "op": "build" });
        assert!(!has_id(&anon));
        assert!(!is_request(&anon));

        let p = crate::ping::ping("1-0-1");
        assert!(!is_request(&p));
        assert!(!is_response(&p));

        let q = crate::ping::pong(&p, 1);
        assert!(!is_request(&q));
        assert!(is_response(&q));
    }

    #[test]
    fn test_encode_frame_layout() {
        let msg = json!({ "id": "x" });
        let buf = encode_frame(&msg).unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len() - 4);
        let decoded: Value = serde_json::from_slice(&buf[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let msg = json!({ "id": "7-0-3", "payload": { "nested": [1, 2, 3] } });

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut reader = Cursor::new(buf);
        let decoded = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_multiple_frames() {
        let mut buf = Vec::new();
        for i in 0..3 {
            write_message(&mut buf, &json!({ "id": format!("m-{i}") }))
                .await
                .unwrap();
        }

        let mut reader = Cursor::new(buf);
        for i in 0..3 {
            let msg = read_message(&mut reader).await.unwrap();
            assert_eq!(msg["id"], format!("m-{i}"));
        }
    }

    #[tokio::test]
    async fn test_read_frame_size_limit() {
        // Craft a frame header claiming an oversized message
        let mut buf = Vec::new();
        let oversized_len = MAX_MESSAGE_SIZE + 1;
        buf.extend_from_slice(&oversized_len.to_be_bytes());
        buf.extend_from_slice(b"some data");

        let mut reader = Cursor::new(buf);
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("message too large"));
    }

    #[tokio::test]
    async fn test_read_message_rejects_non_json() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(b"ahoy!");

        let mut reader = Cursor::new(buf);
        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_message_eof() {
        let mut reader = Cursor::new(Vec::new());
        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
