//! Message framing for the worker's stdio channel.
//!
//! Every message is a header block followed by a JSON body:
//!
//! ```text
//! Content-Length: <N>\r\n
//! \r\n
//! <N bytes of UTF-8 JSON>
//! ```
//!
//! Headers other than `Content-Length` are accepted and ignored.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted body size: 64 MiB. A full scan of a large machine stays
/// well below this; anything bigger means the stream is out of sync.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const CONTENT_LENGTH: &str = "content-length";

fn invalid_data(message: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.into())
}

/// Send one framed message.
pub async fn send_message<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> std::io::Result<()> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive one framed message.
/// Returns `None` on clean disconnect (EOF between messages).
pub async fn recv_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            if saw_header {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed inside a message header",
                ));
            }
            return Ok(None);
        }

        let header = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if header.is_empty() {
            if saw_header {
                break;
            }
            // Stray separator between messages
            continue;
        }
        saw_header = true;

        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| invalid_data(format!("malformed header line: {:?}", header)))?;
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|e| invalid_data(format!("invalid Content-Length {:?}: {}", value, e)))?;
            content_length = Some(len);
        }
    }

    let len = content_length.ok_or_else(|| invalid_data("missing Content-Length header"))?;
    if len > MAX_MESSAGE_SIZE {
        return Err(invalid_data(format!(
            "message too large: {} bytes (max {})",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Send a value as a JSON-encoded framed message.
pub async fn send_json<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(value)?;
    send_message(writer, &body).await
}

/// Receive and deserialize a JSON-encoded framed message.
/// Returns `None` on clean disconnect (EOF).
pub async fn recv_json<R: AsyncBufRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> std::io::Result<Option<T>> {
    match recv_message(reader).await? {
        Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_message_roundtrip() {
        let body = br#"{"jsonrpc":"2.0","id":1,"result":null}"#;

        let mut buf = Vec::new();
        send_message(&mut buf, body).await.unwrap();
        assert!(buf.starts_with(b"Content-Length: 38\r\n\r\n"));

        let mut reader = BufReader::new(std::io::Cursor::new(buf));
        let received = recv_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(received, body);
    }

    #[tokio::test]
    async fn test_eof_between_messages() {
        let mut reader = BufReader::new(std::io::Cursor::new(Vec::<u8>::new()));
        assert!(recv_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_header() {
        let mut reader = BufReader::new(std::io::Cursor::new(b"Content-Length: 10\r\n".to_vec()));
        let err = recv_message(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_missing_content_length() {
        let raw = b"Content-Type: application/json\r\n\r\n{}".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(raw));
        let err = recv_message(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("missing Content-Length"));
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_SIZE + 1).into_bytes();
        let mut reader = BufReader::new(std::io::Cursor::new(raw));
        assert!(recv_message(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_extra_headers_and_case() {
        let raw = b"content-length: 2\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{}".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(raw));
        assert_eq!(recv_message(&mut reader).await.unwrap().unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_multiple_messages_on_same_stream() {
        let mut buf = Vec::new();
        send_message(&mut buf, b"\"first\"").await.unwrap();
        send_message(&mut buf, b"\"second\"").await.unwrap();

        let mut reader = BufReader::new(std::io::Cursor::new(buf));
        let first: String = recv_json(&mut reader).await.unwrap().unwrap();
        let second: String = recv_json(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, "first");
        assert_eq!(second, "second");
        assert!(recv_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_roundtrip() {
        let mut buf = Vec::new();
        send_json(&mut buf, &serde_json::json!({"method": "refresh"}))
            .await
            .unwrap();

        let mut reader = BufReader::new(std::io::Cursor::new(buf));
        let value: serde_json::Value = recv_json(&mut reader).await.unwrap().unwrap();
        assert_eq!(value["method"], "refresh");
    }
}
