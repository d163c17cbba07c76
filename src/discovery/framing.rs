//! Length-prefixed message framing for the registry protocol.
//!
//! Message format:
//! ```text
//! ┌─────────────────┬──────────────────────────┐
//! │ Length (4 bytes)│ JSON-RPC Message (N bytes)│
//! │  big-endian u32 │                          │
//! └─────────────────┴──────────────────────────┘
//! ```

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Frame-level failures on a registry connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: u32 },

    #[error("Empty message")]
    Empty,

    /// The peer closed the stream or the socket failed.
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame arrived intact but its body is not the expected JSON.
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    /// True when the stream is still aligned on a frame boundary.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Json(_))
    }
}

/// Read a length-prefixed JSON message of at most `max_size` bytes.
///
/// Not cancel-safe: a partially read frame is lost if the future is dropped.
pub async fn read_frame<R, T>(reader: &mut R, max_size: u32) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len > max_size {
        return Err(FrameError::TooLarge {
            size: len as usize,
            max: max_size,
        });
    }
    if len == 0 {
        return Err(FrameError::Empty);
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Read a registry message, capped at [`MAX_MESSAGE_SIZE`].
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    read_frame(reader, MAX_MESSAGE_SIZE).await
}

/// Write a length-prefixed JSON message to a stream.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_SIZE as usize {
        return Err(FrameError::TooLarge {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    // Prefix and body go out in one write
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
    struct Announce {
        server_id: String,
        load: u32,
    }

    #[tokio::test]
    async fn test_message_format() {
        let msg = Announce {
            server_id: "alpha".to_string(),
            load: 3,
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len() - 4);

        let json_str = std::str::from_utf8(&buf[4..]).unwrap();
        assert!(json_str.contains("\"server_id\":\"alpha\""));

        let mut cursor = Cursor::new(buf);
        let decoded: Announce = read_message(&mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_rejects_empty_frame() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0, 0]);
        let err = read_message::<_, Announce>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::Empty));
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let len = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(len.to_vec());
        let err = read_message::<_, Announce>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{\"a\"");
        let mut cursor = Cursor::new(buf);
        let err = read_message::<_, Announce>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_custom_size_cap() {
        let msg = Announce {
            server_id: "a-rather-long-server-id".to_string(),
            load: 0,
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let err = read_frame::<_, Announce>(&mut Cursor::new(buf.clone()), 8)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { max: 8, .. }));
        assert!(read_frame::<_, Announce>(&mut Cursor::new(buf), 1024).await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_json_keeps_stream_aligned() {
        let mut buf = 3u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{x}");
        let good = Announce {
            server_id: "beta".to_string(),
            load: 1,
        };
        write_message(&mut buf, &good).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let err = read_message::<_, Announce>(&mut cursor).await.unwrap_err();
        assert!(err.is_recoverable());
        let next: Announce = read_message(&mut cursor).await.unwrap();
        assert_eq!(next, good);
    }
}
