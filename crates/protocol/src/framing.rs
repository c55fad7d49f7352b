//! Line-delimited JSON framing.
//!
//! One message per line. Empty lines are skipped; EOF is a clean close.
//! Anything else that fails to parse is a malformed frame — the caller is
//! expected to close the offending connection and nothing else.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::WireMessage;

/// Errors produced by the framing layer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame of {actual} bytes exceeds limit of {limit}")]
    TooLarge { actual: usize, limit: usize },

    #[error("connection closed")]
    Closed,
}

/// Read the next message, skipping empty lines.
///
/// Returns [`FrameError::Closed`] on EOF, [`FrameError::TooLarge`] when a
/// line exceeds `max_bytes`, and [`FrameError::Malformed`] when a non-empty
/// line is not a valid protocol message.
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> Result<WireMessage, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(FrameError::Closed);
        }
        if line.len() > max_bytes {
            return Err(FrameError::TooLarge {
                actual: line.len(),
                limit: max_bytes,
            });
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed).map_err(|e| FrameError::Malformed(e.to_string()));
    }
}

/// Encode and write one message followed by a newline, then flush.
///
/// Refuses frames above `max_bytes` so an oversized payload is caught
/// before it hits the wire.
pub async fn write_frame<W>(
    writer: &mut W,
    msg: &WireMessage,
    max_bytes: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(msg).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if json.len() > max_bytes {
        return Err(FrameError::TooLarge {
            actual: json.len(),
            limit: max_bytes,
        });
    }
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
