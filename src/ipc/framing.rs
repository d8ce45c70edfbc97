//! Wire framing for both sides of the relay.
//!
//! The host side uses native messaging framing: every message is a UTF-8 JSON
//! body preceded by its byte length as a 4-byte unsigned integer in native
//! byte order.
//!
//! ```text
//! ┌──────────────┬───────────────────────────────┐
//! │ u32 (native) │ JSON body (exactly len bytes) │
//! └──────────────┴───────────────────────────────┘
//! ```
//!
//! The subprocess side is newline-delimited JSON-RPC: one JSON value per line.

use std::io;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RelayError;
use crate::models::ServerMessage;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest frame accepted from the host (64 MiB, the browser's own limit).
pub const MAX_INBOUND_SIZE: usize = 64 * 1024 * 1024;

/// Largest frame the browser accepts from a native host (1 MiB).
pub const MAX_OUTBOUND_SIZE: usize = 1024 * 1024;

/// Framing errors on the host channel.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The stream closed before a complete prefix or body arrived.
    #[error("Stream closed mid-frame: expected {expected} bytes, received {received}")]
    Truncated {
        /// Bytes the prefix (or the prefix itself) required.
        expected: usize,
        /// Bytes actually read before EOF.
        received: usize,
    },

    /// Declared or actual payload size is over the limit.
    #[error("Message size {size} exceeds maximum {max} bytes")]
    TooLarge {
        /// Offending size.
        size: usize,
        /// Applicable limit.
        max: usize,
    },

    /// I/O error while reading or writing a frame.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Prefix `payload` with its length in native byte order.
///
/// # Errors
///
/// Returns [`FramingError::TooLarge`] if the payload exceeds `max_size` or
/// cannot be described by a `u32`.
pub fn encode_envelope(payload: &[u8], max_size: usize) -> Result<Vec<u8>, FramingError> {
    let limit = max_size.min(u32::MAX as usize);
    if payload.len() > limit {
        return Err(FramingError::TooLarge {
            size: payload.len(),
            max: limit,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read one length-prefixed envelope from the stream.
///
/// Returns `Ok(None)` when the stream closes cleanly on a frame boundary.
///
/// # Errors
///
/// - [`FramingError::Truncated`] if the stream closes inside the prefix or body
/// - [`FramingError::TooLarge`] if the declared length exceeds `max_size`
/// - [`FramingError::Io`] on read failure
pub async fn read_envelope<R>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let received = read_full(reader, &mut prefix).await?;

    if received == 0 {
        return Ok(None);
    }
    if received < LENGTH_PREFIX_SIZE {
        return Err(FramingError::Truncated {
            expected: LENGTH_PREFIX_SIZE,
            received,
        });
    }

    let size = u32::from_ne_bytes(prefix) as usize;
    if size > max_size {
        return Err(FramingError::TooLarge {
            size,
            max: max_size,
        });
    }

    let mut body = vec![0u8; size];
    let received = read_full(reader, &mut body).await?;
    if received < size {
        return Err(FramingError::Truncated {
            expected: size,
            received,
        });
    }

    Ok(Some(body))
}

/// Frame `payload` and write it, flushing afterwards.
///
/// # Errors
///
/// Returns an error if the payload is too large or the write fails.
pub async fn write_envelope<W>(
    writer: &mut W,
    payload: &[u8],
    max_size: usize,
) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_envelope(payload, max_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Fill `buf` until it is full or the stream reaches EOF, returning the
/// number of bytes read. Unlike `read_exact`, a short read reports how much
/// arrived so callers can tell a clean close from a truncated frame.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FramingError::Io(e)),
        }
    }
    Ok(filled)
}

/// Serialize a message as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize + ?Sized>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line from the subprocess.
///
/// Blank lines yield `Ok(None)`.
///
/// # Errors
///
/// Returns [`RelayError::Parse`] if the line is not a JSON-RPC message.
pub fn decode_line(line: &str) -> Result<Option<ServerMessage>, RelayError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    ServerMessage::parse(trimmed).map(Some)
}
