//! Length-prefixed JSON frames.
//!
//! ```text
//! +----------------------+---------------------------+
//! | length (u32, BE)     | UTF-8 JSON body           |
//! +----------------------+---------------------------+
//! ```
//!
//! The length is validated against the limit before the body is allocated.
//! A zero length is invalid.

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::error::{ProtocolError, ProtocolResult, FRAME_HEADER_SIZE};

fn check_len(size: usize, max: usize) -> ProtocolResult<()> {
    if size == 0 {
        return Err(ProtocolError::invalid("zero-length frame"));
    }
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    Ok(())
}

async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8]) -> ProtocolResult<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ProtocolError::Truncated),
        Err(e) => Err(e.into()),
    }
}

/// Read the rest of a frame whose first header byte is already in `first`.
async fn read_after_first_byte<R>(reader: &mut R, first: u8, max: usize) -> ProtocolResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [first, 0, 0, 0];
    read_exact_or_truncated(reader, &mut header[1..]).await?;
    let size = u32::from_be_bytes(header) as usize;
    check_len(size, max)?;

    let mut body = vec![0u8; size];
    read_exact_or_truncated(reader, &mut body).await?;
    Ok(body)
}

/// Read one frame body. `None` means the peer closed cleanly between
/// frames.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> ProtocolResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    if reader.read(&mut first).await? == 0 {
        return Ok(None);
    }
    read_after_first_byte(reader, first[0], max).await.map(Some)
}

/// Like [`read_frame`], with two clocks: `idle` bounds the wait for the
/// first byte of a new frame, `read_timeout` bounds the remainder once it
/// has started.
pub async fn read_frame_timed<R>(
    reader: &mut R,
    max: usize,
    idle: Duration,
    read_timeout: Duration,
) -> ProtocolResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    let n = timeout(idle, reader.read(&mut first))
        .await
        .map_err(|_| ProtocolError::Idle(idle))??;
    if n == 0 {
        return Ok(None);
    }

    timeout(read_timeout, read_after_first_byte(reader, first[0], max))
        .await
        .map_err(|_| ProtocolError::Timeout(read_timeout))?
        .map(Some)
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8], max: usize) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    check_len(body.len(), max)?;
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: body.len(),
        max,
    })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_message<W, T>(writer: &mut W, message: &T, max: usize) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    write_frame(writer, &body, max).await
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> ProtocolResult<T> {
    let text = std::str::from_utf8(body)
        .map_err(|e| ProtocolError::invalid(format!("body is not UTF-8: {e}")))?;
    Ok(serde_json::from_str(text)?)
}
