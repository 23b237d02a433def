//! Length-prefixed frames carried on a stream.
//!
//! Each frame is a little-endian `u32` length followed by the payload. A
//! zero-length frame carries no data and acts as a keep-alive.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::StreamError;

/// Largest frame accepted from a peer (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_LEN {
        return Err(StreamError::FrameTooLarge {
            len: data.len(),
            max: MAX_FRAME_LEN,
        });
    }
    stream.write_u32_le(data.len() as u32).await?;
    stream.write_all(data).await?;
    Ok(())
}

pub async fn write_keep_alive<W>(stream: &mut W) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(stream, &[]).await
}

/// Read the next frame, or `None` once the peer has finished sending.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Bytes>, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let first = stream.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    // A header cut short is a truncated frame, not an end of stream.
    stream.read_exact(&mut header[first..]).await?;
    let len = u32::from_le_bytes(header) as usize;

    if len > MAX_FRAME_LEN {
        return Err(StreamError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}
