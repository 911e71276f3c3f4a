//! mtcp framing — length-prefixed frames over a byte stream.
//!
//! Each frame is a 4-byte big-endian length followed by that many payload
//! bytes. A zero length is a keepalive probe and carries no payload.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload, matching the bundle size cap.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Writes one payload frame. The caller flushes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame payload of {} bytes exceeds the frame limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Writes a zero-length keepalive probe. The caller flushes.
pub async fn write_probe<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&0u32.to_be_bytes()).await
}

/// Reads one frame. Returns `None` for a keepalive probe, `Some(payload)`
/// otherwise. A length over [`MAX_FRAME_LEN`] is rejected without reading
/// the payload.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("announced frame length {len} exceeds the frame limit"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}
