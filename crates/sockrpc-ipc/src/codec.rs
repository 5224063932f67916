//! Zero-terminated framing.
//!
//! One frame travels in each direction per connection: the payload bytes
//! followed by a single `0` byte. There is no length prefix, so a payload must
//! not itself contain a zero byte; anything after the first zero is dropped.

use crate::IpcError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame terminator byte
pub const TERMINATOR: u8 = 0;

/// Size of each read from the underlying channel
const READ_CHUNK_SIZE: usize = 4096;

/// Write `payload` followed by the terminator.
///
/// Returns the number of bytes written, terminator included.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<usize, IpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(payload).await?;
    writer.write_all(&[TERMINATOR]).await?;
    writer.flush().await?;
    Ok(payload.len() + 1)
}

/// Read one frame.
///
/// Returns `Ok(None)` when the channel reaches end of input before a
/// terminator arrives, whether or not some bytes were read.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_until_terminator(reader, None).await
}

/// Read one frame, failing once the payload grows past `max_len` bytes
pub async fn read_frame_limited<R>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<Vec<u8>>, IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_until_terminator(reader, Some(max_len)).await
}

async fn read_until_terminator<R>(
    reader: &mut R,
    limit: Option<usize>,
) -> Result<Option<Vec<u8>>, IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut data = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if !data.is_empty() {
                tracing::debug!(len = data.len(), "End of input before frame terminator");
            }
            return Ok(None);
        }

        let fresh = &chunk[..n];
        let (body, complete) = match fresh.iter().position(|&b| b == TERMINATOR) {
            Some(pos) => (&fresh[..pos], true),
            None => (fresh, false),
        };

        if let Some(limit) = limit {
            if data.len() + body.len() > limit {
                return Err(IpcError::FrameTooLarge { limit });
            }
        }

        reserve_doubling(&mut data, body.len());
        data.extend_from_slice(body);

        if complete {
            return Ok(Some(data));
        }
    }
}

/// Grow `buf` to twice what it needs whenever `additional` bytes would not fit
fn reserve_doubling(buf: &mut Vec<u8>, additional: usize) {
    let needed = buf.len() + additional;
    if needed > buf.capacity() {
        buf.reserve_exact(2 * needed - buf.len());
    }
}
