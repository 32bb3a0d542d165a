//! TCP wire format for file transfers.
//!
//! # Wire format
//!
//! ```text
//! PER FILE (Board -> Controller):
//!   [8 bytes BE: file_len]
//!   [file_len bytes: raw file data]
//! ```
//!
//! There is no end marker. Closing the connection at a frame boundary ends
//! the stream cleanly; closing it inside a frame is a framing error.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_TRANSFER_LEN;
use crate::error::DataChannelError;

/// Size of the length header.
pub const HEADER_LEN: usize = 8;

/// Writes a frame header announcing `len` bytes of file data.
pub async fn write_frame_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    len: u64,
) -> Result<(), DataChannelError> {
    if len > MAX_TRANSFER_LEN {
        return Err(DataChannelError::Oversized {
            len,
            max: MAX_TRANSFER_LEN,
        });
    }
    writer.write_u64(len).await?;
    Ok(())
}

/// Reads a frame header.
///
/// Returns `None` if the stream ends before the first header byte.
pub async fn read_frame_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<u64>, DataChannelError> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(DataChannelError::Truncated {
                expected: HEADER_LEN as u64,
                received: filled as u64,
            });
        }
        filled += n;
    }

    let len = u64::from_be_bytes(header);
    if len > MAX_TRANSFER_LEN {
        return Err(DataChannelError::Oversized {
            len,
            max: MAX_TRANSFER_LEN,
        });
    }
    Ok(Some(len))
}

/// Copies exactly `len` bytes from `reader` to `writer` through `buf`.
///
/// Short reads are retried until the count is reached; EOF before that is
/// [`DataChannelError::Truncated`].
pub async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    buf: &mut [u8],
) -> Result<(), DataChannelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    while remaining > 0 {
        let to_read = (remaining as usize).min(buf.len());
        let n = reader.read(&mut buf[..to_read]).await?;
        if n == 0 {
            return Err(DataChannelError::Truncated {
                expected: len,
                received: len - remaining,
            });
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}
