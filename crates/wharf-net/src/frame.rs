//! Length-prefixed postcard frames.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;

/// Largest accepted frame payload: 1 MiB. Query messages are a few hundred
/// bytes at most.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Write `message` as one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = postcard::to_allocvec(message)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(NetError::MessageTooLarge {
            len: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, NetError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    read_exact(reader, &mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(NetError::MessageTooLarge {
            len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    read_exact(reader, &mut payload).await?;
    Ok(postcard::from_bytes(&payload)?)
}

/// Maps an early EOF to [`NetError::StreamClosed`].
async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), NetError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(NetError::StreamClosed),
        Err(e) => Err(e.into()),
    }
}
