//! Gossip Frame Codec
//!
//! Each message travels as a big-endian `u32` length followed by a bincode
//! payload. One connection carries exactly one request and its reply.

use super::error::{GossipError, Result};
use super::types::GossipMessage;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single encoded message.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub async fn write_message<W>(writer: &mut W, message: &GossipMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(GossipError::FrameTooLarge(payload.len()));
    }

    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R>(reader: &mut R) -> Result<GossipMessage>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(GossipError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

/// Sends `request` and waits for the single reply.
pub async fn call<C>(conn: &mut C, request: &GossipMessage) -> Result<GossipMessage>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    write_message(conn, request).await?;
    read_message(conn).await
}
