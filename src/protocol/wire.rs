//! Length-prefixed framing
//!
//! Reads and writes handshakes and messages over any async byte
//! stream. Frames above `MAX_FRAME` are treated as protocol
//! violations rather than allocated.

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::message::Message;
use crate::error::EngineError;

/// Largest accepted frame: a block plus the piece-message header,
/// with slack for bitfields of very large torrents
const MAX_FRAME: usize = 256 * 1024;

/// Framing codec for one peer stream
#[derive(Debug, Default)]
pub struct Wire;

impl Wire {
    /// Write a handshake frame
    pub async fn write_handshake<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        handshake: &Handshake,
    ) -> Result<()> {
        writer.write_all(&handshake.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a handshake frame
    pub async fn read_handshake<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await?;
        Handshake::decode(&buf)
    }

    /// Write one message frame
    pub async fn write_message<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        message: &Message,
    ) -> Result<()> {
        let frame = message.encode();
        writer.write_all(&frame).await?;
        writer.flush().await?;
        trace!(len = frame.len(), "wrote frame");
        Ok(())
    }

    /// Read one message frame, decoding at the boundary
    pub async fn read_message<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Message> {
        let mut prefix = [0u8; 4];
        reader.read_exact(&mut prefix).await?;
        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME {
            return Err(EngineError::protocol_with_detail(
                "Frame exceeds size limit",
                format!("{} bytes", len),
            )
            .into());
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Message::decode(&payload)
    }
}
