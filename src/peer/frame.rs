//! Length-prefixed JSON framing
//!
//! Wire format:  [4-byte big-endian length][JSON envelope]

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::protocol::MessageEnvelope;

/// Default frame limit (activations can be large)
pub const DEFAULT_MAX_MESSAGE_BYTES: u32 = 64 * 1024 * 1024;

/// Read one envelope, rejecting frames over `max_bytes`
pub async fn read_framed_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_bytes: u32,
) -> anyhow::Result<MessageEnvelope> {
    let len = reader.read_u32().await?;
    if len > max_bytes {
        return Err(anyhow::anyhow!(
            "Message too large: {} bytes (max {})",
            len,
            max_bytes
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;

    let envelope: MessageEnvelope = serde_json::from_slice(&buf)?;
    Ok(envelope)
}

/// Write one envelope, rejecting payloads over `max_bytes`
pub async fn write_framed_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &MessageEnvelope,
    max_bytes: u32,
) -> anyhow::Result<()> {
    let json = serde_json::to_vec(envelope)?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|len| *len <= max_bytes)
        .ok_or_else(|| {
            anyhow::anyhow!("Message too large: {} bytes (max {})", json.len(), max_bytes)
        })?;

    writer.write_u32(len).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}
