//! Native-messaging framing: a 4-byte little-endian length, then that many
//! bytes of UTF-8 JSON.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BridgeError, BridgeResult};

/// Largest inbound message accepted
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Read one message. `Ok(None)` means the stream ended cleanly between
/// messages.
pub async fn read_message<R>(reader: &mut R) -> BridgeResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(BridgeError::Protocol("stream ended inside a length prefix".into()));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(BridgeError::TooLarge(format!(
            "control message of {} bytes exceeds {}",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_message<W>(writer: &mut W, body: &[u8]) -> BridgeResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| BridgeError::TooLarge(format!("{} byte control message", body.len())))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
