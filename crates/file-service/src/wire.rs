//! Length-prefixed JSON frames.
//!
//! # Wire format
//!
//! ```text
//! FRAME: [4 bytes BE: len][len bytes: JSON Message]
//!
//! CALL (client -> server):  call{CallHeader}
//!                           data{request}
//!                           data{ChunkFrame}*     (client streaming / duplex)
//!                           close_send
//! REPLY (server -> client): data{response | ChunkFrame}*
//!                           status{code, message}
//! ```

use filepump_protocol::Message;
use filepump_protocol::constants::{MAX_CHUNK_SIZE, MAX_FRAME_SIZE};
use filepump_transfer::{TransferConfig, TransferError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ServiceError;

/// Validates a transfer config and checks its chunks fit in a single frame.
pub fn check_transfer_config(config: &TransferConfig) -> Result<(), TransferError> {
    config.validate()?;
    if config.chunk_size > MAX_CHUNK_SIZE {
        return Err(TransferError::InvalidArgument(format!(
            "chunk_size {} exceeds the {MAX_CHUNK_SIZE} bytes a frame can carry",
            config.chunk_size
        )));
    }
    Ok(())
}

/// Writes one frame and flushes it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ServiceError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ServiceError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `None` when the peer closed the connection between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, ServiceError> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(ServiceError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}
