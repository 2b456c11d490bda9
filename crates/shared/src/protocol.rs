//! Length-prefixed JSON framing used on the vsock channel between the host
//! and the in-guest agent.
//!
//! Warning: private protocol. Do not read or write frames on the stream
//! without going through [`read_frame`]/[`write_frame`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum body size accepted for a single frame (16 MiB), per the guest
/// transport wire protocol.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    TooLarge(u32),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Writes a single length-prefixed JSON frame: a 4-byte big-endian length
/// followed by that many bytes of UTF-8 JSON.
pub async fn write_frame<W, T>(stream: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge(u32::MAX))?;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len));
    }

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;

    Ok(())
}

/// Reads a single length-prefixed JSON frame, rejecting any body larger
/// than [`MAX_FRAME_BYTES`] before allocating a buffer for it.
pub async fn read_frame<R, T>(stream: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: for<'de> serde::Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;

    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &serde_json::json!({"a": 1})).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let value: serde_json::Value = read_frame(&mut cursor).await.unwrap();
        assert_eq!(value, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn rejects_oversized_declared_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let err = read_frame::<_, serde_json::Value>(&mut cursor)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }
}
