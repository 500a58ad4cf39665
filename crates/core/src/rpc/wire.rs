//! Wire framing: each JSON-RPC message is one frame, encoded as a 4-byte
//! big-endian length prefix followed by a UTF-8 JSON payload. Binary
//! payloads are not part of the protocol; a frame that fails to decode as
//! JSON is a parse error on the receiving side.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum frame size (8 MB). Large enough for full history snapshots,
/// small enough to bound a misbehaving peer.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
  #[error("io: {0}")]
  Io(#[from] std::io::Error),
  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
  #[error("frame too large: {size} bytes (max {max})")]
  FrameTooLarge { size: usize, max: usize },
  #[error("connection closed")]
  Closed,
}

/// Read one frame payload.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
  let mut len_buf = [0u8; 4];
  match reader.read_exact(&mut len_buf).await {
    Ok(_) => {}
    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(WireError::Closed),
    Err(e) => return Err(WireError::Io(e)),
  }
  let len = u32::from_be_bytes(len_buf) as usize;
  if len > MAX_FRAME_SIZE {
    return Err(WireError::FrameTooLarge {
      size: len,
      max: MAX_FRAME_SIZE,
    });
  }
  let mut buf = vec![0u8; len];
  reader.read_exact(&mut buf).await?;
  Ok(buf)
}

/// Write one frame payload.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
  writer: &mut W,
  payload: &[u8],
) -> Result<(), WireError> {
  if payload.len() > MAX_FRAME_SIZE {
    return Err(WireError::FrameTooLarge {
      size: payload.len(),
      max: MAX_FRAME_SIZE,
    });
  }
  writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
  writer.write_all(payload).await?;
  writer.flush().await?;
  Ok(())
}

/// Read a frame and decode it as JSON.
pub async fn read_json<R: AsyncReadExt + Unpin, T: DeserializeOwned>(
  reader: &mut R,
) -> Result<T, WireError> {
  let bytes = read_frame(reader).await?;
  Ok(serde_json::from_slice(&bytes)?)
}

/// Encode a value as JSON and write it as one frame.
pub async fn write_json<W: AsyncWriteExt + Unpin, T: Serialize>(
  writer: &mut W,
  value: &T,
) -> Result<(), WireError> {
  let bytes = serde_json::to_vec(value)?;
  write_frame(writer, &bytes).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{Value, json};

  #[tokio::test]
  async fn round_trips_json_frames() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    write_json(&mut a, &json!({"jsonrpc": "2.0", "id": 1, "method": "daemon.health"}))
      .await
      .unwrap();
    write_json(&mut a, &json!({"second": true})).await.unwrap();

    let first: Value = read_json(&mut b).await.unwrap();
    assert_eq!(first["method"], json!("daemon.health"));
    let second: Value = read_json(&mut b).await.unwrap();
    assert_eq!(second, json!({"second": true}));
  }

  #[tokio::test]
  async fn closed_stream_reports_closed() {
    let (a, mut b) = tokio::io::duplex(64);
    drop(a);
    let err = read_frame(&mut b).await.unwrap_err();
    assert!(matches!(err, WireError::Closed));
  }

  #[tokio::test]
  async fn oversized_frame_is_rejected_before_read() {
    let (mut a, mut b) = tokio::io::duplex(64);
    // Hand-write a length prefix larger than the cap
    let len = (MAX_FRAME_SIZE as u32) + 1;
    tokio::io::AsyncWriteExt::write_all(&mut a, &len.to_be_bytes())
      .await
      .unwrap();
    let err = read_frame(&mut b).await.unwrap_err();
    assert!(matches!(err, WireError::FrameTooLarge { .. }));
  }
}
