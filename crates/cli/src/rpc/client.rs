use std::path::Path;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("io: {0}")]
  Io(#[from] std::io::Error),
  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
  #[error("rpc {code}: {message}")]
  Rpc {
    code: i64,
    message: String,
    data: Option<Value>,
  },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
  pub version: String,
  pub pid: u32,
  pub socket_path: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonHealth {
  pub ok: bool,
  pub pid: u32,
  pub uptime_secs: i64,
  pub clients: usize,
  pub seq: u64,
  pub ready: bool,
  pub shutting_down: bool,
}

async fn read_frame(stream: &mut UnixStream) -> std::io::Result<Vec<u8>> {
  let mut len_buf = [0u8; 4];
  stream.read_exact(&mut len_buf).await?;
  let len = u32::from_be_bytes(len_buf) as usize;
  let mut buf = vec![0u8; len];
  stream.read_exact(&mut buf).await?;
  Ok(buf)
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> std::io::Result<()> {
  stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
  stream.write_all(payload).await?;
  stream.flush().await
}

/// One call over a fresh connection. Notifications (connect ack, pings)
/// interleaved with the response are skipped; pings are answered.
pub async fn rpc_call(sock: &Path, method: &str, params: Option<Value>) -> Result<Value> {
  let mut stream = UnixStream::connect(sock).await?;
  let request = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
  debug!(event = "rpc_call", method, "rpc call");
  write_frame(&mut stream, request.to_string().as_bytes()).await?;

  loop {
    let bytes = read_frame(&mut stream).await?;
    let v: Value = serde_json::from_slice(&bytes)?;
    if v.get("method").is_some() {
      if v["method"] == "daemon.ping" {
        let pong = json!({
          "jsonrpc": "2.0",
          "method": "daemon.pong",
          "params": { "nonce": v["params"]["nonce"] }
        });
        write_frame(&mut stream, pong.to_string().as_bytes()).await?;
      }
      continue;
    }
    if v["id"] != json!(1) {
      continue;
    }
    if let Some(err) = v.get("error") {
      return Err(Error::Rpc {
        code: err.get("code").and_then(Value::as_i64).unwrap_or(-32000),
        message: err
          .get("message")
          .and_then(Value::as_str)
          .unwrap_or("unknown error")
          .to_string(),
        data: err.get("data").cloned(),
      });
    }
    return Ok(v.get("result").cloned().unwrap_or(Value::Null));
  }
}

pub async fn daemon_status(sock: &Path) -> Result<DaemonStatus> {
  let v = rpc_call(sock, "daemon.status", None).await?;
  Ok(serde_json::from_value(v)?)
}

pub async fn daemon_health(sock: &Path) -> Result<DaemonHealth> {
  let v = rpc_call(sock, "daemon.health", None).await?;
  Ok(serde_json::from_value(v)?)
}

pub async fn daemon_shutdown(sock: &Path) -> Result<()> {
  let _ = rpc_call(sock, "daemon.shutdown", None).await?;
  Ok(())
}
