//! Shared test harness: a framed JSON-RPC client for the daemon socket,
//! a condition-waiting helper, and a git workspace fixture.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Await `check` until it holds or `budget` runs out. Attempts back off
/// from 10 ms to 160 ms so tight loops stay cheap without hammering the
/// daemon under test.
pub async fn wait_for<F, Fut>(budget: Duration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + budget;
  let mut pause = Duration::from_millis(10);
  loop {
    if check().await {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(pause).await;
    pause = (pause * 2).min(Duration::from_millis(160));
  }
}

#[derive(Debug, serde::Deserialize)]
pub struct RpcError {
  pub code: i64,
  pub message: String,
  #[serde(default)]
  pub data: Option<Value>,
}

/// One decoded JSON-RPC response. Assertions usually go through [`ok`]
/// or [`err`], which panic with the full payload on the wrong variant.
///
/// [`ok`]: RpcResp::ok
/// [`err`]: RpcResp::err
#[derive(Debug, serde::Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
pub struct RpcResp<T> {
  pub jsonrpc: String,
  pub id: Value,
  #[serde(default)]
  pub result: Option<T>,
  #[serde(default)]
  pub error: Option<RpcError>,
}

impl<T> RpcResp<T> {
  /// The success payload; panics on an error response.
  pub fn ok(self) -> T {
    assert_eq!(self.jsonrpc, "2.0");
    if let Some(e) = &self.error {
      panic!("rpc error {}: {} (data: {:?})", e.code, e.message, e.data);
    }
    self.result.expect("response carries neither result nor error")
  }

  /// The error payload; panics on a success response.
  pub fn err(self) -> RpcError {
    assert_eq!(self.jsonrpc, "2.0");
    match self.error {
      Some(e) => e,
      None => panic!("expected an error response"),
    }
  }
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

/// A persistent framed connection to the daemon. Notifications received
/// while waiting for a response are buffered; transport pings are
/// answered automatically so the connection stays alive.
pub struct RpcConn {
  stream: UnixStream,
  next_id: u64,
  notifications: Vec<Value>,
}

impl RpcConn {
  pub async fn connect(sock: &Path) -> std::io::Result<Self> {
    let stream = UnixStream::connect(sock).await?;
    Ok(Self {
      stream,
      next_id: 0,
      notifications: Vec::new(),
    })
  }

  /// Send a raw already-encoded frame (for malformed-input tests).
  pub async fn send_raw(&mut self, payload: &[u8]) -> std::io::Result<()> {
    write_frame(&mut self.stream, payload).await
  }

  /// Read the next frame as JSON, answering pings along the way.
  pub async fn read_value(&mut self) -> std::io::Result<Value> {
    loop {
      let bytes = read_frame(&mut self.stream).await?;
      let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
      if value["method"] == "daemon.ping" {
        let pong = json!({
          "jsonrpc": "2.0",
          "method": "daemon.pong",
          "params": { "nonce": value["params"]["nonce"] }
        });
        write_frame(&mut self.stream, pong.to_string().as_bytes()).await?;
        continue;
      }
      return Ok(value);
    }
  }

  /// Call a method and wait for its response, buffering notifications.
  pub async fn call<T: serde::de::DeserializeOwned>(
    &mut self,
    method: &str,
    params: Option<Value>,
  ) -> RpcResp<T> {
    self.next_id += 1;
    let id = self.next_id;
    let request = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
    write_frame(&mut self.stream, request.to_string().as_bytes())
      .await
      .expect("request write");
    loop {
      let value = self.read_value().await.expect("response read");
      if value.get("method").is_some() {
        self.notifications.push(value);
        continue;
      }
      if value["id"] == json!(id) {
        return serde_json::from_value(value).expect("valid response shape");
      }
    }
  }

  /// Wait for a notification with the given method, consuming buffered
  /// ones first. Returns its `params`, or None on timeout.
  pub async fn wait_notification(&mut self, method: &str, timeout: Duration) -> Option<Value> {
    if let Some(pos) = self
      .notifications
      .iter()
      .position(|n| n["method"] == method)
    {
      let mut found = self.notifications.remove(pos);
      return Some(found["params"].take());
    }
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
      let next = tokio::time::timeout_at(deadline, self.read_value()).await;
      match next {
        Ok(Ok(value)) => {
          if value["method"] == method {
            let mut value = value;
            return Some(value["params"].take());
          }
          if value.get("method").is_some() {
            self.notifications.push(value);
          }
        }
        _ => return None,
      }
    }
    None
  }

  /// Notifications buffered so far (without draining the socket).
  pub fn buffered(&self) -> &[Value] {
    &self.notifications
  }
}

/// One-shot convenience client matching the daemon's connection-per-call
/// tolerant protocol.
pub struct UnixRpcClient {
  sock: PathBuf,
}

impl UnixRpcClient {
  pub fn new<P: AsRef<Path>>(sock: P) -> Self {
    Self {
      sock: sock.as_ref().to_path_buf(),
    }
  }

  pub async fn call<T: serde::de::DeserializeOwned>(
    &self,
    method: &str,
    params: Option<Value>,
  ) -> RpcResp<T> {
    let mut conn = RpcConn::connect(&self.sock).await.expect("connect");
    conn.call(method, params).await
  }

  pub async fn try_call<T: serde::de::DeserializeOwned>(
    &self,
    method: &str,
    params: Option<Value>,
  ) -> std::io::Result<RpcResp<T>> {
    let mut conn = RpcConn::connect(&self.sock).await?;
    Ok(conn.call(method, params).await)
  }
}

/// Turn a directory into a usable workspace repository: identity
/// configured, HEAD on `main`, one seed commit so revwalks and status
/// calls have something to chew on.
pub fn seed_repo(path: &Path) -> git2::Repository {
  let repo = git2::Repository::init(path).expect("init repo");
  {
    let mut cfg = repo.config().expect("repo config");
    cfg.set_str("user.name", "tau-test").expect("user.name");
    cfg.set_str("user.email", "tau-test@localhost").expect("user.email");
  }
  // Point HEAD at main up front; the first commit then lands there
  // without a separate branch + set_head dance.
  repo.set_head("refs/heads/main").expect("set head");

  std::fs::write(path.join("README.md"), "seed workspace\n").expect("seed file");
  let tree_id = {
    let mut index = repo.index().expect("index");
    index.add_path(Path::new("README.md")).expect("stage seed");
    index.write().expect("write index");
    index.write_tree().expect("write tree")
  };
  {
    let tree = repo.find_tree(tree_id).expect("find tree");
    let sig = git2::Signature::now("tau-test", "tau-test@localhost").expect("signature");
    repo
      .commit(Some("HEAD"), &sig, &sig, "seed workspace", &tree, &[])
      .expect("seed commit");
  }
  repo
}
