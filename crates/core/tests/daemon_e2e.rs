use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};
use tau_core::config::{Config, TauPaths};
use tau_core::daemon::{self, DaemonHandle, DaemonOptions};
use test_support::{RpcConn, RpcResp, UnixRpcClient, wait_for};

struct TestEnv {
  _td: tempfile::TempDir,
  sock: PathBuf,
  pid_file: PathBuf,
  workspace: PathBuf,
  handle: DaemonHandle,
}

async fn start_env() -> TestEnv {
  let td = tempfile::tempdir().unwrap();
  let paths = TauPaths::at(td.path().join("tau"));
  let workspace = td.path().join("ws");
  std::fs::create_dir_all(&workspace).unwrap();
  let sock = td.path().join("tau.sock");
  let pid_file = paths.pid_file_path();

  let handle = daemon::start(DaemonOptions {
    socket_path: sock.clone(),
    workspace: workspace.clone(),
    paths,
    config: Config::default(),
  })
  .await
  .expect("start daemon");

  let client = UnixRpcClient::new(&sock);
  let ok = wait_for(Duration::from_secs(3), || {
    let c = &client;
    async move {
      match c.try_call::<Value>("daemon.status", None).await {
        Ok(r) => r.error.is_none(),
        Err(_) => false,
      }
    }
  })
  .await;
  assert!(ok, "daemon did not become ready in time");

  TestEnv {
    _td: td,
    sock,
    pid_file,
    workspace,
    handle,
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_status_roundtrip() {
  let env = start_env().await;
  let client = UnixRpcClient::new(&env.sock);

  let v: RpcResp<Value> = client.call("daemon.status", None).await;
  assert_eq!(v.jsonrpc, "2.0");
  assert!(v.error.is_none(), "unexpected error: {:?}", v.error);
  let status = v.result.expect("has result");
  assert_eq!(status["version"], json!(env!("CARGO_PKG_VERSION")));
  assert_eq!(status["pid"], json!(std::process::id()));
  assert_eq!(status["socketPath"], json!(env.sock.display().to_string()));

  assert!(env.pid_file.exists(), "pid file missing while running");
  env.handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_method_returns_error() {
  let env = start_env().await;
  let client = UnixRpcClient::new(&env.sock);

  let v: RpcResp<Value> = client.call("daemon.nope", None).await;
  assert!(v.result.is_none());
  let err = v.err();
  assert_eq!(err.code, -32601);
  assert!(err.message.to_lowercase().contains("method"));

  env.handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handles_multiple_connections() {
  let env = start_env().await;
  let client = UnixRpcClient::new(&env.sock);

  let t1 = client.call::<Value>("daemon.health", None);
  let t2 = client.call::<Value>("daemon.health", None);
  let t3 = client.call::<Value>("daemon.health", None);
  let (r1, r2, r3) = tokio::join!(t1, t2, t3);

  for r in [r1, r2, r3] {
    assert!(r.error.is_none());
    let health = r.result.unwrap();
    assert_eq!(health["ok"], json!(true));
    assert!(health["clients"].as_u64().unwrap() >= 1);
  }

  env.handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_method_accepts_positional_and_named_params() {
  let env = start_env().await;
  let client = UnixRpcClient::new(&env.sock);

  let named: RpcResp<Value> = client
    .call("heartbeat.setInterval", Some(json!({"intervalSecs": 90})))
    .await;
  assert_eq!(named.result.unwrap()["intervalSecs"], json!(90));

  let positional: RpcResp<Value> = client.call("heartbeat.setInterval", Some(json!([120]))).await;
  assert_eq!(positional.result.unwrap()["intervalSecs"], json!(120));

  // Below the minimum: clamped, not an error
  let clamped: RpcResp<Value> = client.call("heartbeat.setInterval", Some(json!([5]))).await;
  assert_eq!(clamped.result.unwrap()["intervalSecs"], json!(60));

  env.handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connected_ack_then_seq_strictly_increasing() {
  let env = start_env().await;
  let mut conn = RpcConn::connect(&env.sock).await.unwrap();

  let connected = conn
    .wait_notification("daemon.connected", Duration::from_secs(2))
    .await
    .expect("connected ack");
  assert!(connected["clientId"].is_number());

  // Trigger two broadcasts and compare their sequence numbers
  let _: RpcResp<Value> = conn.call("tasks.save", Some(json!({"tasks": []}))).await;
  let first = conn
    .wait_notification("daemon.tasks.changed", Duration::from_secs(2))
    .await
    .expect("first tasks.changed");
  let _: RpcResp<Value> = conn.call("tasks.save", Some(json!({"tasks": []}))).await;
  let second = conn
    .wait_notification("daemon.tasks.changed", Duration::from_secs(2))
    .await
    .expect("second tasks.changed");

  let s1 = first["_seq"].as_u64().expect("_seq");
  let s2 = second["_seq"].as_u64().expect("_seq");
  assert!(s2 > s1, "seq not increasing: {s1} then {s2}");
  // Array payloads are wrapped to keep the shape stable
  assert!(first["data"].is_array());

  env.handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frames_are_answered_or_dropped() {
  let env = start_env().await;
  let mut conn = RpcConn::connect(&env.sock).await.unwrap();

  // Parse failure: -32700 with null id
  conn.send_raw(b"this is not json").await.unwrap();
  let resp = conn.read_value().await.unwrap();
  assert_eq!(resp["error"]["code"], json!(-32700));
  assert_eq!(resp["id"], Value::Null);

  // Wrong version with id: -32600
  conn
    .send_raw(json!({"jsonrpc": "1.0", "id": 7, "method": "daemon.status"}).to_string().as_bytes())
    .await
    .unwrap();
  let resp = conn.read_value().await.unwrap();
  assert_eq!(resp["error"]["code"], json!(-32600));
  assert_eq!(resp["id"], json!(7));

  // Malformed without id: dropped; the connection stays usable
  conn
    .send_raw(json!({"jsonrpc": "2.0"}).to_string().as_bytes())
    .await
    .unwrap();
  let health: RpcResp<Value> = conn.call("daemon.health", None).await;
  assert!(health.error.is_none());

  env.handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_prompt_streams_and_records_history() {
  let env = start_env().await;
  let mut conn = RpcConn::connect(&env.sock).await.unwrap();

  let prompted: RpcResp<Value> = conn
    .call("agent.prompt", Some(json!({"text": "hello daemon"})))
    .await;
  assert_eq!(prompted.result.unwrap()["outcome"], json!("started"));

  // The turn's stream events reach the client
  let event = conn
    .wait_notification("daemon.agent.event", Duration::from_secs(3))
    .await
    .expect("agent event");
  assert_eq!(event["sessionId"], json!("main"));

  let client = UnixRpcClient::new(&env.sock);
  let done = wait_for(Duration::from_secs(3), || {
    let c = &client;
    async move {
      let r: RpcResp<Value> = c.call("agent.history", None).await;
      r.result
        .and_then(|h| h.as_array().cloned())
        .map(|entries| {
          entries.iter().any(|e| {
            e["role"] == json!("assistant")
              && e["text"].as_str().is_some_and(|t| t.contains("hello daemon"))
          })
        })
        .unwrap_or(false)
    }
  })
  .await;
  assert!(done, "assistant reply never landed in history");

  env.handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recover_returns_snapshot_shape() {
  let env = start_env().await;
  let client = UnixRpcClient::new(&env.sock);

  let v: RpcResp<Value> = client.call("daemon.recover", None).await;
  let snapshot = v.ok();
  assert!(snapshot["status"]["version"].is_string());
  assert_eq!(snapshot["bufferedEvents"], json!([]));
  assert_eq!(snapshot["fullRecoveryRequired"], json!(true));
  assert!(snapshot["subagents"].is_array());

  env.handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_extension_tool_is_a_recoverable_error() {
  let env = start_env().await;
  let client = UnixRpcClient::new(&env.sock);

  let v: RpcResp<Value> = client
    .call("ext.call", Some(json!({"tool": "weather.today"})))
    .await;
  assert!(v.error.is_none(), "should be an application error, not protocol");
  assert_eq!(
    v.result.unwrap()["error"],
    json!("No extension provides tool weather.today")
  );

  env.handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_notifies_and_cleans_up() {
  let env = start_env().await;
  let mut conn = RpcConn::connect(&env.sock).await.unwrap();

  let v: RpcResp<Value> = conn
    .call("daemon.shutdown", Some(json!({"reason": "test over"})))
    .await;
  assert!(v.error.is_none());

  let bye = conn
    .wait_notification("daemon.shutdown", Duration::from_secs(2))
    .await
    .expect("shutdown notification");
  assert_eq!(bye["reason"], json!("test over"));

  // Socket and pid file disappear; new connections fail
  let sock = env.sock.clone();
  let gone = wait_for(Duration::from_secs(3), || {
    let sock = sock.clone();
    async move { !sock.exists() }
  })
  .await;
  assert!(gone, "socket file survived shutdown");
  assert!(!env.pid_file.exists(), "pid file survived shutdown");
  assert!(RpcConn::connect(&env.sock).await.is_err());

  // The workspace itself is untouched
  assert!(env.workspace.exists());
  env.handle.wait().await;
}
