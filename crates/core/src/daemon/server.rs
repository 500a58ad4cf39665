//! Accept loop and per-connection protocol handling over the Unix domain
//! socket. One JSON-RPC message per length-prefixed frame.

use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{DaemonState, Router};
use crate::rpc::{self, Incoming, wire};

const PING_INTERVAL: Duration = Duration::from_secs(10);
/// A client that misses three pings in a row is closed.
const PONG_DEADLINE: Duration = Duration::from_secs(30);

/// Bind the socket (owner-only) and run the accept loop until shutdown.
pub fn start(
  state: Arc<DaemonState>,
  router: Arc<Router>,
  mut shutdown_rx: watch::Receiver<bool>,
) -> io::Result<JoinHandle<()>> {
  let socket_path = state.socket_path.clone();
  if let Some(parent) = socket_path.parent() {
    fs::create_dir_all(parent)?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }
  }
  // Remove stale socket if present
  let _ = fs::remove_file(&socket_path);
  let listener = UnixListener::bind(&socket_path)?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600));
  }

  info!(event = "server_started", socket = %socket_path.display(), "server listening");

  let task = tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = shutdown_rx.changed() => {
          info!(event = "server_shutdown", "shutdown signal received; stopping accept loop");
          break;
        }
        res = listener.accept() => {
          match res {
            Ok((stream, _addr)) => {
              let state = Arc::clone(&state);
              let router = Arc::clone(&router);
              let shutdown_rx = shutdown_rx.clone();
              tokio::spawn(handle_connection(state, router, stream, shutdown_rx));
            }
            Err(e) => {
              error!(error = %e, "accept error");
              break;
            }
          }
        }
      }
    }
    // Best-effort cleanup
    let _ = fs::remove_file(&socket_path);
    info!(event = "server_stopped", socket = %socket_path.display(), "server stopped");
  });

  Ok(task)
}

async fn handle_connection(
  state: Arc<DaemonState>,
  router: Arc<Router>,
  stream: UnixStream,
  mut shutdown_rx: watch::Receiver<bool>,
) {
  let (mut reader, mut writer) = stream.into_split();
  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
  let client = state.registry.add(tx);
  let client_id = client.id;
  let done = CancellationToken::new();
  debug!(event = "client_connected", client_id, "client connected");

  state.notifier.notify_client(
    &client,
    "daemon.connected",
    json!({ "clientId": client_id }),
  );

  // Writer: everything (responses, notifications, pings) flows through
  // the client's channel, preserving per-connection order.
  let writer_done = done.clone();
  let writer_task = tokio::spawn(async move {
    loop {
      let frame = tokio::select! {
        _ = writer_done.cancelled() => break,
        frame = rx.recv() => frame,
      };
      let Some(frame) = frame else { break };
      if wire::write_frame(&mut writer, frame.as_bytes()).await.is_err() {
        break;
      }
    }
  });

  // Transport liveness: ping every 10 s, close on missed pongs.
  let ping_client = Arc::clone(&client);
  let ping_state = Arc::clone(&state);
  let ping_done = done.clone();
  let ping_task = tokio::spawn(async move {
    let mut nonce: u64 = 0;
    loop {
      tokio::select! {
        _ = ping_done.cancelled() => break,
        _ = tokio::time::sleep(PING_INTERVAL) => {}
      }
      if ping_client.last_pong_age() > PONG_DEADLINE {
        debug!(event = "client_ping_timeout", client_id = ping_client.id, "client missed pongs, closing");
        ping_done.cancel();
        break;
      }
      nonce += 1;
      ping_state.notifier.notify_client(
        &ping_client,
        "daemon.ping",
        json!({ "nonce": nonce }),
      );
    }
  });

  loop {
    let payload = tokio::select! {
      _ = done.cancelled() => break,
      _ = shutdown_rx.changed() => break,
      payload = wire::read_frame(&mut reader) => payload,
    };
    let payload = match payload {
      Ok(p) => p,
      Err(wire::WireError::Closed) => break,
      Err(e) => {
        debug!(event = "client_read_error", client_id, error = %e, "read error, closing");
        break;
      }
    };
    let value: Value = match serde_json::from_slice(&payload) {
      Ok(v) => v,
      Err(_) => {
        let response = rpc::error_response(Value::Null, &rpc::RpcError::parse_error());
        let _ = client.send_raw(response.to_string());
        continue;
      }
    };
    match rpc::parse_incoming(value) {
      Incoming::Request(request) => {
        // Handlers may suspend; responses go through the writer channel.
        // A disconnected client simply drops the result.
        let state = Arc::clone(&state);
        let router = Arc::clone(&router);
        let client = Arc::clone(&client);
        tokio::spawn(async move {
          let response = router.dispatch(state, request).await;
          let _ = client.send_raw(response.to_string());
        });
      }
      Incoming::Notification(note) => {
        if note.method == "daemon.pong" {
          client.note_pong();
          continue;
        }
        let state = Arc::clone(&state);
        let router = Arc::clone(&router);
        tokio::spawn(async move {
          router.dispatch_notification(state, note).await;
        });
      }
      Incoming::Invalid { id: Some(id) } => {
        let response = rpc::error_response(id, &rpc::RpcError::invalid_request());
        let _ = client.send_raw(response.to_string());
      }
      Incoming::Invalid { id: None } => {
        debug!(event = "client_bad_frame", client_id, "dropping malformed notification");
      }
    }
  }

  done.cancel();
  state.registry.remove(client_id);
  let _ = writer_task.await;
  ping_task.abort();
  debug!(event = "client_disconnected", client_id, "client disconnected");
}
