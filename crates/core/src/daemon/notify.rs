use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::debug;

use crate::rpc;

/// One connected client. The sender feeds the connection's writer task;
/// responses and notifications share it, so each client observes a total
/// order.
pub struct ClientState {
  pub id: u64,
  pub connected_at: DateTime<Utc>,
  tx: tokio::sync::mpsc::UnboundedSender<String>,
  last_pong: Mutex<Instant>,
}

impl ClientState {
  pub fn send_raw(&self, frame: String) -> bool {
    self.tx.send(frame).is_ok()
  }

  pub fn note_pong(&self) {
    *self.last_pong.lock() = Instant::now();
  }

  pub fn last_pong_age(&self) -> std::time::Duration {
    self.last_pong.lock().elapsed()
  }
}

/// Registry of live client connections.
#[derive(Default)]
pub struct ClientRegistry {
  next_id: AtomicU64,
  clients: Mutex<HashMap<u64, Arc<ClientState>>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&self, tx: tokio::sync::mpsc::UnboundedSender<String>) -> Arc<ClientState> {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let client = Arc::new(ClientState {
      id,
      connected_at: Utc::now(),
      tx,
      last_pong: Mutex::new(Instant::now()),
    });
    self.clients.lock().insert(id, Arc::clone(&client));
    client
  }

  pub fn remove(&self, id: u64) {
    self.clients.lock().remove(&id);
  }

  pub fn count(&self) -> usize {
    self.clients.lock().len()
  }

  pub fn all(&self) -> Vec<Arc<ClientState>> {
    self.clients.lock().values().cloned().collect()
  }
}

type Tap = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Sequence-numbered broadcast to every connected client. The counter is
/// process-wide and strictly increasing, so clients can detect gaps and
/// ask for recovery.
#[derive(Clone)]
pub struct NotificationBus {
  registry: Arc<ClientRegistry>,
  seq: Arc<AtomicU64>,
  taps: Arc<Mutex<Vec<Tap>>>,
}

impl NotificationBus {
  pub fn new(registry: Arc<ClientRegistry>) -> Self {
    Self {
      registry,
      seq: Arc::new(AtomicU64::new(0)),
      taps: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn registry(&self) -> &ClientRegistry {
    &self.registry
  }

  /// Register an in-process observer of every broadcast (the extension
  /// host uses this to forward events into interested workers).
  pub fn add_tap(&self, tap: impl Fn(&str, &Value) + Send + Sync + 'static) {
    self.taps.lock().push(Arc::new(tap));
  }

  pub fn current_seq(&self) -> u64 {
    self.seq.load(Ordering::SeqCst)
  }

  /// Wrap `params`, stamp `_seq`, and send to every client. Returns the
  /// assigned sequence number.
  pub fn broadcast(&self, method: &str, params: Value) -> u64 {
    let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
    let wrapped = wrap_params(params, seq);
    let frame = rpc::notification(method, wrapped.clone()).to_string();
    let clients = self.registry.all();
    debug!(
      event = "notification_broadcast",
      method,
      seq,
      clients = clients.len(),
      "notification broadcast"
    );
    for client in &clients {
      // A dead client is cleaned up by its connection task; ignore here.
      let _ = client.send_raw(frame.clone());
    }
    let taps = self.taps.lock().clone();
    for tap in taps {
      tap(method, &wrapped);
    }
    seq
  }

  /// Send a notification to a single client without consuming a sequence
  /// number (connect acks, transport pings).
  pub fn notify_client(&self, client: &ClientState, method: &str, params: Value) {
    let frame = rpc::notification(method, params).to_string();
    let _ = client.send_raw(frame);
  }
}

/// Keep the payload shape stable: arrays are boxed under `data`, objects
/// are extended in place, scalars are boxed under `value`.
fn wrap_params(params: Value, seq: u64) -> Value {
  match params {
    Value::Array(items) => json!({ "data": items, "_seq": seq }),
    Value::Object(mut map) => {
      map.insert("_seq".to_string(), json!(seq));
      Value::Object(map)
    }
    other => json!({ "value": other, "_seq": seq }),
  }
}
