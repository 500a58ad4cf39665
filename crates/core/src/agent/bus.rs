use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Recipient id that fans a message out to every subscriber except the
/// sender.
pub const BROADCAST_ID: &str = "*";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
  pub from_id: String,
  pub from_name: String,
  pub to_id: String,
  pub to_name: String,
  pub content: String,
  pub at: DateTime<Utc>,
}

type BusHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

#[derive(Default)]
struct BusInner {
  handlers: HashMap<String, BusHandler>,
  history: Vec<BusMessage>,
}

/// In-process point-to-point and broadcast delivery between agent
/// sessions. One handler per agent id; delivery is synchronous from the
/// sender's perspective and ordered per (sender, recipient) pair. History
/// is in-memory only, purged on session reset.
#[derive(Clone, Default)]
pub struct MessageBus {
  inner: Arc<Mutex<BusInner>>,
}

impl MessageBus {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe(&self, agent_id: &str, handler: impl Fn(BusMessage) + Send + Sync + 'static) {
    self
      .inner
      .lock()
      .handlers
      .insert(agent_id.to_string(), Arc::new(handler));
  }

  pub fn unsubscribe(&self, agent_id: &str) {
    self.inner.lock().handlers.remove(agent_id);
  }

  /// Deliver a message, returning how many handlers received it. Handlers
  /// are invoked outside the bus lock so they may publish in turn.
  pub fn publish(&self, message: BusMessage) -> usize {
    let targets: Vec<BusHandler> = {
      let mut inner = self.inner.lock();
      inner.history.push(message.clone());
      if message.to_id == BROADCAST_ID {
        inner
          .handlers
          .iter()
          .filter(|(id, _h)| id.as_str() != message.from_id)
          .map(|(_id, h)| Arc::clone(h))
          .collect()
      } else {
        inner
          .handlers
          .get(&message.to_id)
          .map(Arc::clone)
          .into_iter()
          .collect()
      }
    };
    debug!(
      event = "bus_publish",
      from = %message.from_id,
      to = %message.to_id,
      delivered = targets.len(),
      "bus message published"
    );
    for handler in &targets {
      handler(message.clone());
    }
    targets.len()
  }

  pub fn history(&self) -> Vec<BusMessage> {
    self.inner.lock().history.clone()
  }

  pub fn clear_history(&self) {
    self.inner.lock().history.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex as StdMutex;

  fn msg(from: &str, to: &str, content: &str) -> BusMessage {
    BusMessage {
      from_id: from.to_string(),
      from_name: from.to_uppercase(),
      to_id: to.to_string(),
      to_name: to.to_uppercase(),
      content: content.to_string(),
      at: Utc::now(),
    }
  }

  #[test]
  fn delivers_point_to_point_in_order() {
    let bus = MessageBus::new();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe("b", move |m| sink.lock().unwrap().push(m.content));

    assert_eq!(bus.publish(msg("a", "b", "one")), 1);
    assert_eq!(bus.publish(msg("a", "b", "two")), 1);
    assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
  }

  #[test]
  fn broadcast_skips_sender() {
    let bus = MessageBus::new();
    let seen = Arc::new(StdMutex::new(Vec::<String>::new()));
    for id in ["a", "b", "c"] {
      let sink = Arc::clone(&seen);
      let id = id.to_string();
      bus.subscribe(&id.clone(), move |_m| sink.lock().unwrap().push(id.clone()));
    }
    let delivered = bus.publish(msg("a", BROADCAST_ID, "hello all"));
    assert_eq!(delivered, 2);
    let mut got = seen.lock().unwrap().clone();
    got.sort();
    assert_eq!(got, vec!["b", "c"]);
  }

  #[test]
  fn unknown_recipient_delivers_nowhere() {
    let bus = MessageBus::new();
    assert_eq!(bus.publish(msg("a", "ghost", "anyone?")), 0);
    // The attempt still lands in history for debugging
    assert_eq!(bus.history().len(), 1);
  }

  #[test]
  fn history_is_purged_on_clear() {
    let bus = MessageBus::new();
    bus.publish(msg("a", "b", "x"));
    bus.clear_history();
    assert!(bus.history().is_empty());
  }

  #[test]
  fn handler_may_publish_reentrantly() {
    let bus = MessageBus::new();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let bus2 = bus.clone();
    bus.subscribe("relay", move |m| {
      if m.from_id != "relay" {
        bus2.publish(msg("relay", "final", &format!("fwd: {}", m.content)));
      }
    });
    let sink = Arc::clone(&seen);
    bus.subscribe("final", move |m| sink.lock().unwrap().push(m.content));

    bus.publish(msg("a", "relay", "ping"));
    assert_eq!(*seen.lock().unwrap(), vec!["fwd: ping"]);
  }
}
