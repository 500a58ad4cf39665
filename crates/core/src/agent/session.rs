use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::provider::{HistoryEntry, Provider, ProviderError, SessionEvent, Tool, TurnContext};

/// Fixed id of the main agent session.
pub const MAIN_SESSION_ID: &str = "main";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
  pub id: String,
  pub name: String,
  pub streaming: bool,
  pub message_count: u64,
  pub created_at: DateTime<Utc>,
  pub persistent: bool,
  pub finished: bool,
}

/// A session event tagged with its origin, as delivered to the manager's
/// event pump. `silent` marks turns whose events must not reach clients.
#[derive(Debug, Clone)]
pub struct SessionEnvelope {
  pub session_id: String,
  pub session_name: String,
  pub silent: bool,
  pub event: SessionEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
  /// A new turn was started.
  Started,
  /// The session was already streaming; the text was delivered in-stream.
  Steered,
}

struct SessionInner {
  id: String,
  name: String,
  persistent: bool,
  created_at: DateTime<Utc>,
  silent_base: AtomicBool,
  streaming: AtomicBool,
  finished: AtomicBool,
  message_count: AtomicU64,
  history: Mutex<Vec<HistoryEntry>>,
  tools: Mutex<Arc<Vec<Tool>>>,
  model: Mutex<Option<String>>,
  thinking: Mutex<Option<String>>,
  steer_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
  cancel: Mutex<Option<CancellationToken>>,
  provider: Arc<dyn Provider>,
  sink: mpsc::UnboundedSender<SessionEnvelope>,
}

/// One logical LLM conversation: history, streaming state, injected tools.
/// Mutation happens only through the owning manager.
#[derive(Clone)]
pub struct AgentSession {
  inner: Arc<SessionInner>,
}

impl AgentSession {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    id: impl Into<String>,
    name: impl Into<String>,
    persistent: bool,
    silent: bool,
    provider: Arc<dyn Provider>,
    tools: Vec<Tool>,
    model: Option<String>,
    thinking: Option<String>,
    sink: mpsc::UnboundedSender<SessionEnvelope>,
  ) -> Self {
    Self {
      inner: Arc::new(SessionInner {
        id: id.into(),
        name: name.into(),
        persistent,
        created_at: Utc::now(),
        silent_base: AtomicBool::new(silent),
        streaming: AtomicBool::new(false),
        finished: AtomicBool::new(false),
        message_count: AtomicU64::new(0),
        history: Mutex::new(Vec::new()),
        tools: Mutex::new(Arc::new(tools)),
        model: Mutex::new(model),
        thinking: Mutex::new(thinking),
        steer_tx: Mutex::new(None),
        cancel: Mutex::new(None),
        provider,
        sink,
      }),
    }
  }

  pub fn id(&self) -> &str {
    &self.inner.id
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn is_streaming(&self) -> bool {
    self.inner.streaming.load(Ordering::SeqCst)
  }

  pub fn is_finished(&self) -> bool {
    self.inner.finished.load(Ordering::SeqCst)
  }

  pub fn is_persistent(&self) -> bool {
    self.inner.persistent
  }

  pub fn history(&self) -> Vec<HistoryEntry> {
    self.inner.history.lock().clone()
  }

  pub fn status(&self) -> SessionStatus {
    SessionStatus {
      id: self.inner.id.clone(),
      name: self.inner.name.clone(),
      streaming: self.is_streaming(),
      message_count: self.inner.message_count.load(Ordering::SeqCst),
      created_at: self.inner.created_at,
      persistent: self.inner.persistent,
      finished: self.is_finished(),
    }
  }

  pub fn set_model(&self, model: Option<String>) {
    *self.inner.model.lock() = model;
  }

  pub fn model(&self) -> Option<String> {
    self.inner.model.lock().clone()
  }

  pub fn set_thinking(&self, thinking: Option<String>) {
    *self.inner.thinking.lock() = thinking;
  }

  pub fn thinking(&self) -> Option<String> {
    self.inner.thinking.lock().clone()
  }

  pub fn set_tools(&self, tools: Vec<Tool>) {
    *self.inner.tools.lock() = Arc::new(tools);
  }

  /// The trailing assistant text, trimmed to `max_chars`. Used by the
  /// task completion bridge.
  pub fn trailing_assistant_text(&self, max_chars: usize) -> String {
    let history = self.inner.history.lock();
    let text = history
      .iter()
      .rev()
      .find_map(|e| match e {
        HistoryEntry::Assistant { text, .. } => Some(text.clone()),
        _ => None,
      })
      .unwrap_or_default();
    text.chars().take(max_chars).collect()
  }

  /// Route text into the session: a fresh turn when idle, an in-stream
  /// steer when a turn is already running.
  pub fn prompt(&self, text: &str) -> PromptOutcome {
    self.prompt_with(text, false)
  }

  /// Silent prompts produce no client-visible events (the envelope is
  /// flagged and the forwarder drops it).
  pub fn prompt_silent(&self, text: &str) -> PromptOutcome {
    self.prompt_with(text, true)
  }

  fn prompt_with(&self, text: &str, silent: bool) -> PromptOutcome {
    if self.is_streaming() {
      let steer = self.inner.steer_tx.lock();
      if let Some(tx) = steer.as_ref()
        && tx.send(text.to_string()).is_ok()
      {
        debug!(event = "session_steered", session = %self.inner.id, "steer delivered");
        return PromptOutcome::Steered;
      }
    }
    self.start_turn(text, silent);
    PromptOutcome::Started
  }

  pub fn abort(&self) {
    if let Some(cancel) = self.inner.cancel.lock().as_ref() {
      cancel.cancel();
    }
  }

  /// Abort any in-flight turn and mark the session finished.
  pub fn dispose(&self) {
    self.abort();
    self.inner.finished.store(true, Ordering::SeqCst);
  }

  fn emit(&self, silent: bool, event: SessionEvent) {
    let _ = self.inner.sink.send(SessionEnvelope {
      session_id: self.inner.id.clone(),
      session_name: self.inner.name.clone(),
      silent,
      event,
    });
  }

  fn start_turn(&self, text: &str, silent_turn: bool) {
    let inner = Arc::clone(&self.inner);
    let silent = silent_turn || inner.silent_base.load(Ordering::SeqCst);
    inner.streaming.store(true, Ordering::SeqCst);
    inner.finished.store(false, Ordering::SeqCst);
    inner.message_count.fetch_add(1, Ordering::SeqCst);
    inner.history.lock().push(HistoryEntry::User {
      text: text.to_string(),
      at: Utc::now(),
    });

    let (steer_tx, steer_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    *inner.steer_tx.lock() = Some(steer_tx);
    *inner.cancel.lock() = Some(cancel.clone());

    self.emit(silent, SessionEvent::TurnStarted);

    let session = self.clone();
    let prompt = text.to_string();
    tokio::spawn(async move {
      let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<SessionEvent>();
      let forward_session = session.clone();
      let forwarder = tokio::spawn(async move {
        while let Some(event) = ev_rx.recv().await {
          forward_session.record_tool_event(&event);
          forward_session.emit(silent, event);
        }
      });

      let ctx = TurnContext {
        history: inner.history.lock().clone(),
        prompt,
        tools: Arc::clone(&inner.tools.lock()),
        model: inner.model.lock().clone(),
        thinking: inner.thinking.lock().clone(),
        events: ev_tx,
        steer: steer_rx,
        cancel,
      };
      let outcome = inner.provider.run_turn(ctx).await;
      // The context (and its event sender) is consumed by now; wait for
      // the forwarder so provider events precede the terminal event.
      let _ = forwarder.await;

      *inner.steer_tx.lock() = None;
      *inner.cancel.lock() = None;
      // Mark finished before clearing the streaming flag: an observer
      // that sees the session idle must also see it purgeable.
      if !inner.persistent && outcome.is_ok() {
        inner.finished.store(true, Ordering::SeqCst);
      }
      inner.streaming.store(false, Ordering::SeqCst);

      match outcome {
        Ok(text) => {
          inner.history.lock().push(HistoryEntry::Assistant {
            text: text.clone(),
            at: Utc::now(),
          });
          session.emit(silent, SessionEvent::TurnFinished { text });
        }
        Err(ProviderError::Aborted) => {
          session.emit(silent, SessionEvent::Aborted);
        }
        Err(ProviderError::Failed(message)) => {
          warn!(event = "session_turn_failed", session = %inner.id, error = %message, "turn failed");
          session.emit(silent, SessionEvent::TurnError { message });
        }
      }
    });
  }

  fn record_tool_event(&self, event: &SessionEvent) {
    match event {
      SessionEvent::ToolStarted { name, arguments } => {
        self.inner.history.lock().push(HistoryEntry::Tool {
          name: name.clone(),
          arguments: arguments.clone(),
          result: None,
          error: None,
          at: Utc::now(),
        });
      }
      SessionEvent::ToolFinished { name, ok } => {
        let mut history = self.inner.history.lock();
        if let Some(HistoryEntry::Tool { result, error, .. }) =
          history.iter_mut().rev().find(|e| {
            matches!(e, HistoryEntry::Tool { name: n, result: None, .. } if n == name)
          })
        {
          if *ok {
            *result = Some(serde_json::json!({ "ok": true }));
          } else {
            *error = Some("tool failed".to_string());
          }
        }
      }
      _ => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::provider::FakeProvider;
  use std::time::Duration;

  fn session_with(
    provider: FakeProvider,
    persistent: bool,
  ) -> (AgentSession, mpsc::UnboundedReceiver<SessionEnvelope>) {
    let (sink, rx) = mpsc::unbounded_channel();
    let session = AgentSession::new(
      "s-1",
      "Tester",
      persistent,
      false,
      Arc::new(provider),
      Vec::new(),
      None,
      None,
      sink,
    );
    (session, rx)
  }

  async fn drain_until_terminal(rx: &mut mpsc::UnboundedReceiver<SessionEnvelope>) -> Vec<SessionEnvelope> {
    let mut seen = Vec::new();
    while let Some(env) = rx.recv().await {
      let terminal = matches!(
        env.event,
        SessionEvent::TurnFinished { .. } | SessionEvent::TurnError { .. } | SessionEvent::Aborted
      );
      seen.push(env);
      if terminal {
        break;
      }
    }
    seen
  }

  #[tokio::test]
  async fn turn_produces_ordered_events_and_history() {
    let (session, mut rx) = session_with(FakeProvider::new(), true);
    assert_eq!(session.prompt("hello"), PromptOutcome::Started);
    let events = drain_until_terminal(&mut rx).await;

    assert!(matches!(events.first().map(|e| &e.event), Some(SessionEvent::TurnStarted)));
    assert!(matches!(
      events.last().map(|e| &e.event),
      Some(SessionEvent::TurnFinished { text }) if text == "ack: hello"
    ));
    assert!(!session.is_streaming());
    assert!(!session.is_finished(), "persistent sessions never auto-finish");

    let history = session.history();
    assert!(matches!(&history[0], HistoryEntry::User { text, .. } if text == "hello"));
    assert!(matches!(&history[1], HistoryEntry::Assistant { text, .. } if text == "ack: hello"));
    assert_eq!(session.trailing_assistant_text(3), "ack");
  }

  #[tokio::test]
  async fn non_persistent_session_finishes_after_turn() {
    let (session, mut rx) = session_with(FakeProvider::new(), false);
    session.prompt("task");
    drain_until_terminal(&mut rx).await;
    assert!(session.is_finished());
  }

  #[tokio::test(start_paused = true)]
  async fn prompt_during_stream_steers() {
    let (session, mut rx) = session_with(
      FakeProvider::new().with_delay(Duration::from_secs(2)),
      true,
    );
    assert_eq!(session.prompt("long task"), PromptOutcome::Started);
    // The turn is sleeping on the fake provider's delay
    tokio::task::yield_now().await;
    assert!(session.is_streaming());
    assert_eq!(session.prompt("also do this"), PromptOutcome::Steered);

    let events = drain_until_terminal(&mut rx).await;
    let SessionEvent::TurnFinished { text } = &events.last().unwrap().event else {
      panic!("expected finish");
    };
    assert!(text.contains("steer: also do this"), "got: {text}");
  }

  #[tokio::test(start_paused = true)]
  async fn abort_emits_aborted() {
    let (session, mut rx) = session_with(
      FakeProvider::new().with_delay(Duration::from_secs(30)),
      true,
    );
    session.prompt("slow");
    tokio::task::yield_now().await;
    session.abort();
    let events = drain_until_terminal(&mut rx).await;
    assert!(matches!(events.last().unwrap().event, SessionEvent::Aborted));
    assert!(!session.is_streaming());
  }

  #[tokio::test]
  async fn silent_prompt_flags_every_envelope() {
    let (session, mut rx) = session_with(FakeProvider::new(), true);
    session.prompt_silent("internal bookkeeping");
    let events = drain_until_terminal(&mut rx).await;
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.silent));
  }
}
