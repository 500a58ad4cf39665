//! The seam between the daemon and whatever LLM SDK drives a session.
//! The daemon is a generic host: it hands the provider a history
//! snapshot, the injected tools and a steer channel, and consumes a
//! stream of session events. `FakeProvider` is the scripted stand-in the
//! test-suite (and a provider-less install) runs against.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
  pub name: String,
  pub description: String,
  pub parameters: Value,
}

type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;
type ToolHandler = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// An injected tool: wire-visible spec plus the in-process handler the
/// provider invokes directly (no LLM roundtrip).
#[derive(Clone)]
pub struct Tool {
  pub spec: ToolSpec,
  handler: ToolHandler,
}

impl Tool {
  pub fn new<F, Fut>(
    name: impl Into<String>,
    description: impl Into<String>,
    parameters: Value,
    f: F,
  ) -> Self
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
  {
    Self {
      spec: ToolSpec {
        name: name.into(),
        description: description.into(),
        parameters,
      },
      handler: Arc::new(move |args| Box::pin(f(args))),
    }
  }

  pub async fn invoke(&self, args: Value) -> Result<Value, String> {
    (self.handler)(args).await
  }
}

impl std::fmt::Debug for Tool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Tool").field("name", &self.spec.name).finish()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum HistoryEntry {
  User {
    text: String,
    at: DateTime<Utc>,
  },
  Assistant {
    text: String,
    at: DateTime<Utc>,
  },
  Tool {
    name: String,
    arguments: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    at: DateTime<Utc>,
  },
}

/// Stream events observed on one agent session, in emission order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
  TurnStarted,
  TextDelta { text: String },
  ToolStarted { name: String, arguments: Value },
  ToolFinished { name: String, ok: bool },
  TurnFinished { text: String },
  TurnError { message: String },
  Aborted,
}

/// Everything a provider needs to run one turn.
pub struct TurnContext {
  pub history: Vec<HistoryEntry>,
  pub prompt: String,
  pub tools: Arc<Vec<Tool>>,
  pub model: Option<String>,
  pub thinking: Option<String>,
  pub events: mpsc::UnboundedSender<SessionEvent>,
  pub steer: mpsc::UnboundedReceiver<String>,
  pub cancel: CancellationToken,
}

#[derive(Debug, Error)]
pub enum ProviderError {
  #[error("provider: {0}")]
  Failed(String),
  #[error("turn aborted")]
  Aborted,
}

/// One LLM conversation turn. The provider streams deltas and tool events
/// through `ctx.events`, consumes steers, honors `ctx.cancel`, and
/// resolves to the final assistant text. Tool records it produced are
/// appended to history by the session, derived from the emitted events.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
  fn name(&self) -> &'static str;
  async fn run_turn(&self, ctx: TurnContext) -> Result<String, ProviderError>;
}

/// Scripted provider. Turn text resolves, in order of preference, to the
/// next queued scripted response, or an `ack:` echo of the prompt.
/// Prompt lines of the form `!tool <name> <json-args>` invoke the named
/// injected tool and fold its result into the reply, which is how tests
/// drive tool execution through a real streaming turn.
pub struct FakeProvider {
  responses: Mutex<std::collections::VecDeque<String>>,
  delay: std::time::Duration,
}

impl Default for FakeProvider {
  fn default() -> Self {
    Self::new()
  }
}

impl FakeProvider {
  pub fn new() -> Self {
    Self {
      responses: Mutex::new(std::collections::VecDeque::new()),
      delay: std::time::Duration::ZERO,
    }
  }

  pub fn with_responses(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
    Self {
      responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
      delay: std::time::Duration::ZERO,
    }
  }

  /// Make each turn take a fixed amount of time, so tests can observe
  /// streaming state and deliver steers mid-turn.
  pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn push_response(&self, text: impl Into<String>) {
    self.responses.lock().push_back(text.into());
  }
}

#[async_trait]
impl Provider for FakeProvider {
  fn name(&self) -> &'static str {
    "fake"
  }

  async fn run_turn(&self, mut ctx: TurnContext) -> Result<String, ProviderError> {
    if !self.delay.is_zero() {
      tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(ProviderError::Aborted),
        _ = tokio::time::sleep(self.delay) => {}
      }
    }
    if ctx.cancel.is_cancelled() {
      return Err(ProviderError::Aborted);
    }

    let mut pieces: Vec<String> = Vec::new();

    // Tool directives embedded in the prompt
    for line in ctx.prompt.lines() {
      let Some(rest) = line.trim().strip_prefix("!tool ") else {
        continue;
      };
      let (name, raw_args) = rest.split_once(' ').unwrap_or((rest, "{}"));
      let args: Value = serde_json::from_str(raw_args.trim()).unwrap_or(Value::Null);
      let Some(tool) = ctx.tools.iter().find(|t| t.spec.name == name) else {
        pieces.push(format!("unknown tool {name}"));
        continue;
      };
      let _ = ctx.events.send(SessionEvent::ToolStarted {
        name: name.to_string(),
        arguments: args.clone(),
      });
      let result = tool.invoke(args).await;
      let _ = ctx.events.send(SessionEvent::ToolFinished {
        name: name.to_string(),
        ok: result.is_ok(),
      });
      match result {
        Ok(v) => pieces.push(v.to_string()),
        Err(e) => pieces.push(format!("tool {name} failed: {e}")),
      }
    }

    // Any steer delivered while the turn was in flight is acknowledged
    while let Ok(steer) = ctx.steer.try_recv() {
      pieces.push(format!("steer: {steer}"));
    }

    let text = match self.responses.lock().pop_front() {
      Some(scripted) => {
        if pieces.is_empty() {
          scripted
        } else {
          format!("{scripted}\n{}", pieces.join("\n"))
        }
      }
      None if pieces.is_empty() => format!("ack: {}", ctx.prompt),
      None => pieces.join("\n"),
    };

    let _ = ctx.events.send(SessionEvent::TextDelta { text: text.clone() });
    Ok(text)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn ctx(prompt: &str, tools: Vec<Tool>) -> (TurnContext, mpsc::UnboundedReceiver<SessionEvent>) {
    let (events, rx) = mpsc::unbounded_channel();
    let (_steer_tx, steer) = mpsc::unbounded_channel();
    (
      TurnContext {
        history: Vec::new(),
        prompt: prompt.to_string(),
        tools: Arc::new(tools),
        model: None,
        thinking: None,
        events,
        steer,
        cancel: CancellationToken::new(),
      },
      rx,
    )
  }

  #[tokio::test]
  async fn echoes_without_script() {
    let p = FakeProvider::new();
    let (c, _rx) = ctx("hello", vec![]);
    assert_eq!(p.run_turn(c).await.unwrap(), "ack: hello");
  }

  #[tokio::test]
  async fn scripted_responses_pop_in_order() {
    let p = FakeProvider::with_responses(["first", "second"]);
    let (c1, _r1) = ctx("a", vec![]);
    let (c2, _r2) = ctx("b", vec![]);
    let (c3, _r3) = ctx("c", vec![]);
    assert_eq!(p.run_turn(c1).await.unwrap(), "first");
    assert_eq!(p.run_turn(c2).await.unwrap(), "second");
    assert_eq!(p.run_turn(c3).await.unwrap(), "ack: c");
  }

  #[tokio::test]
  async fn tool_directives_invoke_injected_tools() {
    let tool = Tool::new(
      "adder",
      "adds a and b",
      json!({"type": "object"}),
      |args: Value| async move {
        let a = args["a"].as_i64().unwrap_or(0);
        let b = args["b"].as_i64().unwrap_or(0);
        Ok(json!(a + b))
      },
    );
    let p = FakeProvider::new();
    let (c, mut rx) = ctx("!tool adder {\"a\": 2, \"b\": 3}", vec![tool]);
    let text = p.run_turn(c).await.unwrap();
    assert_eq!(text, "5");

    let mut kinds = Vec::new();
    while let Ok(e) = rx.try_recv() {
      kinds.push(e);
    }
    assert!(kinds.iter().any(|e| matches!(e, SessionEvent::ToolStarted { name, .. } if name == "adder")));
    assert!(kinds.iter().any(|e| matches!(e, SessionEvent::ToolFinished { ok: true, .. })));
  }

  #[tokio::test(start_paused = true)]
  async fn cancellation_aborts_a_slow_turn() {
    let p = FakeProvider::new().with_delay(std::time::Duration::from_secs(60));
    let (mut c, _rx) = ctx("slow", vec![]);
    let cancel = CancellationToken::new();
    c.cancel = cancel.clone();
    let turn = tokio::spawn(async move { p.run_turn(c).await });
    cancel.cancel();
    let err = turn.await.unwrap().unwrap_err();
    assert!(matches!(err, ProviderError::Aborted));
  }
}
