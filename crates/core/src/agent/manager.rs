use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::bus::{BROADCAST_ID, BusMessage, MessageBus};
use super::provider::{Provider, SessionEvent, Tool};
use super::session::{
  AgentSession, MAIN_SESSION_ID, PromptOutcome, SessionEnvelope, SessionStatus,
};

/// Maximum depth of the spawn hierarchy: main (0) spawns workers (1),
/// workers may spawn one level further (2) and no deeper.
const MAX_SPAWN_DEPTH: u8 = 2;

/// Trailing assistant text kept for task results.
const RESULT_TEXT_MAX_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum ManagerError {
  #[error("subagent limit reached ({0})")]
  SizeExceeded(usize),
  #[error("unknown agent `{0}`")]
  UnknownAgent(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnConfig {
  pub name: String,
  #[serde(default)]
  pub task: Option<String>,
  #[serde(default)]
  pub persistent: bool,
  /// `Some(false)` forbids the spawned agent from spawning further, even
  /// when the depth limit would allow it.
  #[serde(default)]
  pub can_spawn: Option<bool>,
  #[serde(default)]
  pub task_id: Option<String>,
  #[serde(default)]
  pub model: Option<String>,
  #[serde(default)]
  pub thinking: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubagentInfo {
  #[serde(flatten)]
  pub status: SessionStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub task_id: Option<String>,
}

/// Callbacks out of the manager. The host wires these to the task store,
/// the GAL coordinator and the notification bus; tests override what they
/// need.
#[async_trait::async_trait]
pub trait ManagerHooks: Send + Sync {
  fn on_event(&self, _envelope: &SessionEnvelope) {}
  /// Completion bridge: a task-linked subagent finished its turn.
  fn on_subagent_complete(&self, _agent_id: &str, _final_text: &str) {}
  fn on_bus_message(&self, _message: &BusMessage) {}
  /// `request_input` tool: move the caller's task to refinement and
  /// return the new task list.
  async fn on_task_refinement(&self, _agent_id: &str, _questions: &str) -> Result<Value, String> {
    Err("task refinement is not wired".to_string())
  }
  fn on_status_change(&self) {}
}

struct NullHooks;
#[async_trait::async_trait]
impl ManagerHooks for NullHooks {}

struct Entry {
  session: AgentSession,
  depth: u8,
  task_id: Option<String>,
}

pub(super) struct ManagerInner {
  cap: usize,
  provider: Arc<dyn Provider>,
  bus: MessageBus,
  extra_tools: Vec<Tool>,
  default_model: Option<String>,
  default_thinking: Option<String>,
  sessions: Mutex<HashMap<String, Entry>>,
  hooks: Mutex<Arc<dyn ManagerHooks>>,
  sink: mpsc::UnboundedSender<SessionEnvelope>,
}

/// Owner of every agent session (main included). All session mutation and
/// bus routing goes through here.
#[derive(Clone)]
pub struct SubagentManager {
  pub(super) inner: Arc<ManagerInner>,
}

impl SubagentManager {
  pub fn new(
    provider: Arc<dyn Provider>,
    bus: MessageBus,
    cap: usize,
    extra_tools: Vec<Tool>,
    default_model: Option<String>,
    default_thinking: Option<String>,
  ) -> Self {
    let (sink, rx) = mpsc::unbounded_channel();
    let manager = Self {
      inner: Arc::new(ManagerInner {
        cap,
        provider,
        bus,
        extra_tools,
        default_model,
        default_thinking,
        sessions: Mutex::new(HashMap::new()),
        hooks: Mutex::new(Arc::new(NullHooks)),
        sink,
      }),
    };
    manager.spawn_event_pump(rx);
    manager
  }

  pub fn set_hooks(&self, hooks: Arc<dyn ManagerHooks>) {
    *self.inner.hooks.lock() = hooks;
  }

  pub fn bus(&self) -> &MessageBus {
    &self.inner.bus
  }

  /// Create and register the main agent session with the given toolset.
  pub fn create_main(&self, tools: Vec<Tool>) -> AgentSession {
    self.insert_session(
      MAIN_SESSION_ID.to_string(),
      "Main".to_string(),
      true,
      false,
      tools,
      0,
      None,
    )
  }

  pub fn main_session(&self) -> Option<AgentSession> {
    self.session(MAIN_SESSION_ID)
  }

  /// Spawn one session per config. Capacity is checked after purging
  /// finished non-persistent sessions; exceeding it fails the whole call.
  pub fn spawn(
    &self,
    configs: &[SpawnConfig],
    parent_depth: u8,
  ) -> Result<Vec<SubagentInfo>, ManagerError> {
    self.spawn_with(configs, parent_depth, None)
  }

  /// Like [`spawn`], with extra per-agent tools built once the id is
  /// allocated. This is how the GAL coordinator injects its lock tools
  /// without touching the shared tool builder.
  pub fn spawn_with(
    &self,
    configs: &[SpawnConfig],
    parent_depth: u8,
    extra_tools: Option<&(dyn Fn(&str, &str) -> Vec<Tool> + Send + Sync)>,
  ) -> Result<Vec<SubagentInfo>, ManagerError> {
    self.purge_finished();
    {
      let sessions = self.inner.sessions.lock();
      let live = sessions.keys().filter(|id| *id != MAIN_SESSION_ID).count();
      if live + configs.len() > self.inner.cap {
        return Err(ManagerError::SizeExceeded(self.inner.cap));
      }
    }

    let depth = parent_depth.saturating_add(1);
    let mut infos = Vec::with_capacity(configs.len());
    for config in configs {
      let id = allocate_subagent_id();
      let can_spawn = depth < MAX_SPAWN_DEPTH && config.can_spawn != Some(false);
      let mut tools = self.build_tools_for_agent(&id, &config.name, can_spawn, depth);
      if let Some(extra) = extra_tools {
        tools.extend(extra(&id, &config.name));
      }
      let session = self.insert_session(
        id.clone(),
        config.name.clone(),
        config.persistent,
        false,
        tools,
        depth,
        config.task_id.clone(),
      );
      if let Some(model) = config.model.clone().or_else(|| self.inner.default_model.clone()) {
        session.set_model(Some(model));
      }
      if let Some(thinking) = config
        .thinking
        .clone()
        .or_else(|| self.inner.default_thinking.clone())
      {
        session.set_thinking(Some(thinking));
      }
      if let Some(task) = config.task.as_deref().filter(|t| !t.is_empty()) {
        // Fire-and-forget: the turn streams through the event pump.
        session.prompt(task);
      }
      info!(
        event = "subagent_spawned",
        id = %id,
        name = %config.name,
        depth,
        can_spawn,
        task_id = ?config.task_id,
        "subagent spawned"
      );
      infos.push(SubagentInfo {
        status: session.status(),
        task_id: config.task_id.clone(),
      });
    }
    let hooks = self.inner.hooks.lock().clone();
    hooks.on_status_change();
    Ok(infos)
  }

  /// Register a session with a custom toolset, outside the capacity cap.
  /// Used for coordinator-owned sessions such as the GAL LLM session.
  pub fn spawn_custom(
    &self,
    name: &str,
    tools: Vec<Tool>,
    persistent: bool,
    silent: bool,
  ) -> SubagentInfo {
    let id = allocate_subagent_id();
    let session = self.insert_session(id, name.to_string(), persistent, silent, tools, 1, None);
    SubagentInfo {
      status: session.status(),
      task_id: None,
    }
  }

  pub fn prompt(&self, id: &str, text: &str) -> Result<PromptOutcome, ManagerError> {
    let session = self
      .session(id)
      .ok_or_else(|| ManagerError::UnknownAgent(id.to_string()))?;
    Ok(session.prompt(text))
  }

  pub fn abort(&self, id: &str) -> Result<(), ManagerError> {
    let session = self
      .session(id)
      .ok_or_else(|| ManagerError::UnknownAgent(id.to_string()))?;
    session.abort();
    Ok(())
  }

  pub fn close(&self, id: &str) -> Result<(), ManagerError> {
    let entry = self
      .inner
      .sessions
      .lock()
      .remove(id)
      .ok_or_else(|| ManagerError::UnknownAgent(id.to_string()))?;
    entry.session.dispose();
    self.inner.bus.unsubscribe(id);
    debug!(event = "subagent_closed", id, "subagent closed");
    let hooks = self.inner.hooks.lock().clone();
    hooks.on_status_change();
    Ok(())
  }

  pub fn dispose_all(&self) {
    let entries: Vec<(String, Entry)> = self.inner.sessions.lock().drain().collect();
    for (id, entry) in entries {
      entry.session.dispose();
      self.inner.bus.unsubscribe(&id);
    }
    self.inner.bus.clear_history();
  }

  /// Resolve `to` (case-insensitive name, exact id, `main`, or `*`) and
  /// publish on the bus. Returns a human-readable ack for the tool reply.
  pub fn send_agent_message(
    &self,
    from_id: &str,
    to: &str,
    content: &str,
  ) -> Result<String, ManagerError> {
    let from_name = self
      .session(from_id)
      .map(|s| s.name().to_string())
      .unwrap_or_else(|| from_id.to_string());
    let (to_id, to_name) = if to == BROADCAST_ID {
      (BROADCAST_ID.to_string(), "everyone".to_string())
    } else {
      let session = self
        .resolve(to)
        .ok_or_else(|| ManagerError::UnknownAgent(to.to_string()))?;
      (session.id().to_string(), session.name().to_string())
    };
    let message = BusMessage {
      from_id: from_id.to_string(),
      from_name,
      to_id: to_id.clone(),
      to_name: to_name.clone(),
      content: content.to_string(),
      at: Utc::now(),
    };
    let delivered = self.inner.bus.publish(message.clone());
    let hooks = self.inner.hooks.lock().clone();
    hooks.on_bus_message(&message);
    Ok(if to_id == BROADCAST_ID {
      format!("message broadcast to {delivered} agent(s)")
    } else {
      format!("message delivered to {to_name}")
    })
  }

  /// All subagent sessions (main excluded).
  pub fn list_all(&self) -> Vec<SubagentInfo> {
    let sessions = self.inner.sessions.lock();
    let mut infos: Vec<SubagentInfo> = sessions
      .iter()
      .filter(|(id, _e)| id.as_str() != MAIN_SESSION_ID)
      .map(|(_id, e)| SubagentInfo {
        status: e.session.status(),
        task_id: e.task_id.clone(),
      })
      .collect();
    infos.sort_by(|a, b| a.status.created_at.cmp(&b.status.created_at).then_with(|| a.status.id.cmp(&b.status.id)));
    infos
  }

  pub fn get_status(&self, id: &str) -> Result<SubagentInfo, ManagerError> {
    let sessions = self.inner.sessions.lock();
    let entry = sessions
      .get(id)
      .ok_or_else(|| ManagerError::UnknownAgent(id.to_string()))?;
    Ok(SubagentInfo {
      status: entry.session.status(),
      task_id: entry.task_id.clone(),
    })
  }

  pub fn get_history(
    &self,
    id: &str,
  ) -> Result<Vec<super::provider::HistoryEntry>, ManagerError> {
    let session = self
      .session(id)
      .ok_or_else(|| ManagerError::UnknownAgent(id.to_string()))?;
    Ok(session.history())
  }

  pub fn session(&self, id: &str) -> Option<AgentSession> {
    self.inner.sessions.lock().get(id).map(|e| e.session.clone())
  }

  pub fn knows_agent(&self, id: &str) -> bool {
    self.inner.sessions.lock().contains_key(id)
  }

  pub fn subagent_count(&self) -> usize {
    self
      .inner
      .sessions
      .lock()
      .keys()
      .filter(|id| *id != MAIN_SESSION_ID)
      .count()
  }

  pub fn any_streaming(&self) -> bool {
    self
      .inner
      .sessions
      .lock()
      .values()
      .any(|e| e.session.is_streaming())
  }

  /// Case-insensitive name match, falling back to exact id match.
  pub fn resolve(&self, name_or_id: &str) -> Option<AgentSession> {
    let sessions = self.inner.sessions.lock();
    if let Some(entry) = sessions.get(name_or_id) {
      return Some(entry.session.clone());
    }
    let lowered = name_or_id.to_lowercase();
    sessions
      .values()
      .find(|e| e.session.name().to_lowercase() == lowered)
      .map(|e| e.session.clone())
  }

  pub(super) fn extra_tools(&self) -> &[Tool] {
    &self.inner.extra_tools
  }

  pub(super) fn hooks_arc(&self) -> Arc<dyn ManagerHooks> {
    self.inner.hooks.lock().clone()
  }

  pub(super) fn downgrade(&self) -> std::sync::Weak<ManagerInner> {
    Arc::downgrade(&self.inner)
  }

  pub(super) fn from_inner(inner: Arc<ManagerInner>) -> Self {
    Self { inner }
  }

  fn insert_session(
    &self,
    id: String,
    name: String,
    persistent: bool,
    silent: bool,
    tools: Vec<Tool>,
    depth: u8,
    task_id: Option<String>,
  ) -> AgentSession {
    let session = AgentSession::new(
      id.clone(),
      name,
      persistent,
      silent,
      Arc::clone(&self.inner.provider),
      tools,
      self.inner.default_model.clone(),
      self.inner.default_thinking.clone(),
      self.inner.sink.clone(),
    );
    self.inner.sessions.lock().insert(
      id.clone(),
      Entry {
        session: session.clone(),
        depth,
        task_id,
      },
    );
    // Bus delivery forwards into the recipient's prompt queue: a fresh
    // turn when idle, a steer when streaming.
    let recipient = session.clone();
    self.inner.bus.subscribe(&id, move |message| {
      let text = format!("Message from {}: {}", message.from_name, message.content);
      recipient.prompt(&text);
    });
    session
  }

  fn purge_finished(&self) {
    let purged: Vec<String> = {
      let mut sessions = self.inner.sessions.lock();
      let ids: Vec<String> = sessions
        .iter()
        .filter(|(id, e)| {
          id.as_str() != MAIN_SESSION_ID && e.session.is_finished() && !e.session.is_persistent()
        })
        .map(|(id, _e)| id.clone())
        .collect();
      for id in &ids {
        sessions.remove(id);
      }
      ids
    };
    for id in &purged {
      self.inner.bus.unsubscribe(id);
    }
    if !purged.is_empty() {
      debug!(event = "subagents_purged", count = purged.len(), "finished subagents purged");
    }
  }

  pub(super) fn depth_of(&self, id: &str) -> u8 {
    self
      .inner
      .sessions
      .lock()
      .get(id)
      .map(|e| e.depth)
      .unwrap_or(1)
  }

  fn spawn_event_pump(&self, mut rx: mpsc::UnboundedReceiver<SessionEnvelope>) {
    // Weak so a replaced manager (setup_agent on a new workspace) lets
    // this pump drain and exit once its senders are gone.
    let weak = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      while let Some(envelope) = rx.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        let manager = SubagentManager { inner };
        let hooks = manager.inner.hooks.lock().clone();
        hooks.on_event(&envelope);
        if envelope.session_id != MAIN_SESSION_ID
          && matches!(envelope.event, SessionEvent::TurnFinished { .. })
        {
          let linked = {
            let sessions = manager.inner.sessions.lock();
            sessions
              .get(&envelope.session_id)
              .filter(|e| e.task_id.is_some() && !e.session.is_persistent())
              .map(|e| e.session.trailing_assistant_text(RESULT_TEXT_MAX_CHARS))
          };
          if let Some(final_text) = linked {
            hooks.on_subagent_complete(&envelope.session_id, &final_text);
          }
        }
      }
      debug!(event = "event_pump_stopped", "manager event pump stopped");
    });
  }
}

fn allocate_subagent_id() -> String {
  let millis = Utc::now().timestamp_millis();
  let rand = Uuid::new_v4().simple().to_string();
  format!("sub-{millis}-{}", &rand[..6])
}
