use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::bus::{BusMessage, MessageBus};
use crate::agent::manager::{ManagerHooks, SubagentManager};
use crate::agent::provider::{Provider, SessionEvent};
use crate::agent::session::{AgentSession, MAIN_SESSION_ID, PromptOutcome, SessionEnvelope};
use crate::config::Config;
use crate::daemon::notify::NotificationBus;
use crate::gal::GalCoordinator;
use crate::git::GitView;
use crate::locks::FileLockTable;
use crate::tasks::TaskStore;
use crate::texts;

#[derive(Debug, Error)]
pub enum HostError {
  #[error("agent not initialized")]
  NotInitialized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
  Pending,
  Ready,
  Failed(String),
}

/// Everything re-created by `setup_agent`.
struct HostRuntime {
  workspace: PathBuf,
  manager: SubagentManager,
  gal: GalCoordinator,
  git: GitView,
}

pub(crate) struct HostInner {
  config: Config,
  provider: Arc<dyn Provider>,
  notifier: NotificationBus,
  locks: FileLockTable,
  tasks: Arc<TaskStore>,
  runtime: Mutex<Option<HostRuntime>>,
  ready_tx: watch::Sender<ReadyState>,
  ready_rx: watch::Receiver<ReadyState>,
}

/// Singleton owner of the main agent, the git view, and the GAL
/// coordinator. Exposes the ready gate RPC handlers await so that
/// startup-racing clients get a deterministic "agent not initialized"
/// instead of a hang.
#[derive(Clone)]
pub struct AgentHost {
  inner: Arc<HostInner>,
}

impl AgentHost {
  pub fn new(
    config: Config,
    provider: Arc<dyn Provider>,
    notifier: NotificationBus,
    locks: FileLockTable,
    tasks: Arc<TaskStore>,
  ) -> Self {
    let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);
    Self {
      inner: Arc::new(HostInner {
        config,
        provider,
        notifier,
        locks,
        tasks,
        runtime: Mutex::new(None),
        ready_tx,
        ready_rx,
      }),
    }
  }

  /// (Re-)create the agent stack for a workspace. Idempotent: a previous
  /// runtime is disposed first. Always completes the ready gate, on
  /// failure as well as success.
  pub async fn setup_agent(&self, workspace: &Path) -> Result<(), HostError> {
    self.dispose_runtime();

    let result = self.build_runtime(workspace);
    match &result {
      Ok(()) => {
        info!(event = "agent_setup", workspace = %workspace.display(), "agent setup complete");
        let _ = self.inner.ready_tx.send(ReadyState::Ready);
      }
      Err(e) => {
        warn!(event = "agent_setup_failed", error = %e, "agent setup failed");
        let _ = self.inner.ready_tx.send(ReadyState::Failed(e.to_string()));
      }
    }
    result
  }

  fn build_runtime(&self, workspace: &Path) -> Result<(), HostError> {
    let bus = MessageBus::new();
    let manager = SubagentManager::new(
      Arc::clone(&self.inner.provider),
      bus,
      self.inner.config.max_subagents,
      Vec::new(),
      self.inner.config.model.clone(),
      self.inner.config.thinking.clone(),
    );

    let notifier = self.inner.notifier.clone();
    let emitter: crate::gal::GalEmitter = Arc::new(move |kind: &str, payload: Value| {
      let mut wrapped = match payload {
        Value::Object(map) => Value::Object(map),
        other => json!({ "detail": other }),
      };
      wrapped["kind"] = json!(kind);
      notifier.broadcast("daemon.gal.event", wrapped);
    });
    let gal = GalCoordinator::new(self.inner.locks.clone(), manager.clone(), emitter);

    let git = GitView::new(workspace);
    let notifier = self.inner.notifier.clone();
    git.start(move || {
      notifier.broadcast("daemon.git.changed", json!({}));
    });

    let main_tools = manager.build_main_tools();
    manager.create_main(main_tools);
    manager.set_hooks(Arc::new(HostHooks {
      host: Arc::downgrade(&self.inner),
    }));

    *self.inner.runtime.lock() = Some(HostRuntime {
      workspace: workspace.to_path_buf(),
      manager,
      gal,
      git,
    });
    Ok(())
  }

  fn dispose_runtime(&self) {
    if let Some(runtime) = self.inner.runtime.lock().take() {
      runtime.gal.dispose();
      runtime.manager.dispose_all();
      runtime.git.stop();
    }
  }

  /// Tear everything down (daemon shutdown).
  pub fn dispose(&self) {
    self.dispose_runtime();
    self.inner.locks.dispose();
  }

  /// Await the one-shot ready gate.
  pub async fn await_ready(&self) -> Result<(), HostError> {
    let mut rx = self.inner.ready_rx.clone();
    loop {
      match &*rx.borrow() {
        ReadyState::Ready => return Ok(()),
        ReadyState::Failed(_) => return Err(HostError::NotInitialized),
        ReadyState::Pending => {}
      }
      if rx.changed().await.is_err() {
        return Err(HostError::NotInitialized);
      }
    }
  }

  pub fn ready_state(&self) -> ReadyState {
    self.inner.ready_rx.borrow().clone()
  }

  pub fn manager(&self) -> Result<SubagentManager, HostError> {
    self
      .inner
      .runtime
      .lock()
      .as_ref()
      .map(|r| r.manager.clone())
      .ok_or(HostError::NotInitialized)
  }

  pub fn gal(&self) -> Result<GalCoordinator, HostError> {
    self
      .inner
      .runtime
      .lock()
      .as_ref()
      .map(|r| r.gal.clone())
      .ok_or(HostError::NotInitialized)
  }

  pub fn git(&self) -> Result<GitView, HostError> {
    self
      .inner
      .runtime
      .lock()
      .as_ref()
      .map(|r| r.git.clone())
      .ok_or(HostError::NotInitialized)
  }

  pub fn workspace(&self) -> Option<PathBuf> {
    self.inner.runtime.lock().as_ref().map(|r| r.workspace.clone())
  }

  pub fn main_session(&self) -> Result<AgentSession, HostError> {
    self
      .manager()?
      .main_session()
      .ok_or(HostError::NotInitialized)
  }

  pub fn prompt_main(&self, text: &str) -> Result<PromptOutcome, HostError> {
    Ok(self.main_session()?.prompt(text))
  }

  /// Silent prompts (journal memories, heartbeat, summarization) produce
  /// no client-visible events.
  pub fn prompt_main_silent(&self, text: &str) -> Result<PromptOutcome, HostError> {
    Ok(self.main_session()?.prompt_silent(text))
  }

  pub fn abort_main(&self) -> Result<(), HostError> {
    self.main_session()?.abort();
    Ok(())
  }

  pub fn tasks(&self) -> &Arc<TaskStore> {
    &self.inner.tasks
  }

  pub fn notifier(&self) -> &NotificationBus {
    &self.inner.notifier
  }
}

/// Bridges manager callbacks into the rest of the daemon. Holds only a
/// weak handle; the strong chain is host -> runtime -> manager -> hooks.
struct HostHooks {
  host: Weak<HostInner>,
}

impl HostHooks {
  fn upgrade(&self) -> Option<AgentHost> {
    self.host.upgrade().map(|inner| AgentHost { inner })
  }
}

#[async_trait::async_trait]
impl ManagerHooks for HostHooks {
  fn on_event(&self, envelope: &SessionEnvelope) {
    let Some(host) = self.upgrade() else {
      return;
    };
    if !envelope.silent {
      let method = if envelope.session_id == MAIN_SESSION_ID {
        "daemon.agent.event"
      } else {
        "daemon.subagent.event"
      };
      host.inner.notifier.broadcast(
        method,
        json!({
          "sessionId": &envelope.session_id,
          "sessionName": &envelope.session_name,
          "event": &envelope.event,
        }),
      );

      // Conversation upkeep: after each visible main turn, summarize in a
      // silent secondary prompt. The summarization turn itself is silent,
      // so it cannot re-trigger.
      if envelope.session_id == MAIN_SESSION_ID
        && matches!(envelope.event, SessionEvent::TurnFinished { .. })
        && let Ok(session) = host.main_session()
        && !session.is_streaming()
      {
        session.prompt_silent(texts::SUMMARIZE_PROMPT);
      }
    }
  }

  fn on_subagent_complete(&self, agent_id: &str, final_text: &str) {
    let Some(host) = self.upgrade() else {
      return;
    };
    let agent_id = agent_id.to_string();
    let final_text = final_text.to_string();
    tokio::spawn(async move {
      let tasks = Arc::clone(host.tasks());
      // The watcher's save of the task assignment may still be in flight
      // when a fast worker finishes; give it a moment before giving up.
      let mut attempt = 0u8;
      loop {
        match tasks.mark_done_by_agent(&agent_id, &final_text).await {
          Ok(list) => {
            host
              .inner
              .notifier
              .broadcast("daemon.tasks.changed", serde_json::to_value(&list).unwrap_or_default());
            break;
          }
          Err(crate::tasks::TaskStoreError::NoTaskForAgent(_)) if attempt < 5 => {
            attempt += 1;
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
          }
          Err(e) => {
            warn!(event = "task_complete_unlinked", agent_id = %agent_id, error = %e, "completion without task");
            break;
          }
        }
      }
      if let Ok(gal) = host.gal() {
        gal.on_worker_complete(&agent_id);
      }
      if let Ok(manager) = host.manager() {
        let _ = manager.close(&agent_id);
      }
    });
  }

  fn on_bus_message(&self, message: &BusMessage) {
    let Some(host) = self.upgrade() else {
      return;
    };
    host.inner.notifier.broadcast(
      "daemon.subagent.event",
      json!({ "type": "bus_message", "message": message }),
    );
  }

  async fn on_task_refinement(&self, agent_id: &str, questions: &str) -> Result<Value, String> {
    let host = self.upgrade().ok_or("daemon is shutting down")?;
    let list = host
      .tasks()
      .mark_refinement_by_agent(agent_id, questions)
      .await
      .map_err(|e| e.to_string())?;
    let payload = serde_json::to_value(&list).map_err(|e| e.to_string())?;
    host
      .inner
      .notifier
      .broadcast("daemon.tasks.changed", payload.clone());
    Ok(json!({ "ok": true, "tasks": payload }))
  }

  fn on_status_change(&self) {
    let Some(host) = self.upgrade() else {
      return;
    };
    let Ok(manager) = host.manager() else {
      return;
    };
    host.inner.notifier.broadcast(
      "daemon.subagent.event",
      json!({
        "type": "status",
        "agents": manager.list_all(),
      }),
    );
  }
}
