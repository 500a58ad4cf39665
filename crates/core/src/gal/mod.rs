//! The GAL ("global agent lock") coordinator: spawns workers with lock
//! tools injected, reacts to lock-table events, and optionally hosts a
//! persistent coordinator session that can take actions of its own.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::{ManagerError, SpawnConfig, SubagentManager, Tool};
use crate::locks::{
  CheckOutcome, ClaimOutcome, FileLockTable, GAL_HOLDER_ID, LockEvent, LockInfo,
};
use crate::texts;

#[derive(Debug, Error)]
pub enum GalError {
  #[error("spawn: {0}")]
  Spawn(#[from] ManagerError),
}

/// One task handed to `submit_tasks`.
#[derive(Debug, Clone)]
pub struct GalTask {
  pub id: String,
  pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
  pub id: String,
  pub name: String,
  pub task_id: String,
  pub task_text: String,
  pub spawned_at: DateTime<Utc>,
  pub locks_held: Vec<std::path::PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SubmittedWorker {
  pub task_id: String,
  pub subagent_id: String,
  pub name: String,
}

/// External event sink: `(kind, payload)` pairs forwarded to clients as
/// `daemon.gal.event` notifications.
pub type GalEmitter = Arc<dyn Fn(&str, Value) + Send + Sync>;

struct WorkerRecord {
  name: String,
  task_id: String,
  task_text: String,
  spawned_at: DateTime<Utc>,
}

struct GalInner {
  locks: FileLockTable,
  manager: SubagentManager,
  emitter: GalEmitter,
  workers: Mutex<HashMap<String, WorkerRecord>>,
  submit_lock: tokio::sync::Mutex<()>,
  contention_count: AtomicU64,
  gal_session_id: Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct GalCoordinator {
  inner: Arc<GalInner>,
}

impl GalCoordinator {
  pub fn new(locks: FileLockTable, manager: SubagentManager, emitter: GalEmitter) -> Self {
    let coordinator = Self {
      inner: Arc::new(GalInner {
        locks,
        manager,
        emitter,
        workers: Mutex::new(HashMap::new()),
        submit_lock: tokio::sync::Mutex::new(()),
        contention_count: AtomicU64::new(0),
        gal_session_id: Mutex::new(None),
      }),
    };
    coordinator.install_lock_listener();
    coordinator
  }

  fn install_lock_listener(&self) {
    let weak: Weak<GalInner> = Arc::downgrade(&self.inner);
    self.inner.locks.set_listener(move |event| {
      if let Some(inner) = weak.upgrade() {
        GalCoordinator { inner }.handle_lock_event(event);
      }
    });
  }

  /// Spawn one worker per task, each with the file-lock preamble and the
  /// three lock tools bound to its id. Submits are serialized so two
  /// near-simultaneous callers cannot interleave their spawns.
  pub async fn submit_tasks(
    &self,
    tasks: &[GalTask],
    context: Option<&str>,
    model: Option<String>,
    thinking: Option<String>,
  ) -> Result<Vec<SubmittedWorker>, GalError> {
    let _guard = self.inner.submit_lock.lock().await;
    let mut submitted = Vec::with_capacity(tasks.len());
    for task in tasks {
      let name = worker_name(&task.id);
      let mut prompt = String::from(texts::FILE_LOCK_PREAMBLE);
      if let Some(context) = context.filter(|c| !c.is_empty()) {
        prompt.push_str("\n\nContext: ");
        prompt.push_str(context);
      }
      prompt.push_str("\n\nYour task: ");
      prompt.push_str(&task.text);

      let config = SpawnConfig {
        name: name.clone(),
        task: Some(prompt),
        persistent: false,
        can_spawn: Some(false),
        task_id: Some(task.id.clone()),
        model: model.clone(),
        thinking: thinking.clone(),
      };
      let locks = self.inner.locks.clone();
      let infos = self
        .inner
        .manager
        .spawn_with(&[config], 0, Some(&|id: &str, name: &str| {
          lock_tools(&locks, id, name)
        }))?;
      let info = &infos[0];
      self.inner.workers.lock().insert(
        info.status.id.clone(),
        WorkerRecord {
          name: name.clone(),
          task_id: task.id.clone(),
          task_text: task.text.clone(),
          spawned_at: Utc::now(),
        },
      );
      info!(
        event = "gal_worker_spawned",
        worker = %info.status.id,
        task_id = %task.id,
        "gal worker spawned"
      );
      submitted.push(SubmittedWorker {
        task_id: task.id.clone(),
        subagent_id: info.status.id.clone(),
        name,
      });
    }
    Ok(submitted)
  }

  /// Release everything the worker holds, drop its record, and tell the
  /// GAL session (when active).
  pub fn on_worker_complete(&self, subagent_id: &str) {
    let released = self.inner.locks.release_all_for_agent(subagent_id);
    let removed = self.inner.workers.lock().remove(subagent_id);
    if let Some(record) = removed {
      info!(
        event = "gal_worker_complete",
        worker = subagent_id,
        task_id = %record.task_id,
        released = released.len(),
        "gal worker complete"
      );
      self.notify_gal(
        "worker_complete",
        &format!("worker {subagent_id} finished task {}", record.task_id),
      );
    }
  }

  pub fn is_worker(&self, subagent_id: &str) -> bool {
    self.inner.workers.lock().contains_key(subagent_id)
  }

  /// Start the optional persistent coordinator session. Idempotent; its
  /// presence changes nothing for `submit_tasks` callers.
  pub fn ensure_gal_session(&self) -> String {
    if let Some(id) = self.inner.gal_session_id.lock().clone() {
      return id;
    }
    let tools = self.gal_session_tools();
    let info = self.inner.manager.spawn_custom("GAL", tools, true, true);
    let id = info.status.id.clone();
    *self.inner.gal_session_id.lock() = Some(id.clone());
    if let Some(session) = self.inner.manager.session(&id) {
      session.prompt_silent(texts::GAL_SYSTEM_PROMPT);
    }
    info!(event = "gal_session_started", id = %id, "gal session started");
    id
  }

  pub fn gal_session_id(&self) -> Option<String> {
    self.inner.gal_session_id.lock().clone()
  }

  pub fn get_status(&self) -> Value {
    json!({
      "workers": self.inner.workers.lock().len(),
      "locks": self.inner.locks.size(),
      "contentionCount": self.inner.contention_count.load(Ordering::SeqCst),
      "galSessionActive": self.inner.gal_session_id.lock().is_some(),
    })
  }

  pub fn get_locks(&self) -> Vec<LockInfo> {
    self.inner.locks.locks_snapshot()
  }

  pub fn get_workers(&self) -> Vec<WorkerInfo> {
    let workers = self.inner.workers.lock();
    let mut infos: Vec<WorkerInfo> = workers
      .iter()
      .map(|(id, record)| WorkerInfo {
        id: id.clone(),
        name: record.name.clone(),
        task_id: record.task_id.clone(),
        task_text: record.task_text.clone(),
        spawned_at: record.spawned_at,
        locks_held: self.inner.locks.paths_held_by(id),
      })
      .collect();
    infos.sort_by(|a, b| a.spawned_at.cmp(&b.spawned_at).then_with(|| a.id.cmp(&b.id)));
    infos
  }

  /// Abort and close every worker, drop the GAL session, release locks.
  pub fn dispose(&self) {
    let worker_ids: Vec<String> = self.inner.workers.lock().keys().cloned().collect();
    for id in worker_ids {
      self.inner.locks.release_all_for_agent(&id);
      let _ = self.inner.manager.close(&id);
    }
    self.inner.workers.lock().clear();
    if let Some(id) = self.inner.gal_session_id.lock().take() {
      let _ = self.inner.manager.close(&id);
    }
  }

  fn handle_lock_event(&self, event: &LockEvent) {
    match event {
      LockEvent::Contention {
        path,
        holder_id,
        requester_id,
        ..
      } => {
        self.inner.contention_count.fetch_add(1, Ordering::SeqCst);
        self.emit("contention", event);
        self.notify_gal(
          "contention",
          &format!(
            "{requester_id} wants {} held by {holder_id}",
            path.display()
          ),
        );
      }
      LockEvent::Timeout { path, holder_id, .. } => {
        let _ = self.inner.manager.send_agent_message(
          GAL_HOLDER_ID,
          holder_id,
          &format!(
            "your lock on {} timed out, re-claim when ready",
            path.display()
          ),
        );
        self.emit("timeout", event);
        self.notify_gal(
          "timeout",
          &format!("lock on {} held by {holder_id} timed out", path.display()),
        );
      }
      LockEvent::Deadlock { cycle } => {
        self.break_deadlock(cycle);
        self.emit("deadlock", event);
        self.notify_gal("deadlock", &format!("cycle: {}", cycle.join(" -> ")));
      }
      LockEvent::Released { path, holder_id, .. } => {
        // The next waiter is already granted by the table; nothing to do.
        debug!(
          event = "gal_lock_released",
          path = %path.display(),
          holder = %holder_id,
          "lock released"
        );
        self.emit("released", event);
      }
      LockEvent::QueueGranted { path, agent_id, .. } => {
        let _ = self.inner.manager.send_agent_message(
          GAL_HOLDER_ID,
          agent_id,
          &format!(
            "your queued lock on {} was granted; proceed, and release it when done",
            path.display()
          ),
        );
        self.emit("queue_granted", event);
      }
    }
  }

  /// Revoke one lock held by the last agent in the cycle and warn it.
  fn break_deadlock(&self, cycle: &[String]) {
    let Some(victim) = cycle.last() else {
      return;
    };
    let held = self.inner.locks.paths_held_by(victim);
    let Some(path) = held.first() else {
      warn!(event = "gal_deadlock_no_lock", victim = %victim, "deadlock victim holds nothing");
      return;
    };
    let outcome = self.inner.locks.revoke(path);
    warn!(
      event = "gal_deadlock_broken",
      victim = %victim,
      path = %path.display(),
      revoked = outcome.revoked,
      "deadlock broken by revoke"
    );
    let _ = self.inner.manager.send_agent_message(
      GAL_HOLDER_ID,
      victim,
      &format!(
        "deadlock detected ({}); your lock on {} was revoked to break it",
        cycle.join(" -> "),
        path.display()
      ),
    );
  }

  fn emit(&self, kind: &str, event: &LockEvent) {
    let payload = serde_json::to_value(event).unwrap_or(Value::Null);
    (self.inner.emitter)(kind, payload);
  }

  fn notify_gal(&self, kind: &str, detail: &str) {
    let Some(id) = self.inner.gal_session_id.lock().clone() else {
      return;
    };
    if let Some(session) = self.inner.manager.session(&id) {
      session.prompt_silent(&format!("[lock event] {kind}: {detail}"));
    }
  }

  fn gal_session_tools(&self) -> Vec<Tool> {
    let weak = Arc::downgrade(&self.inner);
    let mut tools = Vec::new();

    let w = weak.clone();
    tools.push(Tool::new(
      "spawn_worker",
      "Spawn a lock-aware worker for a task.",
      json!({
        "type": "object",
        "properties": {
          "name": {"type": "string"},
          "task": {"type": "string"},
          "taskId": {"type": "string"}
        },
        "required": ["task"]
      }),
      move |args: Value| {
        let w = w.clone();
        async move {
          let gal = upgrade(&w)?;
          let task = GalTask {
            id: args["taskId"]
              .as_str()
              .map(str::to_string)
              .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            text: args["task"].as_str().ok_or("missing `task`")?.to_string(),
          };
          let submitted = gal
            .submit_tasks(&[task], None, None, None)
            .await
            .map_err(|e| e.to_string())?;
          Ok(json!({ "workerId": submitted[0].subagent_id }))
        }
      },
    ));

    let w = weak.clone();
    tools.push(Tool::new(
      "message_worker",
      "Send a message to a worker by id or name.",
      json!({
        "type": "object",
        "properties": {"to": {"type": "string"}, "message": {"type": "string"}},
        "required": ["to", "message"]
      }),
      move |args: Value| {
        let w = w.clone();
        async move {
          let gal = upgrade(&w)?;
          let from = gal.gal_session_id().unwrap_or_else(|| GAL_HOLDER_ID.to_string());
          let to = args["to"].as_str().ok_or("missing `to`")?;
          let message = args["message"].as_str().ok_or("missing `message`")?;
          let ack = gal
            .inner
            .manager
            .send_agent_message(&from, to, message)
            .map_err(|e| e.to_string())?;
          Ok(json!({ "ok": true, "detail": ack }))
        }
      },
    ));

    let w = weak.clone();
    tools.push(Tool::new(
      "revoke_lock",
      "Forcefully revoke the lock on a path; the next waiter is granted.",
      json!({
        "type": "object",
        "properties": {"path": {"type": "string"}},
        "required": ["path"]
      }),
      move |args: Value| {
        let w = w.clone();
        async move {
          let gal = upgrade(&w)?;
          let path = args["path"].as_str().ok_or("missing `path`")?;
          let outcome = gal.inner.locks.revoke(Path::new(path));
          Ok(json!({ "revoked": outcome.revoked, "holderId": outcome.holder_id }))
        }
      },
    ));

    let w = weak.clone();
    tools.push(Tool::new(
      "list_lock_table",
      "Snapshot of all held locks.",
      json!({"type": "object", "properties": {}}),
      move |_args: Value| {
        let w = w.clone();
        async move {
          let gal = upgrade(&w)?;
          Ok(json!({ "locks": gal.get_locks() }))
        }
      },
    ));

    let w = weak.clone();
    tools.push(Tool::new(
      "list_workers",
      "Snapshot of all live workers and the locks they hold.",
      json!({"type": "object", "properties": {}}),
      move |_args: Value| {
        let w = w.clone();
        async move {
          let gal = upgrade(&w)?;
          Ok(json!({ "workers": gal.get_workers() }))
        }
      },
    ));

    let w = weak;
    tools.push(Tool::new(
      "escalate",
      "Escalate a situation you cannot resolve to the main agent.",
      json!({
        "type": "object",
        "properties": {"reason": {"type": "string"}},
        "required": ["reason"]
      }),
      move |args: Value| {
        let w = w.clone();
        async move {
          let gal = upgrade(&w)?;
          let reason = args["reason"].as_str().ok_or("missing `reason`")?;
          (gal.inner.emitter)("escalation", json!({ "reason": reason }));
          let from = gal.gal_session_id().unwrap_or_else(|| GAL_HOLDER_ID.to_string());
          gal
            .inner
            .manager
            .send_agent_message(&from, "main", &format!("escalation: {reason}"))
            .map_err(|e| e.to_string())?;
          Ok(json!({ "ok": true }))
        }
      },
    ));

    tools
  }
}

fn upgrade(weak: &Weak<GalInner>) -> Result<GalCoordinator, String> {
  weak
    .upgrade()
    .map(|inner| GalCoordinator { inner })
    .ok_or_else(|| "coordinator is gone".to_string())
}

fn worker_name(task_id: &str) -> String {
  let short: String = task_id.chars().take(8).collect();
  format!("worker-{short}")
}

/// The three lock tools bound to one worker. All of them are synchronous
/// table operations; no LLM roundtrip is involved.
fn lock_tools(locks: &FileLockTable, agent_id: &str, agent_name: &str) -> Vec<Tool> {
  let mut tools = Vec::with_capacity(3);

  let table = locks.clone();
  let id = agent_id.to_string();
  let name = agent_name.to_string();
  tools.push(Tool::new(
    "claim_file_lock",
    "Claim the exclusive lock on a file before editing it.",
    json!({
      "type": "object",
      "properties": {
        "path": {"type": "string"},
        "purpose": {"type": "string"}
      },
      "required": ["path"]
    }),
    move |args: Value| {
      let table = table.clone();
      let id = id.clone();
      let name = name.clone();
      async move {
        let path = args["path"].as_str().ok_or("missing `path`")?;
        let purpose = args["purpose"].as_str().map(str::to_string);
        match table.claim(&id, &name, Path::new(path), purpose) {
          ClaimOutcome::Granted { already_held } => {
            Ok(json!({ "granted": true, "alreadyHeld": already_held }))
          }
          ClaimOutcome::Denied {
            holder_id,
            holder_name,
            queue_position,
          } => Ok(json!({
            "granted": false,
            "holder": holder_id,
            "holderName": holder_name,
            "queuePosition": queue_position,
          })),
        }
      }
    },
  ));

  let table = locks.clone();
  let id = agent_id.to_string();
  tools.push(Tool::new(
    "release_file_lock",
    "Release a lock you hold; the next waiter is granted automatically.",
    json!({
      "type": "object",
      "properties": {"path": {"type": "string"}},
      "required": ["path"]
    }),
    move |args: Value| {
      let table = table.clone();
      let id = id.clone();
      async move {
        let path = args["path"].as_str().ok_or("missing `path`")?;
        let outcome = table.release(&id, Path::new(path));
        Ok(json!({ "released": outcome.released, "nextWaiter": outcome.next_waiter }))
      }
    },
  ));

  let table = locks.clone();
  tools.push(Tool::new(
    "check_file_available",
    "Check whether a file is free to claim, without queueing.",
    json!({
      "type": "object",
      "properties": {"path": {"type": "string"}},
      "required": ["path"]
    }),
    move |args: Value| {
      let table = table.clone();
      async move {
        let path = args["path"].as_str().ok_or("missing `path`")?;
        match table.check(Path::new(path)) {
          CheckOutcome::Available => Ok(json!({ "available": true })),
          CheckOutcome::Held {
            holder_id,
            holder_name,
            queue_length,
          } => Ok(json!({
            "available": false,
            "holder": holder_id,
            "holderName": holder_name,
            "queueLength": queue_length,
          })),
        }
      }
    },
  ));

  tools
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::{FakeProvider, MessageBus};
  use crate::locks::DEFAULT_LOCK_TIMEOUT;
  use std::sync::Mutex as StdMutex;
  use std::time::Duration;
  use test_support::wait_for;

  fn setup() -> (GalCoordinator, FileLockTable, SubagentManager, Arc<StdMutex<Vec<String>>>) {
    let locks = FileLockTable::new(DEFAULT_LOCK_TIMEOUT);
    let manager = SubagentManager::new(
      Arc::new(FakeProvider::new()),
      MessageBus::new(),
      8,
      Vec::new(),
      None,
      None,
    );
    let emitted = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&emitted);
    let emitter: GalEmitter = Arc::new(move |kind, _payload| {
      sink.lock().unwrap().push(kind.to_string());
    });
    let gal = GalCoordinator::new(locks.clone(), manager.clone(), emitter);
    (gal, locks, manager, emitted)
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn submit_registers_workers_and_marks_tasks() {
    let (gal, _locks, manager, _emitted) = setup();
    let submitted = gal
      .submit_tasks(
        &[GalTask {
          id: "task-1".into(),
          text: "rename the config".into(),
        }],
        Some("repo context"),
        None,
        None,
      )
      .await
      .unwrap();
    assert_eq!(submitted.len(), 1);
    assert!(gal.is_worker(&submitted[0].subagent_id));
    assert!(manager.knows_agent(&submitted[0].subagent_id));

    let workers = gal.get_workers();
    assert_eq!(workers[0].task_id, "task-1");
    // The worker prompt carries the lock preamble
    let history = manager.get_history(&submitted[0].subagent_id).unwrap();
    assert!(matches!(
      &history[0],
      crate::agent::HistoryEntry::User { text, .. }
        if text.contains("claim_file_lock") && text.contains("rename the config")
    ));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn worker_complete_releases_all_locks() {
    let (gal, locks, _manager, _emitted) = setup();
    let submitted = gal
      .submit_tasks(
        &[GalTask {
          id: "task-2".into(),
          text: "edit two files".into(),
        }],
        None,
        None,
        None,
      )
      .await
      .unwrap();
    let worker = &submitted[0].subagent_id;
    locks.claim(worker, "w", Path::new("/w/a.rs"), None);
    locks.claim(worker, "w", Path::new("/w/b.rs"), None);
    assert_eq!(locks.size(), 2);

    gal.on_worker_complete(worker);
    assert_eq!(locks.size(), 0);
    assert!(!gal.is_worker(worker));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn contention_emits_external_event_and_counts() {
    let (gal, locks, _manager, emitted) = setup();
    locks.claim("a1", "A1", Path::new("/c/file"), None);
    locks.claim("a2", "A2", Path::new("/c/file"), None);
    assert!(emitted.lock().unwrap().contains(&"contention".to_string()));
    assert_eq!(gal.get_status()["contentionCount"], json!(1));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn deadlock_is_auto_broken_and_victim_warned() {
    let (gal, locks, manager, emitted) = setup();
    // Two real workers so the warning lands on a live session
    let submitted = gal
      .submit_tasks(
        &[
          GalTask { id: "t-a".into(), text: "task a".into() },
          GalTask { id: "t-b".into(), text: "task b".into() },
        ],
        None,
        None,
        None,
      )
      .await
      .unwrap();
    let (a, b) = (
      submitted[0].subagent_id.clone(),
      submitted[1].subagent_id.clone(),
    );

    locks.claim(&a, "wa", Path::new("/d/f1"), None);
    locks.claim(&b, "wb", Path::new("/d/f2"), None);
    locks.claim(&a, "wa", Path::new("/d/f2"), None);
    locks.claim(&b, "wb", Path::new("/d/f1"), None);

    assert!(emitted.lock().unwrap().contains(&"deadlock".to_string()));
    // One lock of the cycle's last agent was revoked and handed over, so
    // the wait graph is broken: at least one agent now holds both claims
    // or the revoked path moved to its waiter.
    let f1_holder = match locks.check(Path::new("/d/f1")) {
      CheckOutcome::Held { holder_id, .. } => holder_id,
      CheckOutcome::Available => "none".into(),
    };
    let f2_holder = match locks.check(Path::new("/d/f2")) {
      CheckOutcome::Held { holder_id, .. } => holder_id,
      CheckOutcome::Available => "none".into(),
    };
    assert!(
      f1_holder == f2_holder,
      "expected the revoke to hand the contested lock over (f1: {f1_holder}, f2: {f2_holder})"
    );

    // The victim got a warning prompt routed through the bus
    let manager2 = manager.clone();
    let warned = wait_for(Duration::from_secs(2), || {
      let manager = manager2.clone();
      let a = a.clone();
      let b = b.clone();
      async move {
        [manager.get_history(&a), manager.get_history(&b)]
          .into_iter()
          .flatten()
          .flatten()
          .any(|e| matches!(
            e,
            crate::agent::HistoryEntry::User { text, .. } if text.contains("revoked")
          ))
      }
    })
    .await;
    assert!(warned, "victim was not warned about the revoke");
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn gal_session_is_notified_silently() {
    let (gal, locks, manager, _emitted) = setup();
    let gal_id = gal.ensure_gal_session();
    assert_eq!(gal.ensure_gal_session(), gal_id, "idempotent");

    locks.claim("a1", "A1", Path::new("/n/file"), None);
    locks.claim("a2", "A2", Path::new("/n/file"), None);

    let manager2 = manager.clone();
    let gal_id2 = gal_id.clone();
    let notified = wait_for(Duration::from_secs(2), || {
      let manager = manager2.clone();
      let gal_id = gal_id2.clone();
      async move {
        manager
          .get_history(&gal_id)
          .map(|h| {
            h.iter().any(|e| matches!(
              e,
              crate::agent::HistoryEntry::User { text, .. } if text.contains("contention")
            ))
          })
          .unwrap_or(false)
      }
    })
    .await;
    assert!(notified, "gal session saw no contention notification");
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn lock_tools_drive_the_table() {
    let (_gal, locks, _manager, _emitted) = setup();
    let tools = lock_tools(&locks, "w-1", "Worker1");
    let claim = tools.iter().find(|t| t.spec.name == "claim_file_lock").unwrap();
    let check = tools
      .iter()
      .find(|t| t.spec.name == "check_file_available")
      .unwrap();
    let release = tools
      .iter()
      .find(|t| t.spec.name == "release_file_lock")
      .unwrap();

    let granted = claim
      .invoke(json!({"path": "/t/x.rs", "purpose": "edit"}))
      .await
      .unwrap();
    assert_eq!(granted, json!({"granted": true, "alreadyHeld": false}));

    let held = check.invoke(json!({"path": "/t/x.rs"})).await.unwrap();
    assert_eq!(held["available"], json!(false));
    assert_eq!(held["holder"], json!("w-1"));

    let released = release.invoke(json!({"path": "/t/x.rs"})).await.unwrap();
    assert_eq!(released["released"], json!(true));
    assert_eq!(locks.size(), 0);
  }
}
