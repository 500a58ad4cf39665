//! Two independent timers: a 5 s liveness ping broadcast to every client,
//! and a rescheduling one-shot tick that reads the heartbeat note and
//! silently prompts the main agent when it has actionable content.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentHost;
use crate::daemon::notify::NotificationBus;
use crate::texts;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_TICK_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatState {
  pub enabled: bool,
  pub interval_secs: u64,
  #[serde(default)]
  pub last_check: Option<DateTime<Utc>>,
  #[serde(default)]
  pub next_check: Option<DateTime<Utc>>,
  #[serde(default)]
  pub check_count: u64,
}

struct HeartbeatInner {
  state_path: PathBuf,
  note_path: PathBuf,
  host: AgentHost,
  notifier: NotificationBus,
  state: Mutex<HeartbeatState>,
  /// Bumped to invalidate the outstanding one-shot tick.
  tick_generation: AtomicU64,
  stop: CancellationToken,
  started_at: Instant,
}

#[derive(Clone)]
pub struct Heartbeat {
  inner: Arc<HeartbeatInner>,
}

impl Heartbeat {
  /// Load persisted state (or defaults with the configured interval).
  pub fn new(
    state_path: PathBuf,
    note_path: PathBuf,
    default_interval_secs: u64,
    host: AgentHost,
    notifier: NotificationBus,
  ) -> Self {
    let state = load_state(&state_path).unwrap_or(HeartbeatState {
      enabled: true,
      interval_secs: default_interval_secs.max(MIN_TICK_INTERVAL_SECS),
      last_check: None,
      next_check: None,
      check_count: 0,
    });
    Self {
      inner: Arc::new(HeartbeatInner {
        state_path,
        note_path,
        host,
        notifier,
        state: Mutex::new(state),
        tick_generation: AtomicU64::new(0),
        stop: CancellationToken::new(),
        started_at: Instant::now(),
      }),
    }
  }

  pub fn start(&self) {
    self.spawn_liveness();
    if self.inner.state.lock().enabled {
      self.schedule_tick();
    }
  }

  pub fn stop(&self) {
    self.inner.stop.cancel();
    self.inner.tick_generation.fetch_add(1, Ordering::SeqCst);
  }

  pub fn status(&self) -> HeartbeatState {
    self.inner.state.lock().clone()
  }

  /// Disabling cancels the pending tick but preserves all state.
  pub fn set_enabled(&self, enabled: bool) -> HeartbeatState {
    {
      let mut state = self.inner.state.lock();
      state.enabled = enabled;
      if !enabled {
        state.next_check = None;
      }
    }
    self.inner.tick_generation.fetch_add(1, Ordering::SeqCst);
    if enabled {
      self.schedule_tick();
    }
    self.persist();
    info!(event = "heartbeat_enabled_changed", enabled, "heartbeat toggled");
    self.status()
  }

  /// Clamped to the minimum interval; cancels and re-schedules.
  pub fn set_interval(&self, interval_secs: u64) -> HeartbeatState {
    let effective = interval_secs.max(MIN_TICK_INTERVAL_SECS);
    let enabled = {
      let mut state = self.inner.state.lock();
      state.interval_secs = effective;
      state.enabled
    };
    self.inner.tick_generation.fetch_add(1, Ordering::SeqCst);
    if enabled {
      self.schedule_tick();
    }
    self.persist();
    info!(event = "heartbeat_interval_changed", interval_secs = effective, "heartbeat interval set");
    self.status()
  }

  fn spawn_liveness(&self) {
    let inner = Arc::clone(&self.inner);
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = inner.stop.cancelled() => break,
          _ = tokio::time::sleep(LIVENESS_INTERVAL) => {}
        }
        let (streaming, subagents) = match inner.host.manager() {
          Ok(manager) => (manager.any_streaming(), manager.subagent_count()),
          Err(_) => (false, 0),
        };
        let cwd = inner
          .host
          .workspace()
          .map(|p| p.display().to_string())
          .unwrap_or_default();
        inner.notifier.broadcast(
          "daemon.heartbeat",
          json!({
            "pid": std::process::id(),
            "uptimeSecs": inner.started_at.elapsed().as_secs(),
            "cwd": cwd,
            "streaming": streaming,
            "subagents": subagents,
            "clients": inner.notifier.registry().count(),
            "memoryMb": resident_memory_mb(),
            "seq": inner.notifier.current_seq(),
          }),
        );
      }
      debug!(event = "heartbeat_liveness_stopped", "liveness loop stopped");
    });
  }

  fn schedule_tick(&self) {
    let generation = self.inner.tick_generation.load(Ordering::SeqCst);
    let interval = {
      let mut state = self.inner.state.lock();
      let interval = Duration::from_secs(state.interval_secs);
      state.next_check =
        Some(Utc::now() + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero()));
      interval
    };
    self.persist();

    let inner = Arc::clone(&self.inner);
    let heartbeat = self.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = inner.stop.cancelled() => return,
        _ = tokio::time::sleep(interval) => {}
      }
      if inner.tick_generation.load(Ordering::SeqCst) != generation {
        // Re-scheduled or disabled while sleeping
        return;
      }
      heartbeat.run_tick();
      heartbeat.schedule_tick();
    });
  }

  fn run_tick(&self) {
    {
      let mut state = self.inner.state.lock();
      state.last_check = Some(Utc::now());
      state.check_count += 1;
    }
    self.persist();

    let note = std::fs::read_to_string(&self.inner.note_path).unwrap_or_default();
    if !has_actionable_content(&note) {
      debug!(event = "heartbeat_tick_empty", "heartbeat note has no actionable content");
      return;
    }
    debug!(event = "heartbeat_tick", "heartbeat tick prompting main agent");
    if self
      .inner
      .host
      .prompt_main_silent(&texts::heartbeat_prompt(&note))
      .is_err()
    {
      debug!(event = "heartbeat_agent_unavailable", "main agent unavailable on tick");
    }
  }

  fn persist(&self) {
    let state = self.inner.state.lock().clone();
    if let Some(parent) = self.inner.state_path.parent() {
      let _ = std::fs::create_dir_all(parent);
    }
    let tmp = self.inner.state_path.with_extension("json.tmp");
    let payload = match serde_json::to_vec_pretty(&state) {
      Ok(p) => p,
      Err(e) => {
        warn!(event = "heartbeat_persist_failed", error = %e, "could not serialize state");
        return;
      }
    };
    if std::fs::write(&tmp, payload)
      .and_then(|()| std::fs::rename(&tmp, &self.inner.state_path))
      .is_err()
    {
      warn!(event = "heartbeat_persist_failed", "could not write heartbeat state");
    }
  }
}

fn load_state(path: &std::path::Path) -> Option<HeartbeatState> {
  let s = std::fs::read_to_string(path).ok()?;
  serde_json::from_str(&s).ok()
}

/// Anything beyond headings, separators, and blank lines counts.
fn has_actionable_content(note: &str) -> bool {
  note.lines().any(|line| {
    let t = line.trim();
    !t.is_empty() && !t.starts_with('#') && t.chars().any(|c| c != '-' && c != '=' && c != '*')
  })
}

#[cfg(target_os = "linux")]
fn resident_memory_mb() -> u64 {
  let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
    return 0;
  };
  status
    .lines()
    .find(|l| l.starts_with("VmRSS:"))
    .and_then(|l| l.split_whitespace().nth(1))
    .and_then(|kb| kb.parse::<u64>().ok())
    .map(|kb| kb / 1024)
    .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_mb() -> u64 {
  0
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::{FakeProvider, HistoryEntry};
  use crate::config::Config;
  use crate::daemon::notify::ClientRegistry;
  use crate::locks::{DEFAULT_LOCK_TIMEOUT, FileLockTable};
  use crate::tasks::TaskStore;
  use test_support::wait_for;

  async fn ready_host(td: &tempfile::TempDir) -> (AgentHost, NotificationBus) {
    let notifier = NotificationBus::new(Arc::new(ClientRegistry::new()));
    let host = AgentHost::new(
      Config::default(),
      Arc::new(FakeProvider::new()),
      notifier.clone(),
      FileLockTable::new(DEFAULT_LOCK_TIMEOUT),
      Arc::new(TaskStore::new(td.path().join("tasks.md"))),
    );
    host.setup_agent(td.path()).await.unwrap();
    (host, notifier)
  }

  fn heartbeat_in(td: &tempfile::TempDir, host: AgentHost, notifier: NotificationBus) -> Heartbeat {
    Heartbeat::new(
      td.path().join("daemon").join("heartbeat.json"),
      td.path().join("heartbeat.md"),
      120,
      host,
      notifier,
    )
  }

  #[test]
  fn actionable_content_ignores_headings_and_rules() {
    assert!(!has_actionable_content("# Heading\n\n---\n"));
    assert!(!has_actionable_content(""));
    assert!(has_actionable_content("# Heading\n\ncheck the deploy\n"));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn state_persists_across_instances() {
    let td = tempfile::tempdir().unwrap();
    let (host, notifier) = ready_host(&td).await;
    let hb = heartbeat_in(&td, host.clone(), notifier.clone());
    hb.set_interval(30); // clamped to 60
    let state = hb.set_enabled(false);
    assert_eq!(state.interval_secs, 60);
    assert!(!state.enabled);

    let hb2 = heartbeat_in(&td, host, notifier);
    let state2 = hb2.status();
    assert_eq!(state2.interval_secs, 60);
    assert!(!state2.enabled);
  }

  #[tokio::test(start_paused = true)]
  async fn tick_prompts_when_note_has_content() {
    let td = tempfile::tempdir().unwrap();
    let notifier = NotificationBus::new(Arc::new(ClientRegistry::new()));
    let host = AgentHost::new(
      Config::default(),
      Arc::new(FakeProvider::new()),
      notifier.clone(),
      FileLockTable::new(DEFAULT_LOCK_TIMEOUT),
      Arc::new(TaskStore::new(td.path().join("tasks.md"))),
    );
    host.setup_agent(td.path()).await.unwrap();
    std::fs::write(td.path().join("heartbeat.md"), "# Plan\n\nwater the plants\n").unwrap();

    let hb = heartbeat_in(&td, host.clone(), notifier);
    hb.start();

    // Advance past one tick interval (120s)
    tokio::time::sleep(Duration::from_secs(130)).await;

    let session = host.main_session().unwrap();
    let prompted = session.history().iter().any(|e| matches!(
      e,
      HistoryEntry::User { text, .. } if text.contains("water the plants")
    ));
    assert!(prompted, "tick did not prompt the main agent");
    assert!(hb.status().check_count >= 1);
    assert!(hb.status().last_check.is_some());
    hb.stop();
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn liveness_broadcast_carries_seq_and_metrics() {
    let td = tempfile::tempdir().unwrap();
    let registry = Arc::new(ClientRegistry::new());
    let notifier = NotificationBus::new(Arc::clone(&registry));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    registry.add(tx);

    let host = AgentHost::new(
      Config::default(),
      Arc::new(FakeProvider::new()),
      notifier.clone(),
      FileLockTable::new(DEFAULT_LOCK_TIMEOUT),
      Arc::new(TaskStore::new(td.path().join("tasks.md"))),
    );
    host.setup_agent(td.path()).await.unwrap();

    let hb = heartbeat_in(&td, host, notifier);
    hb.start();

    let got = wait_for(Duration::from_secs(8), || {
      let frame = rx.try_recv().ok();
      async move {
        frame
          .and_then(|f| serde_json::from_str::<serde_json::Value>(&f).ok())
          .map(|v| v["method"] == "daemon.heartbeat" && v["params"]["pid"].is_number())
          .unwrap_or(false)
      }
    })
    .await;
    assert!(got, "no heartbeat notification observed");
    hb.stop();
  }
}
