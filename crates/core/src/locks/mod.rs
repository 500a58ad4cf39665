//! Single authority on which agent may edit a given file path. Locks are
//! exclusive per normalized path, waiters queue FIFO, every grant carries
//! an independent timeout timer, and each claim runs one pass of deadlock
//! detection over the wait-for graph.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Reserved holder id for locks taken by the coordinator itself.
pub const GAL_HOLDER_ID: &str = "GAL";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Snapshot of one granted lock.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
  pub path: PathBuf,
  pub holder_id: String,
  pub holder_name: String,
  pub granted_at: DateTime<Utc>,
  pub timeout_secs: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub purpose: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockEvent {
  Contention {
    path: PathBuf,
    holder_id: String,
    holder_name: String,
    requester_id: String,
    requester_name: String,
    queue_length: usize,
  },
  Timeout {
    path: PathBuf,
    holder_id: String,
    holder_name: String,
  },
  Deadlock {
    /// Closed chain of agent ids, trimmed to start at the first repeated
    /// node. The chain is a cycle: the last element waits on the first.
    cycle: Vec<String>,
  },
  Released {
    path: PathBuf,
    holder_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_waiter: Option<String>,
  },
  QueueGranted {
    path: PathBuf,
    agent_id: String,
    agent_name: String,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
  Granted { already_held: bool },
  Denied {
    holder_id: String,
    holder_name: String,
    /// 1-based position in the wait queue.
    queue_position: usize,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOutcome {
  pub released: bool,
  pub next_waiter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
  Available,
  Held {
    holder_id: String,
    holder_name: String,
    queue_length: usize,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeOutcome {
  pub revoked: bool,
  pub holder_id: Option<String>,
}

type LockListener = Arc<dyn Fn(&LockEvent) + Send + Sync>;

struct Lock {
  holder_id: String,
  holder_name: String,
  granted_at: DateTime<Utc>,
  purpose: Option<String>,
  /// Bumped on every (re-)grant; a timer only fires if its epoch still
  /// matches, so a stale timer racing a refresh is a no-op.
  epoch: u64,
}

#[derive(Clone)]
struct Waiter {
  agent_id: String,
  agent_name: String,
  requested_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
  locks: HashMap<PathBuf, Lock>,
  wait_queues: HashMap<PathBuf, VecDeque<Waiter>>,
  agent_locks: HashMap<String, HashSet<PathBuf>>,
  timers: HashMap<PathBuf, JoinHandle<()>>,
  next_epoch: u64,
}

struct Inner {
  timeout: Duration,
  state: Mutex<State>,
  listener: Mutex<Option<LockListener>>,
}

#[derive(Clone)]
pub struct FileLockTable {
  inner: Arc<Inner>,
}

impl FileLockTable {
  pub fn new(timeout: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        timeout,
        state: Mutex::new(State::default()),
        listener: Mutex::new(None),
      }),
    }
  }

  /// Install the single event listener. Events are delivered synchronously
  /// after the table operation that produced them has committed, so the
  /// listener may call back into the table.
  pub fn set_listener(&self, listener: impl Fn(&LockEvent) + Send + Sync + 'static) {
    *self.inner.listener.lock() = Some(Arc::new(listener));
  }

  pub fn claim(
    &self,
    agent_id: &str,
    agent_name: &str,
    path: &Path,
    purpose: Option<String>,
  ) -> ClaimOutcome {
    let path = normalize_path(path);
    let mut events = Vec::new();
    let outcome = {
      let mut state = self.inner.state.lock();
      if let Some(lock) = state.locks.get(&path) {
        if lock.holder_id == agent_id {
          // Re-claim by the holder refreshes the grant and its timer.
          let epoch = state.next_epoch;
          state.next_epoch += 1;
          let lock = state.locks.get_mut(&path).expect("lock present");
          lock.granted_at = Utc::now();
          lock.epoch = epoch;
          if let Some(prev) = state.timers.remove(&path) {
            prev.abort();
          }
          let timer = self.spawn_timer(path.clone(), epoch);
          state.timers.insert(path.clone(), timer);
          ClaimOutcome::Granted { already_held: true }
        } else {
          let holder_id = lock.holder_id.clone();
          let holder_name = lock.holder_name.clone();
          let queue = state.wait_queues.entry(path.clone()).or_default();
          if !queue.iter().any(|w| w.agent_id == agent_id) {
            queue.push_back(Waiter {
              agent_id: agent_id.to_string(),
              agent_name: agent_name.to_string(),
              requested_at: Utc::now(),
            });
          }
          let queue_position = queue
            .iter()
            .position(|w| w.agent_id == agent_id)
            .expect("just enqueued")
            + 1;
          let queue_length = queue.len();
          events.push(LockEvent::Contention {
            path: path.clone(),
            holder_id: holder_id.clone(),
            holder_name: holder_name.clone(),
            requester_id: agent_id.to_string(),
            requester_name: agent_name.to_string(),
            queue_length,
          });
          if let Some(cycle) = detect_cycle(&state, agent_id) {
            warn!(event = "lock_deadlock", ?cycle, "deadlock detected");
            events.push(LockEvent::Deadlock { cycle });
          }
          ClaimOutcome::Denied {
            holder_id,
            holder_name,
            queue_position,
          }
        }
      } else {
        self.grant(&mut state, path.clone(), agent_id, agent_name, purpose);
        ClaimOutcome::Granted { already_held: false }
      }
    };
    self.emit_all(events);
    outcome
  }

  pub fn release(&self, agent_id: &str, path: &Path) -> ReleaseOutcome {
    let path = normalize_path(path);
    let mut events = Vec::new();
    let outcome = {
      let mut state = self.inner.state.lock();
      match state.locks.get(&path) {
        Some(lock) if lock.holder_id == agent_id => {
          self.remove_lock(&mut state, &path);
          let next_waiter = self.grant_next(&mut state, &path, &mut events);
          events.insert(
            0,
            LockEvent::Released {
              path: path.clone(),
              holder_id: agent_id.to_string(),
              next_waiter: next_waiter.clone(),
            },
          );
          ReleaseOutcome {
            released: true,
            next_waiter,
          }
        }
        // Releasing a lock one does not hold is a no-op.
        _ => ReleaseOutcome {
          released: false,
          next_waiter: None,
        },
      }
    };
    self.emit_all(events);
    outcome
  }

  pub fn check(&self, path: &Path) -> CheckOutcome {
    let path = normalize_path(path);
    let state = self.inner.state.lock();
    match state.locks.get(&path) {
      Some(lock) => CheckOutcome::Held {
        holder_id: lock.holder_id.clone(),
        holder_name: lock.holder_name.clone(),
        queue_length: state.wait_queues.get(&path).map_or(0, VecDeque::len),
      },
      None => CheckOutcome::Available,
    }
  }

  /// Drop the agent from every wait queue, then release each lock it
  /// holds, auto-granting to the next waiter. Returns the released paths.
  pub fn release_all_for_agent(&self, agent_id: &str) -> Vec<PathBuf> {
    let mut events = Vec::new();
    let released = {
      let mut state = self.inner.state.lock();
      state.wait_queues.retain(|_path, queue| {
        queue.retain(|w| w.agent_id != agent_id);
        !queue.is_empty()
      });
      let held: Vec<PathBuf> = state
        .agent_locks
        .get(agent_id)
        .map(|paths| paths.iter().cloned().collect())
        .unwrap_or_default();
      for path in &held {
        self.remove_lock(&mut state, path);
        let at = events.len();
        let next_waiter = self.grant_next(&mut state, path, &mut events);
        events.insert(
          at,
          LockEvent::Released {
            path: path.clone(),
            holder_id: agent_id.to_string(),
            next_waiter,
          },
        );
      }
      held
    };
    self.emit_all(events);
    released
  }

  /// Unconditionally remove the current lock and auto-grant to the next
  /// waiter. Used for timeout handling and deadlock breaking.
  pub fn revoke(&self, path: &Path) -> RevokeOutcome {
    let path = normalize_path(path);
    let mut events = Vec::new();
    let outcome = {
      let mut state = self.inner.state.lock();
      match state.locks.get(&path) {
        Some(lock) => {
          let holder_id = lock.holder_id.clone();
          self.remove_lock(&mut state, &path);
          self.grant_next(&mut state, &path, &mut events);
          RevokeOutcome {
            revoked: true,
            holder_id: Some(holder_id),
          }
        }
        None => RevokeOutcome {
          revoked: false,
          holder_id: None,
        },
      }
    };
    self.emit_all(events);
    outcome
  }

  pub fn size(&self) -> usize {
    self.inner.state.lock().locks.len()
  }

  pub fn locks_snapshot(&self) -> Vec<LockInfo> {
    let state = self.inner.state.lock();
    let mut infos: Vec<LockInfo> = state
      .locks
      .iter()
      .map(|(path, lock)| LockInfo {
        path: path.clone(),
        holder_id: lock.holder_id.clone(),
        holder_name: lock.holder_name.clone(),
        granted_at: lock.granted_at,
        timeout_secs: self.inner.timeout.as_secs(),
        purpose: lock.purpose.clone(),
      })
      .collect();
    infos.sort_by(|a, b| a.path.cmp(&b.path));
    infos
  }

  /// Paths currently held by an agent, per the reverse index.
  pub fn paths_held_by(&self, agent_id: &str) -> Vec<PathBuf> {
    let state = self.inner.state.lock();
    let mut paths: Vec<PathBuf> = state
      .agent_locks
      .get(agent_id)
      .map(|s| s.iter().cloned().collect())
      .unwrap_or_default();
    paths.sort();
    paths
  }

  /// Waiting agent ids for a path, in FIFO order.
  pub fn waiting_agents(&self, path: &Path) -> Vec<String> {
    let path = normalize_path(path);
    let state = self.inner.state.lock();
    state
      .wait_queues
      .get(&path)
      .map(|q| q.iter().map(|w| w.agent_id.clone()).collect())
      .unwrap_or_default()
  }

  /// Live timeout timers; equals the lock count at all times.
  pub fn timer_count(&self) -> usize {
    self.inner.state.lock().timers.len()
  }

  /// Abort all timers and drop all state.
  pub fn dispose(&self) {
    let mut state = self.inner.state.lock();
    for (_path, timer) in state.timers.drain() {
      timer.abort();
    }
    state.locks.clear();
    state.wait_queues.clear();
    state.agent_locks.clear();
  }

  fn grant(
    &self,
    state: &mut State,
    path: PathBuf,
    agent_id: &str,
    agent_name: &str,
    purpose: Option<String>,
  ) {
    let epoch = state.next_epoch;
    state.next_epoch += 1;
    state.locks.insert(
      path.clone(),
      Lock {
        holder_id: agent_id.to_string(),
        holder_name: agent_name.to_string(),
        granted_at: Utc::now(),
        purpose,
        epoch,
      },
    );
    state
      .agent_locks
      .entry(agent_id.to_string())
      .or_default()
      .insert(path.clone());
    let timer = self.spawn_timer(path.clone(), epoch);
    state.timers.insert(path, timer);
  }

  /// Remove a lock plus its timer and reverse-index entry. The caller
  /// decides which event to emit.
  fn remove_lock(&self, state: &mut State, path: &Path) {
    if let Some(lock) = state.locks.remove(path) {
      if let Some(paths) = state.agent_locks.get_mut(&lock.holder_id) {
        paths.remove(path);
        if paths.is_empty() {
          state.agent_locks.remove(&lock.holder_id);
        }
      }
    }
    if let Some(timer) = state.timers.remove(path) {
      timer.abort();
    }
  }

  fn grant_next(
    &self,
    state: &mut State,
    path: &Path,
    events: &mut Vec<LockEvent>,
  ) -> Option<String> {
    let waiter = {
      let queue = state.wait_queues.get_mut(path)?;
      let waiter = queue.pop_front()?;
      if queue.is_empty() {
        state.wait_queues.remove(path);
      }
      waiter
    };
    self.grant(state, path.to_path_buf(), &waiter.agent_id, &waiter.agent_name, None);
    events.push(LockEvent::QueueGranted {
      path: path.to_path_buf(),
      agent_id: waiter.agent_id.clone(),
      agent_name: waiter.agent_name,
    });
    Some(waiter.agent_id)
  }

  fn spawn_timer(&self, path: PathBuf, epoch: u64) -> JoinHandle<()> {
    let inner = Arc::clone(&self.inner);
    let timeout = self.inner.timeout;
    tokio::spawn(async move {
      tokio::time::sleep(timeout).await;
      FileLockTable { inner }.expire(&path, epoch);
    })
  }

  fn expire(&self, path: &Path, epoch: u64) {
    let mut events = Vec::new();
    {
      let mut state = self.inner.state.lock();
      let Some(lock) = state.locks.get(path) else {
        return;
      };
      if lock.epoch != epoch {
        // The lock was re-granted since this timer was armed.
        return;
      }
      debug!(event = "lock_timeout", path = %path.display(), holder = %lock.holder_id, "lock timed out");
      events.push(LockEvent::Timeout {
        path: path.to_path_buf(),
        holder_id: lock.holder_id.clone(),
        holder_name: lock.holder_name.clone(),
      });
      self.remove_lock(&mut state, path);
      self.grant_next(&mut state, path, &mut events);
    }
    self.emit_all(events);
  }

  fn emit_all(&self, events: Vec<LockEvent>) {
    if events.is_empty() {
      return;
    }
    // Clone the listener out of the guard: a listener reaction (e.g. a
    // deadlock-breaking revoke) may re-enter the table and emit again.
    let listener = self.inner.listener.lock().clone();
    if let Some(listener) = listener {
      for event in &events {
        listener(event);
      }
    }
  }
}

/// Walk `agent -> paths it waits for -> holder of each path` by DFS.
/// Returns the closed chain of agent ids if a cycle reaches back onto the
/// current stack, trimmed to start at the first repeated node.
fn detect_cycle(state: &State, start: &str) -> Option<Vec<String>> {
  fn waits_for<'a>(state: &'a State, agent: &str) -> Vec<&'a PathBuf> {
    state
      .wait_queues
      .iter()
      .filter(|(_p, q)| q.iter().any(|w| w.agent_id == agent))
      .map(|(p, _q)| p)
      .collect()
  }

  fn dfs(
    state: &State,
    agent: &str,
    stack: &mut Vec<String>,
    visited: &mut HashSet<String>,
  ) -> Option<Vec<String>> {
    stack.push(agent.to_string());
    for path in waits_for(state, agent) {
      if let Some(lock) = state.locks.get(path) {
        let holder = lock.holder_id.as_str();
        if let Some(pos) = stack.iter().position(|a| a == holder) {
          return Some(stack[pos..].to_vec());
        }
        if visited.insert(holder.to_string())
          && let Some(cycle) = dfs(state, holder, stack, visited)
        {
          return Some(cycle);
        }
      }
    }
    stack.pop();
    None
  }

  let mut visited = HashSet::new();
  visited.insert(start.to_string());
  dfs(state, start, &mut Vec::new(), &mut visited)
}

/// Absolutize and lexically resolve a path; symlinks are resolved when the
/// target already exists on disk.
pub fn normalize_path(path: &Path) -> PathBuf {
  let absolute = if path.is_absolute() {
    path.to_path_buf()
  } else {
    std::env::current_dir()
      .unwrap_or_else(|_| PathBuf::from("/"))
      .join(path)
  };
  match absolute.canonicalize() {
    Ok(resolved) => resolved,
    Err(_) => lexical_normalize(&absolute),
  }
}

fn lexical_normalize(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        out.pop();
      }
      other => out.push(other),
    }
  }
  out
}
