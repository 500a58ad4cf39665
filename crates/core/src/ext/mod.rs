//! Extension host: loads `.js` modules from the extensions directory and
//! runs each in an isolated worker process. Workers crash without taking
//! the daemon down; a crashed extension is marked `errored` and its
//! pending calls reject.

mod abi;
mod worker;

pub use abi::{ExtToolSpec, HostMessage, WorkerMessage};
pub use worker::{ExtensionWorker, TOOL_CALL_TIMEOUT, WorkerUpdate};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::watch;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionStatus {
  Running,
  Errored,
  Stopped,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRecord {
  pub id: String,
  pub source: PathBuf,
  pub status: ExtensionStatus,
  pub tools: Vec<ExtToolSpec>,
  pub events: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

/// A memory request surfaced by a worker; the daemon forwards it to
/// whatever memory store is wired in (by default it is only logged).
#[derive(Debug, Clone)]
pub struct MemoryRequest {
  pub extension_id: String,
  pub memory_type: String,
  pub title: String,
  pub content: String,
  pub tags: Vec<String>,
}

type MemorySink = Arc<dyn Fn(MemoryRequest) + Send + Sync>;

struct Entry {
  source: PathBuf,
  status: ExtensionStatus,
  registered: bool,
  tools: Vec<ExtToolSpec>,
  events: Vec<String>,
  last_error: Option<String>,
  worker: Option<ExtensionWorker>,
  generation: u64,
}

struct ExtHostInner {
  dir: PathBuf,
  runtime: Vec<String>,
  register_timeout: Duration,
  entries: Mutex<HashMap<String, Entry>>,
  memory_sink: Mutex<Option<MemorySink>>,
  generation: AtomicU64,
  stop: CancellationToken,
}

#[derive(Clone)]
pub struct ExtensionHost {
  inner: Arc<ExtHostInner>,
}

impl ExtensionHost {
  pub fn new(dir: impl Into<PathBuf>, runtime: Vec<String>) -> Self {
    Self {
      inner: Arc::new(ExtHostInner {
        dir: dir.into(),
        runtime,
        register_timeout: REGISTER_TIMEOUT,
        entries: Mutex::new(HashMap::new()),
        memory_sink: Mutex::new(None),
        generation: AtomicU64::new(0),
        stop: CancellationToken::new(),
      }),
    }
  }

  /// Shrink the register window (test installs use it to fail fast).
  pub fn with_register_timeout(self, timeout: Duration) -> Self {
    let inner = ExtHostInner {
      dir: self.inner.dir.clone(),
      runtime: self.inner.runtime.clone(),
      register_timeout: timeout,
      entries: Mutex::new(HashMap::new()),
      memory_sink: Mutex::new(None),
      generation: AtomicU64::new(0),
      stop: CancellationToken::new(),
    };
    Self { inner: Arc::new(inner) }
  }

  pub fn set_memory_sink(&self, sink: impl Fn(MemoryRequest) + Send + Sync + 'static) {
    *self.inner.memory_sink.lock() = Some(Arc::new(sink));
  }

  /// Scan the directory, load every `.js` extension, and start the hot
  /// reload watcher.
  pub async fn start(&self) {
    if let Err(e) = std::fs::create_dir_all(&self.inner.dir) {
      warn!(event = "ext_dir_failed", error = %e, "could not create extensions dir");
      return;
    }
    let sources = list_sources(&self.inner.dir);
    for source in sources {
      self.load_extension(&source).await;
    }
    self.spawn_reload_watcher();
  }

  pub fn list(&self) -> Vec<ExtensionRecord> {
    let entries = self.inner.entries.lock();
    let mut records: Vec<ExtensionRecord> = entries
      .iter()
      .map(|(id, e)| ExtensionRecord {
        id: id.clone(),
        source: e.source.clone(),
        status: e.status,
        tools: e.tools.clone(),
        events: e.events.clone(),
        last_error: e.last_error.clone(),
      })
      .collect();
    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
  }

  /// Route a tool call to the extension providing it. "No extension
  /// provides tool X" is a recoverable application error, not a protocol
  /// error.
  pub async fn call_tool(&self, tool: &str, params: Value) -> Result<Value, String> {
    let worker = {
      let entries = self.inner.entries.lock();
      entries
        .values()
        .find(|e| {
          e.status == ExtensionStatus::Running
            && e.registered
            && e.tools.iter().any(|t| t.name == tool)
        })
        .and_then(|e| e.worker.clone())
    };
    let Some(worker) = worker else {
      return Err(format!("No extension provides tool {tool}"));
    };
    worker.call_tool(tool, params).await
  }

  /// Forward an event to every worker registered for it.
  pub async fn dispatch_event(&self, name: &str, data: Value) {
    let workers: Vec<ExtensionWorker> = {
      let entries = self.inner.entries.lock();
      entries
        .values()
        .filter(|e| {
          e.status == ExtensionStatus::Running && e.events.iter().any(|ev| ev == name)
        })
        .filter_map(|e| e.worker.clone())
        .collect()
    };
    for worker in workers {
      worker.send_event(name, data.clone()).await;
    }
  }

  /// Reload one extension after a source change: graceful stop of the old
  /// worker, fresh spawn, fresh register window.
  pub async fn reload(&self, source: &Path) {
    let id = extension_id(source);
    let old_worker = {
      let mut entries = self.inner.entries.lock();
      entries.remove(&id).and_then(|e| e.worker)
    };
    if let Some(worker) = old_worker {
      worker.shutdown().await;
    }
    if source.exists() {
      self.load_extension(source).await;
    } else {
      info!(event = "ext_removed", extension = %id, "extension source removed");
    }
  }

  pub async fn shutdown_all(&self) {
    self.inner.stop.cancel();
    let workers: Vec<(String, Option<ExtensionWorker>)> = {
      let mut entries = self.inner.entries.lock();
      entries
        .iter_mut()
        .map(|(id, e)| {
          e.status = ExtensionStatus::Stopped;
          (id.clone(), e.worker.take())
        })
        .collect()
    };
    for (id, worker) in workers {
      if let Some(worker) = worker {
        worker.shutdown().await;
      }
      debug!(event = "ext_stopped", extension = %id, "extension stopped");
    }
  }

  async fn load_extension(&self, source: &Path) {
    let id = extension_id(source);
    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

    let (worker, updates) =
      match ExtensionWorker::spawn(&self.inner.runtime, source, &id).await {
        Ok(pair) => pair,
        Err(e) => {
          warn!(event = "ext_spawn_failed", extension = %id, error = %e, "worker spawn failed");
          self.inner.entries.lock().insert(
            id.clone(),
            Entry {
              source: source.to_path_buf(),
              status: ExtensionStatus::Errored,
              registered: false,
              tools: Vec::new(),
              events: Vec::new(),
              last_error: Some(e.to_string()),
              worker: None,
              generation,
            },
          );
          return;
        }
      };

    self.inner.entries.lock().insert(
      id.clone(),
      Entry {
        source: source.to_path_buf(),
        status: ExtensionStatus::Running,
        registered: false,
        tools: Vec::new(),
        events: Vec::new(),
        last_error: None,
        worker: Some(worker.clone()),
        generation,
      },
    );
    info!(event = "ext_loaded", extension = %id, source = %source.display(), "extension loaded");

    self.consume_updates(id.clone(), generation, updates);
    self.enforce_register_window(id, generation, worker);
  }

  fn consume_updates(
    &self,
    id: String,
    generation: u64,
    mut updates: tokio::sync::mpsc::UnboundedReceiver<WorkerUpdate>,
  ) {
    let host = self.clone();
    tokio::spawn(async move {
      while let Some(update) = updates.recv().await {
        match update {
          WorkerUpdate::Registered { tools, events } => {
            let mut entries = host.inner.entries.lock();
            if let Some(entry) = entries.get_mut(&id).filter(|e| e.generation == generation) {
              info!(
                event = "ext_registered",
                extension = %id,
                tools = tools.len(),
                events = events.len(),
                "extension registered"
              );
              entry.registered = true;
              entry.tools = tools;
              entry.events = events;
            }
          }
          WorkerUpdate::Memory {
            memory_type,
            title,
            content,
            tags,
          } => {
            let request = MemoryRequest {
              extension_id: id.clone(),
              memory_type,
              title,
              content,
              tags,
            };
            let sink = host.inner.memory_sink.lock().clone();
            match sink {
              Some(sink) => sink(request),
              None => {
                info!(
                  event = "ext_memory",
                  extension = %request.extension_id,
                  memory_type = %request.memory_type,
                  title = %request.title,
                  "extension memory (no sink wired)"
                );
              }
            }
          }
          WorkerUpdate::Exited { message } => {
            let mut entries = host.inner.entries.lock();
            if let Some(entry) = entries.get_mut(&id).filter(|e| e.generation == generation)
              && entry.status != ExtensionStatus::Stopped
            {
              warn!(event = "ext_errored", extension = %id, error = %message, "extension exited");
              entry.status = ExtensionStatus::Errored;
              entry.last_error = Some(message);
              entry.worker = None;
            }
          }
        }
      }
    });
  }

  fn enforce_register_window(&self, id: String, generation: u64, worker: ExtensionWorker) {
    let host = self.clone();
    tokio::spawn(async move {
      tokio::time::sleep(host.inner.register_timeout).await;
      let timed_out = {
        let mut entries = host.inner.entries.lock();
        match entries.get_mut(&id).filter(|e| e.generation == generation) {
          Some(entry) if !entry.registered && entry.status == ExtensionStatus::Running => {
            entry.status = ExtensionStatus::Errored;
            entry.last_error = Some("did not register in time".to_string());
            entry.worker = None;
            true
          }
          _ => false,
        }
      };
      if timed_out {
        warn!(event = "ext_register_timeout", extension = %id, "extension never registered");
        worker.shutdown().await;
      }
    });
  }

  fn spawn_reload_watcher(&self) {
    let host = self.clone();
    tokio::spawn(async move {
      let Ok((_watcher, mut rx)) = watch::watch_dir(&host.inner.dir) else {
        warn!(event = "ext_watch_failed", dir = %host.inner.dir.display(), "could not watch extensions dir");
        return;
      };
      loop {
        let batch = tokio::select! {
          _ = host.inner.stop.cancelled() => break,
          batch = watch::next_batch(&mut rx, RELOAD_DEBOUNCE) => batch,
        };
        let Some(batch) = batch else { break };
        let mut touched: Vec<PathBuf> = batch
          .iter()
          .flat_map(|e| e.paths.iter().cloned())
          .filter(|p| p.extension().is_some_and(|ext| ext == "js"))
          .collect();
        touched.sort();
        touched.dedup();
        for source in touched {
          info!(event = "ext_reload", source = %source.display(), "extension source changed");
          host.reload(&source).await;
        }
      }
    });
  }
}

fn extension_id(source: &Path) -> String {
  source
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_else(|| "unknown".to_string())
}

fn list_sources(dir: &Path) -> Vec<PathBuf> {
  let Ok(entries) = std::fs::read_dir(dir) else {
    return Vec::new();
  };
  let mut sources: Vec<PathBuf> = entries
    .flatten()
    .map(|e| e.path())
    .filter(|p| p.extension().is_some_and(|ext| ext == "js"))
    .collect();
  sources.sort();
  sources
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use test_support::wait_for;

  /// Shell-scripted stand-in for a JS worker: registers one tool and
  /// answers tool calls. The ABI only cares about the message framing.
  const GREETER: &str = r#"
printf '%s\n' '{"type":"register","tools":[{"name":"greet","description":"say hi","parameters":{"type":"object"}}],"events":["daemon.heartbeat"]}'
while IFS= read -r line; do
  case "$line" in
    *tool_call*)
      id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
      printf '%s\n' "{\"type\":\"tool_result\",\"id\":\"$id\",\"result\":{\"greeting\":\"hi\"}}"
      ;;
    *shutdown*) exit 0 ;;
  esac
done
"#;

  const CRASHER: &str = r#"
printf '%s\n' '{"type":"register","tools":[{"name":"boom","description":"exits","parameters":{}}],"events":[]}'
IFS= read -r line
exit 3
"#;

  const MUTE: &str = "sleep 60\n";

  fn host_in(td: &tempfile::TempDir) -> ExtensionHost {
    ExtensionHost::new(td.path(), vec!["sh".to_string()])
  }

  fn write_ext(td: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
    let path = td.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
  }

  async fn wait_registered(host: &ExtensionHost, id: &str) -> bool {
    let host = host.clone();
    let id = id.to_string();
    wait_for(Duration::from_secs(5), || {
      let host = host.clone();
      let id = id.clone();
      async move {
        host
          .list()
          .iter()
          .any(|r| r.id == id && !r.tools.is_empty())
      }
    })
    .await
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn loads_registers_and_calls_tools() {
    let td = tempfile::tempdir().unwrap();
    write_ext(&td, "greeter.js", GREETER);
    let host = host_in(&td);
    host.start().await;

    assert!(wait_registered(&host, "greeter").await, "never registered");
    let records = host.list();
    assert_eq!(records[0].status, ExtensionStatus::Running);
    assert_eq!(records[0].events, vec!["daemon.heartbeat"]);

    let result = host.call_tool("greet", json!({})).await.unwrap();
    assert_eq!(result, json!({"greeting": "hi"}));

    let err = host.call_tool("absent", json!({})).await.unwrap_err();
    assert_eq!(err, "No extension provides tool absent");
    host.shutdown_all().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn crash_rejects_pending_and_marks_errored() {
    let td = tempfile::tempdir().unwrap();
    write_ext(&td, "crasher.js", CRASHER);
    let host = host_in(&td);
    host.start().await;
    assert!(wait_registered(&host, "crasher").await);

    // The worker reads one line then exits: the call must reject, not hang
    let err = host.call_tool("boom", json!({})).await.unwrap_err();
    assert!(err.contains("exited"), "got: {err}");

    let host2 = host.clone();
    let errored = wait_for(Duration::from_secs(3), || {
      let host = host2.clone();
      async move {
        host
          .list()
          .iter()
          .any(|r| r.id == "crasher" && r.status == ExtensionStatus::Errored)
      }
    })
    .await;
    assert!(errored, "crash did not mark the extension errored");
    host.shutdown_all().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn silent_worker_errors_after_register_window() {
    let td = tempfile::tempdir().unwrap();
    write_ext(&td, "mute.js", MUTE);
    let host =
      ExtensionHost::new(td.path(), vec!["sh".to_string()]).with_register_timeout(Duration::from_millis(300));
    host.start().await;

    let host2 = host.clone();
    let errored = wait_for(Duration::from_secs(3), || {
      let host = host2.clone();
      async move {
        host.list().iter().any(|r| {
          r.id == "mute"
            && r.status == ExtensionStatus::Errored
            && r.last_error.as_deref() == Some("did not register in time")
        })
      }
    })
    .await;
    assert!(errored, "mute worker was not errored");
    host.shutdown_all().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn hot_reload_replaces_registration() {
    let td = tempfile::tempdir().unwrap();
    let source = write_ext(&td, "swap.js", GREETER);
    let host = host_in(&td);
    host.start().await;
    assert!(wait_registered(&host, "swap").await);

    // Replace the tool set on disk; the reload watcher should pick it up
    let replacement = GREETER.replace("greet", "salute");
    std::fs::write(&source, replacement).unwrap();

    let host2 = host.clone();
    let swapped = wait_for(Duration::from_secs(5), || {
      let host = host2.clone();
      async move {
        host
          .list()
          .iter()
          .any(|r| r.id == "swap" && r.tools.iter().any(|t| t.name == "salute"))
      }
    })
    .await;
    assert!(swapped, "reload did not refresh the tool registration");
    host.shutdown_all().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn events_reach_registered_workers_only() {
    let td = tempfile::tempdir().unwrap();
    write_ext(&td, "greeter.js", GREETER);
    let host = host_in(&td);
    host.start().await;
    assert!(wait_registered(&host, "greeter").await);
    // No panic / no hang when dispatching to an event nobody registered
    host.dispatch_event("daemon.tasks.changed", json!({})).await;
    host.dispatch_event("daemon.heartbeat", json!({"seq": 1})).await;
    host.shutdown_all().await;
  }
}
