//! Daemon assembly: component construction, the serving lifecycle, and
//! graceful teardown.

mod api;
pub mod notify;
pub mod pidfile;
mod router;
mod server;

pub use notify::{ClientRegistry, ClientState, NotificationBus};
pub use router::Router;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::{AgentHost, FakeProvider, Provider};
use crate::config::{Config, ProviderKind, TauPaths, tasks_file_path};
use crate::ext::ExtensionHost;
use crate::heartbeat::Heartbeat;
use crate::journal::JournalWatcher;
use crate::locks::FileLockTable;
use crate::tasks::{TaskStore, TaskWatcher, TaskWatcherDeps};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct DaemonOptions {
  pub socket_path: PathBuf,
  pub workspace: PathBuf,
  pub paths: TauPaths,
  pub config: Config,
}

struct Watchers {
  tasks: TaskWatcher,
  journal: JournalWatcher,
}

pub struct DaemonState {
  pub version: &'static str,
  pub started_at: DateTime<Utc>,
  pub socket_path: PathBuf,
  pub workspace: PathBuf,
  pub paths: TauPaths,
  pub config: Config,
  pub registry: Arc<ClientRegistry>,
  pub notifier: NotificationBus,
  pub locks: FileLockTable,
  pub host: AgentHost,
  pub heartbeat: Heartbeat,
  pub extensions: ExtensionHost,
  pub tasks: Arc<TaskStore>,
  shutting_down: AtomicBool,
  shutdown_tx: watch::Sender<bool>,
  watchers: Mutex<Option<Watchers>>,
}

impl DaemonState {
  pub fn is_shutting_down(&self) -> bool {
    self.shutting_down.load(Ordering::SeqCst)
  }

  pub fn uptime_secs(&self) -> i64 {
    (Utc::now() - self.started_at).num_seconds()
  }

  pub fn watchers_active(&self) -> bool {
    self.watchers.lock().is_some()
  }

  /// Begin graceful teardown. Idempotent; the first caller wins.
  pub fn begin_shutdown(self: &Arc<Self>, reason: &str) {
    if self.shutting_down.swap(true, Ordering::SeqCst) {
      return;
    }
    info!(event = "daemon_shutdown", reason, "daemon shutting down");
    self
      .notifier
      .broadcast("daemon.shutdown", serde_json::json!({ "reason": reason }));

    let state = Arc::clone(self);
    tokio::spawn(async move {
      if let Some(watchers) = state.watchers.lock().take() {
        watchers.tasks.stop();
        watchers.journal.stop();
      }
      state.heartbeat.stop();
      state.extensions.shutdown_all().await;
      state.host.dispose();
      pidfile::remove(&state.paths.pid_file_path());
      // Last: stop the accept loop and drop client connections
      let _ = state.shutdown_tx.send(true);
    });
  }
}

pub struct DaemonHandle {
  state: Arc<DaemonState>,
  task: JoinHandle<()>,
}

impl DaemonHandle {
  pub fn socket_path(&self) -> &std::path::Path {
    &self.state.socket_path
  }

  pub fn state(&self) -> &Arc<DaemonState> {
    &self.state
  }

  pub fn stop(&self) {
    self.state.begin_shutdown("stop requested");
  }

  /// Wait until the server task has fully stopped.
  pub async fn wait(self) {
    let _ = self.task.await;
  }
}

fn make_provider(config: &Config) -> Arc<dyn Provider> {
  match config.provider {
    ProviderKind::Fake => Arc::new(FakeProvider::new()),
  }
}

/// Construct every component and start serving. The agent stack comes up
/// in the background; the ready gate covers the gap.
pub async fn start(options: DaemonOptions) -> io::Result<DaemonHandle> {
  let DaemonOptions {
    socket_path,
    workspace,
    paths,
    config,
  } = options;

  let pid_path = paths.pid_file_path();
  pidfile::remove_stale(&pid_path);
  if let Some(existing) = pidfile::read(&pid_path)
    && pidfile::is_alive(existing.pid)
  {
    return Err(io::Error::new(
      io::ErrorKind::AddrInUse,
      format!("daemon already running (pid {})", existing.pid),
    ));
  }
  pidfile::write(&pid_path, &socket_path, VERSION)?;

  let registry = Arc::new(ClientRegistry::new());
  let notifier = NotificationBus::new(Arc::clone(&registry));
  let locks = FileLockTable::new(std::time::Duration::from_secs(config.lock_timeout_secs));
  let tasks = Arc::new(TaskStore::new(tasks_file_path(&workspace)));
  let provider = make_provider(&config);
  let host = AgentHost::new(
    config.clone(),
    provider,
    notifier.clone(),
    locks.clone(),
    Arc::clone(&tasks),
  );
  let heartbeat = Heartbeat::new(
    paths.heartbeat_state_path(),
    paths.heartbeat_note_path(),
    config.heartbeat_interval_secs,
    host.clone(),
    notifier.clone(),
  );
  let extensions = ExtensionHost::new(paths.extensions_dir(), config.extensions.runtime.clone());

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let state = Arc::new(DaemonState {
    version: VERSION,
    started_at: Utc::now(),
    socket_path: socket_path.clone(),
    workspace: workspace.clone(),
    paths,
    config,
    registry,
    notifier: notifier.clone(),
    locks,
    host: host.clone(),
    heartbeat: heartbeat.clone(),
    extensions: extensions.clone(),
    tasks: Arc::clone(&tasks),
    shutting_down: AtomicBool::new(false),
    shutdown_tx,
    watchers: Mutex::new(None),
  });

  // Events flow into interested extension workers as well as clients.
  {
    let extensions = extensions.clone();
    notifier.add_tap(move |method, params| {
      let extensions = extensions.clone();
      let method = method.to_string();
      let params = params.clone();
      tokio::spawn(async move {
        extensions.dispatch_event(&method, params).await;
      });
    });
  }

  let router = Arc::new(Router::new());
  let task = server::start(Arc::clone(&state), router, shutdown_rx)?;

  heartbeat.start();
  extensions.start().await;

  // Agent setup and the watchers come up in the background; clients that
  // race startup block on the ready gate.
  {
    let state = Arc::clone(&state);
    tokio::spawn(async move {
      if let Err(e) = state.host.setup_agent(&state.workspace).await {
        warn!(event = "agent_setup_failed", error = %e, "agent setup failed at startup");
        return;
      }
      let tasks_watcher = TaskWatcher::start(TaskWatcherDeps {
        store: Arc::clone(&state.tasks),
        host: state.host.clone(),
      })
      .await;
      let journal_watcher =
        JournalWatcher::start(state.paths.journal_dir(), state.host.clone());
      *state.watchers.lock() = Some(Watchers {
        tasks: tasks_watcher,
        journal: journal_watcher,
      });
    });
  }

  // SIGTERM/SIGINT follow the same graceful path as `daemon.shutdown`.
  #[cfg(unix)]
  {
    let state = Arc::clone(&state);
    tokio::spawn(async move {
      use tokio::signal::unix::{SignalKind, signal};
      let (Ok(mut term), Ok(mut int)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
      ) else {
        warn!(event = "signal_install_failed", "could not install signal handlers");
        return;
      };
      tokio::select! {
        _ = term.recv() => state.begin_shutdown("SIGTERM"),
        _ = int.recv() => state.begin_shutdown("SIGINT"),
      }
    });
  }

  info!(
    event = "daemon_started",
    socket = %state.socket_path.display(),
    workspace = %state.workspace.display(),
    "daemon started"
  );
  Ok(DaemonHandle { state, task })
}
