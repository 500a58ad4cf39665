//! Daemon process management for the CLI verbs: probing the socket,
//! waiting for state transitions, and launching the background process.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tau_core::config::TauPaths;
use tau_core::daemon::pidfile;

use crate::rpc::client;

/// Backoff bounds for [`await_daemon`]: start snappy, settle at a pace
/// that does not hammer a daemon mid-startup.
const BACKOFF_FLOOR: Duration = Duration::from_millis(25);
const BACKOFF_CEIL: Duration = Duration::from_millis(400);

/// Desired daemon state for [`await_daemon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
  Up,
  Down,
}

pub fn resolve_paths() -> Option<TauPaths> {
  TauPaths::resolve().ok()
}

pub fn resolve_socket() -> Option<PathBuf> {
  resolve_paths().map(|p| p.socket_path())
}

/// Is something answering `daemon.status` on the socket right now?
pub async fn probe(sock: &Path) -> bool {
  client::daemon_status(sock).await.is_ok()
}

/// Wait for the daemon to reach `target` within `budget`, backing off
/// between probes. Stale pid files (process gone) are unlinked as part
/// of each round, so a crashed daemon never blocks the next start.
pub async fn await_daemon(sock: &Path, paths: &TauPaths, target: Target, budget: Duration) -> bool {
  let pid_path = paths.pid_file_path();
  let deadline = tokio::time::Instant::now() + budget;
  let mut pause = BACKOFF_FLOOR;
  loop {
    pidfile::remove_stale(&pid_path);
    let up = probe(sock).await;
    let settled = match target {
      Target::Up => up,
      // Down means the socket stopped answering and no live pid remains
      Target::Down => !up && pidfile::read(&pid_path).is_none(),
    };
    if settled {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(pause).await;
    pause = (pause * 2).min(BACKOFF_CEIL);
  }
}

/// Launch `tau daemon run` detached. Stderr goes to `daemon.err` next to
/// the logs so a failed startup stays diagnosable; stdout and stdin are
/// closed. The child handle is returned so callers can `try_wait` and
/// fail fast when the process dies during its startup window.
pub fn spawn_daemon_background(
  sock: &Path,
  workspace: &Path,
  paths: &TauPaths,
) -> io::Result<std::process::Child> {
  let exe = std::env::current_exe()?;
  let daemon_dir = paths.daemon_dir();
  std::fs::create_dir_all(&daemon_dir)?;
  let stderr = std::fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(daemon_dir.join("daemon.err"))?;

  std::process::Command::new(exe)
    .args(["daemon", "run"])
    .arg("--socket-path")
    .arg(sock)
    .arg("--workspace")
    .arg(workspace)
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(stderr)
    .spawn()
}
