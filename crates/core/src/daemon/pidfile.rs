use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Contents of `tau-daemon.pid`. Clients check liveness before connecting
/// and unlink a stale file themselves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PidFile {
  pub pid: u32,
  pub socket_path: String,
  pub started_at: DateTime<Utc>,
  pub version: String,
}

pub fn write(path: &Path, socket_path: &Path, version: &str) -> io::Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)?;
  }
  let record = PidFile {
    pid: std::process::id(),
    socket_path: socket_path.display().to_string(),
    started_at: Utc::now(),
    version: version.to_string(),
  };
  fs::write(path, serde_json::to_vec_pretty(&record)?)?;
  info!(event = "pidfile_written", path = %path.display(), pid = record.pid, "pid file written");
  Ok(())
}

pub fn read(path: &Path) -> Option<PidFile> {
  let s = fs::read_to_string(path).ok()?;
  serde_json::from_str(&s).ok()
}

pub fn remove(path: &Path) {
  let _ = fs::remove_file(path);
}

/// OS-level existence signal for a pid (`kill -0`).
pub fn is_alive(pid: u32) -> bool {
  std::process::Command::new("kill")
    .arg("-0")
    .arg(pid.to_string())
    .status()
    .map(|s| s.success())
    .unwrap_or(false)
}

/// Unlink the pid file when its process is gone. Returns whether a stale
/// file was removed.
pub fn remove_stale(path: &Path) -> bool {
  let Some(record) = read(path) else {
    return false;
  };
  if is_alive(record.pid) {
    return false;
  }
  debug!(event = "pidfile_stale", path = %path.display(), pid = record.pid, "removing stale pid file");
  remove(path);
  true
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn write_read_round_trip() {
    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("daemon").join("tau-daemon.pid");
    write(&path, Path::new("/tmp/tau.sock"), "1.2.3").unwrap();
    let record = read(&path).unwrap();
    assert_eq!(record.pid, std::process::id());
    assert_eq!(record.socket_path, "/tmp/tau.sock");
    assert_eq!(record.version, "1.2.3");
  }

  #[test]
  fn own_pid_is_alive_and_file_kept() {
    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("tau-daemon.pid");
    write(&path, Path::new("/tmp/tau.sock"), "0.0.0").unwrap();
    assert!(is_alive(std::process::id()));
    assert!(!remove_stale(&path));
    assert!(path.exists());
  }

  #[test]
  fn dead_pid_is_cleaned_up() {
    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("tau-daemon.pid");
    let record = PidFile {
      pid: 999_987_654,
      socket_path: "/tmp/tau.sock".into(),
      started_at: Utc::now(),
      version: "0.0.0".into(),
    };
    fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();
    assert!(remove_stale(&path));
    assert!(!path.exists());
  }
}
