use std::env;
use std::path::{Path, PathBuf};

use super::types::{ConfigError, Result};

/// All well-known locations the daemon touches, rooted at a single base
/// directory (`~/.tau` unless overridden). Tests construct one with
/// [`TauPaths::at`] to stay inside a tempdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TauPaths {
  base: PathBuf,
}

impl TauPaths {
  /// Resolve from `TAU_HOME` or the platform home directory.
  pub fn resolve() -> Result<Self> {
    if let Some(base) = env::var_os("TAU_HOME") {
      return Ok(Self { base: PathBuf::from(base) });
    }
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(Self { base: home.join(".tau") })
  }

  /// Root everything at an explicit base directory.
  pub fn at(base: impl Into<PathBuf>) -> Self {
    Self { base: base.into() }
  }

  pub fn base(&self) -> &Path {
    &self.base
  }

  pub fn daemon_dir(&self) -> PathBuf {
    self.base.join("daemon")
  }

  /// Stream endpoint: a Unix socket file on POSIX, a named pipe on Windows.
  pub fn socket_path(&self) -> PathBuf {
    if let Some(p) = env::var_os("TAU_SOCKET") {
      return PathBuf::from(p);
    }
    #[cfg(windows)]
    {
      PathBuf::from(r"\\.\pipe\tau-daemon")
    }
    #[cfg(not(windows))]
    {
      self.daemon_dir().join("tau-daemon.sock")
    }
  }

  pub fn pid_file_path(&self) -> PathBuf {
    self.daemon_dir().join("tau-daemon.pid")
  }

  pub fn logs_path(&self) -> PathBuf {
    self.daemon_dir().join("logs.jsonl")
  }

  pub fn heartbeat_state_path(&self) -> PathBuf {
    self.daemon_dir().join("heartbeat.json")
  }

  /// The markdown note read on each scheduled heartbeat tick.
  pub fn heartbeat_note_path(&self) -> PathBuf {
    self.base.join("heartbeat.md")
  }

  pub fn extensions_dir(&self) -> PathBuf {
    self.base.join("extensions")
  }

  pub fn journal_dir(&self) -> PathBuf {
    self.base.join("journal")
  }
}

/// Location of the global config file (~/.config/tau/config.toml)
pub fn global_config_path() -> Option<PathBuf> {
  dirs::config_dir().map(|p| p.join("tau").join("config.toml"))
}

/// Location of the project config file (./.tau/config.toml)
pub fn project_config_path(workspace: &Path) -> PathBuf {
  workspace.join(".tau").join("config.toml")
}

/// The tasks file watched and rewritten by the daemon, per workspace.
pub fn tasks_file_path(workspace: &Path) -> PathBuf {
  workspace.join("tasks.md")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn paths_are_rooted_at_base() {
    let p = TauPaths::at("/tmp/tau-test");
    assert_eq!(p.daemon_dir(), PathBuf::from("/tmp/tau-test/daemon"));
    assert_eq!(
      p.pid_file_path(),
      PathBuf::from("/tmp/tau-test/daemon/tau-daemon.pid")
    );
    assert_eq!(p.heartbeat_note_path(), PathBuf::from("/tmp/tau-test/heartbeat.md"));
    assert_eq!(p.extensions_dir(), PathBuf::from("/tmp/tau-test/extensions"));
  }

  #[test]
  fn tasks_file_is_under_workspace() {
    assert_eq!(
      tasks_file_path(Path::new("/work")),
      PathBuf::from("/work/tasks.md")
    );
  }
}
