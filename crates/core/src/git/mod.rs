//! Read-only view over the workspace repository backing the `git.*` RPCs
//! and the `daemon.git.changed` notification.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum GitViewError {
  #[error("git: {0}")]
  Git(#[from] git2::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitStatus {
  pub branch: Option<String>,
  pub head: Option<String>,
  pub dirty_files: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitLogEntry {
  pub id: String,
  pub summary: String,
}

struct GitViewInner {
  workdir: PathBuf,
  last: Mutex<Option<GitStatus>>,
  stop: CancellationToken,
}

/// Polls the repository and reports changes through `on_change`. The
/// workspace not being a git repository is not an error; the status is
/// simply unavailable.
#[derive(Clone)]
pub struct GitView {
  inner: Arc<GitViewInner>,
}

impl GitView {
  pub fn new(workdir: impl Into<PathBuf>) -> Self {
    Self {
      inner: Arc::new(GitViewInner {
        workdir: workdir.into(),
        last: Mutex::new(None),
        stop: CancellationToken::new(),
      }),
    }
  }

  /// Start the change poller; `on_change` fires when the snapshot moved.
  pub fn start(&self, on_change: impl Fn() + Send + Sync + 'static) {
    let inner = Arc::clone(&self.inner);
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = inner.stop.cancelled() => break,
          _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        let Ok(current) = compute_status(&inner.workdir) else {
          continue;
        };
        let changed = {
          let mut last = inner.last.lock();
          let changed = last.as_ref() != Some(&current);
          *last = Some(current);
          changed
        };
        if changed {
          debug!(event = "git_changed", workdir = %inner.workdir.display(), "git state changed");
          on_change();
        }
      }
    });
  }

  pub fn stop(&self) {
    self.inner.stop.cancel();
  }

  pub fn status(&self) -> Result<GitStatus, GitViewError> {
    let status = compute_status(&self.inner.workdir)?;
    *self.inner.last.lock() = Some(status.clone());
    Ok(status)
  }

  pub fn log(&self, limit: usize) -> Result<Vec<GitLogEntry>, GitViewError> {
    let repo = git2::Repository::open(&self.inner.workdir)?;
    let mut walk = repo.revwalk()?;
    walk.push_head()?;
    let mut entries = Vec::new();
    for oid in walk.take(limit) {
      let oid = oid?;
      let commit = repo.find_commit(oid)?;
      entries.push(GitLogEntry {
        id: oid.to_string()[..8.min(oid.to_string().len())].to_string(),
        summary: commit.summary().unwrap_or("").to_string(),
      });
    }
    Ok(entries)
  }
}

fn compute_status(workdir: &Path) -> Result<GitStatus, GitViewError> {
  let repo = git2::Repository::open(workdir)?;
  let head = repo.head().ok();
  let branch = head
    .as_ref()
    .and_then(|h| h.shorthand())
    .map(str::to_string);
  let head_id = head
    .as_ref()
    .and_then(|h| h.target())
    .map(|oid| oid.to_string());
  let mut options = git2::StatusOptions::new();
  options.include_untracked(true);
  let dirty_files = repo
    .statuses(Some(&mut options))?
    .iter()
    .filter(|s| !s.status().is_ignored())
    .count();
  Ok(GitStatus {
    branch,
    head: head_id,
    dirty_files,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_support::seed_repo;

  #[tokio::test]
  async fn status_reports_branch_and_dirt() {
    let td = tempfile::tempdir().unwrap();
    seed_repo(td.path());
    let view = GitView::new(td.path());
    let status = view.status().unwrap();
    assert_eq!(status.branch.as_deref(), Some("main"));
    assert_eq!(status.dirty_files, 0);

    std::fs::write(td.path().join("new.txt"), "x").unwrap();
    let status = view.status().unwrap();
    assert_eq!(status.dirty_files, 1);
  }

  #[tokio::test]
  async fn log_lists_recent_commits() {
    let td = tempfile::tempdir().unwrap();
    seed_repo(td.path());
    let view = GitView::new(td.path());
    let log = view.log(10).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].summary, "seed workspace");
  }

  #[tokio::test]
  async fn non_repo_is_an_error_not_a_panic() {
    let td = tempfile::tempdir().unwrap();
    let view = GitView::new(td.path());
    assert!(view.status().is_err());
  }
}
