//! Debounced watch over the journal directory. New paragraphs are diffed
//! against a cached snapshot and handed to the main agent as a silent
//! memory prompt.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentHost;
use crate::texts;
use crate::watch;

const DEBOUNCE: Duration = Duration::from_millis(1500);

pub struct JournalWatcher {
  stop: CancellationToken,
}

impl JournalWatcher {
  /// Snapshot existing files first so only genuinely new paragraphs
  /// prompt the agent.
  pub fn start(dir: PathBuf, host: AgentHost) -> Self {
    let stop = CancellationToken::new();
    let stop_clone = stop.clone();
    tokio::spawn(async move {
      if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(event = "journal_dir_failed", error = %e, "could not create journal dir");
        return;
      }
      let snapshots: Mutex<HashMap<PathBuf, HashSet<String>>> = Mutex::new(seed_snapshots(&dir));
      let processing: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));

      let Ok((_watcher, mut rx)) = watch::watch_dir(&dir) else {
        warn!(event = "journal_watch_failed", dir = %dir.display(), "could not watch journal dir");
        return;
      };
      info!(event = "journal_watch_started", dir = %dir.display(), "journal watcher started");

      loop {
        let batch = tokio::select! {
          _ = stop_clone.cancelled() => break,
          batch = watch::next_batch(&mut rx, DEBOUNCE) => batch,
        };
        let Some(batch) = batch else { break };

        let mut touched: Vec<PathBuf> = batch
          .iter()
          .flat_map(|e| e.paths.iter().cloned())
          .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
          .collect();
        touched.sort();
        touched.dedup();

        for path in touched {
          // Re-entrancy guard per file
          if !processing.lock().insert(path.clone()) {
            continue;
          }
          let new_paragraphs = {
            let mut snapshots = snapshots.lock();
            diff_file(&path, &mut snapshots)
          };
          if !new_paragraphs.is_empty() {
            let file_name = path
              .file_name()
              .map(|n| n.to_string_lossy().into_owned())
              .unwrap_or_default();
            debug!(
              event = "journal_new_paragraphs",
              file = %file_name,
              count = new_paragraphs.len(),
              "new journal paragraphs"
            );
            if host
              .prompt_main_silent(&texts::journal_memory_prompt(&file_name, &new_paragraphs))
              .is_err()
            {
              debug!(event = "journal_agent_unavailable", "main agent unavailable, skipping");
            }
          }
          processing.lock().remove(&path);
        }
      }
      debug!(event = "journal_watch_stopped", "journal watcher stopped");
    });
    Self { stop }
  }

  pub fn stop(&self) {
    self.stop.cancel();
  }
}

fn seed_snapshots(dir: &Path) -> HashMap<PathBuf, HashSet<String>> {
  let mut map = HashMap::new();
  let Ok(entries) = std::fs::read_dir(dir) else {
    return map;
  };
  for entry in entries.flatten() {
    let path = entry.path();
    if path.extension().is_some_and(|ext| ext == "md")
      && let Ok(content) = std::fs::read_to_string(&path)
    {
      map.insert(path, paragraphs(&content).into_iter().collect());
    }
  }
  map
}

/// Paragraphs whose trimmed content is absent from the old snapshot.
/// Updates the snapshot in place.
fn diff_file(
  path: &Path,
  snapshots: &mut HashMap<PathBuf, HashSet<String>>,
) -> Vec<String> {
  let content = std::fs::read_to_string(path).unwrap_or_default();
  let current = paragraphs(&content);
  let old = snapshots.entry(path.to_path_buf()).or_default();
  let fresh: Vec<String> = current
    .iter()
    .filter(|p| !old.contains(*p) && !is_heading_only(p))
    .cloned()
    .collect();
  *old = current.into_iter().collect();
  fresh
}

/// A paragraph is a run of non-blank lines separated by blank-line runs.
fn paragraphs(content: &str) -> Vec<String> {
  let mut out = Vec::new();
  let mut current: Vec<&str> = Vec::new();
  for line in content.lines() {
    if line.trim().is_empty() {
      if !current.is_empty() {
        out.push(current.join("\n").trim().to_string());
        current.clear();
      }
    } else {
      current.push(line);
    }
  }
  if !current.is_empty() {
    out.push(current.join("\n").trim().to_string());
  }
  out
}

/// Heading-only single-line paragraphs carry no memorable content.
fn is_heading_only(paragraph: &str) -> bool {
  !paragraph.contains('\n') && paragraph.starts_with('#')
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::{FakeProvider, HistoryEntry};
  use crate::config::Config;
  use crate::daemon::notify::{ClientRegistry, NotificationBus};
  use crate::locks::{DEFAULT_LOCK_TIMEOUT, FileLockTable};
  use crate::tasks::TaskStore;
  use test_support::wait_for;

  #[test]
  fn splits_paragraphs_on_blank_runs() {
    let text = "# Title\n\nfirst paragraph\nstill first\n\n\nsecond paragraph\n";
    let got = paragraphs(text);
    assert_eq!(
      got,
      vec![
        "# Title".to_string(),
        "first paragraph\nstill first".to_string(),
        "second paragraph".to_string()
      ]
    );
  }

  #[test]
  fn heading_only_paragraphs_are_excluded_from_diff() {
    let td = tempfile::tempdir().unwrap();
    let file = td.path().join("2026-08-01.md");
    std::fs::write(&file, "# August\n\nmet the new team\n").unwrap();
    let mut snapshots = HashMap::new();
    let fresh = diff_file(&file, &mut snapshots);
    assert_eq!(fresh, vec!["met the new team".to_string()]);

    // Unchanged file yields nothing new
    assert!(diff_file(&file, &mut snapshots).is_empty());

    std::fs::write(&file, "# August\n\nmet the new team\n\n## Later\n\nshipped it\n").unwrap();
    assert_eq!(diff_file(&file, &mut snapshots), vec!["shipped it".to_string()]);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn new_paragraphs_prompt_the_main_agent_silently() {
    let td = tempfile::tempdir().unwrap();
    let journal = td.path().join("journal");
    std::fs::create_dir_all(&journal).unwrap();
    std::fs::write(journal.join("log.md"), "# Log\n\nalready known\n").unwrap();

    let host = AgentHost::new(
      Config::default(),
      Arc::new(FakeProvider::new()),
      NotificationBus::new(Arc::new(ClientRegistry::new())),
      FileLockTable::new(DEFAULT_LOCK_TIMEOUT),
      Arc::new(TaskStore::new(td.path().join("tasks.md"))),
    );
    host.setup_agent(td.path()).await.unwrap();

    let watcher = JournalWatcher::start(journal.clone(), host.clone());
    // Give the watcher a beat to seed before appending
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(
      journal.join("log.md"),
      "# Log\n\nalready known\n\nprefers rebase over merge\n",
    )
    .unwrap();

    let session = host.main_session().unwrap();
    let prompted = wait_for(Duration::from_secs(5), || {
      let session = session.clone();
      async move {
        session.history().iter().any(|e| matches!(
          e,
          HistoryEntry::User { text, .. }
            if text.contains("prefers rebase over merge") && !text.contains("already known")
        ))
      }
    })
    .await;
    assert!(prompted, "no silent journal prompt arrived");
    watcher.stop();
  }
}
