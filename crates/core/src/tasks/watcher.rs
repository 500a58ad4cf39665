//! Debounced watch over the workspace tasks file. Newly submitted `todo`
//! entries are handed to the GAL coordinator (or spawned directly when
//! the coordinator is unavailable), the file is rewritten with the
//! assignments, and clients are told via `daemon.tasks.changed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentHost, SpawnConfig};
use crate::gal::GalTask;
use crate::tasks::model::{Task, TaskStatus};
use crate::tasks::store::TaskStore;
use crate::texts;
use crate::watch;

const DEBOUNCE: Duration = Duration::from_millis(500);

pub struct TaskWatcherDeps {
  pub store: Arc<TaskStore>,
  pub host: AgentHost,
}

pub struct TaskWatcher {
  stop: CancellationToken,
}

impl TaskWatcher {
  /// Prime the last-known map from the current file, run one pickup pass
  /// for pending entries, then keep processing debounced file events.
  pub async fn start(deps: TaskWatcherDeps) -> Self {
    let stop = CancellationToken::new();
    let mut last_known = seed_last_known(&deps.store);

    // Initial pass: entries that are `todo` without an agent are pending
    // submissions from before this daemon started.
    let mut last_written = process(&deps, &mut last_known).await;

    let stop_clone = stop.clone();
    tokio::spawn(async move {
      let file = deps.store.path().to_path_buf();
      let Some(dir) = file.parent().map(std::path::Path::to_path_buf) else {
        error!(event = "task_watch_no_parent", "tasks file has no parent directory");
        return;
      };
      // Watching the parent directory covers both edits and the file
      // appearing after daemon start.
      let Ok((_watcher, mut rx)) = watch::watch_dir(&dir) else {
        error!(event = "task_watch_failed", dir = %dir.display(), "could not watch tasks dir");
        return;
      };
      loop {
        let batch = tokio::select! {
          _ = stop_clone.cancelled() => break,
          batch = watch::next_batch(&mut rx, DEBOUNCE) => batch,
        };
        let Some(batch) = batch else { break };
        let touches_tasks = batch
          .iter()
          .flat_map(|e| e.paths.iter())
          .any(|p| p == &file);
        if !touches_tasks {
          continue;
        }
        // An event caused by our own save would re-process forever
        if let Some(written) = &last_written
          && std::fs::read_to_string(&file).map(|s| s == *written).unwrap_or(false)
        {
          continue;
        }
        if let Some(written) = process(&deps, &mut last_known).await {
          last_written = Some(written);
        }
      }
      debug!(event = "task_watch_stopped", "task watcher stopped");
    });

    Self { stop }
  }

  pub fn stop(&self) {
    self.stop.cancel();
  }
}

/// Current statuses, except that unassigned `todo` entries are left out
/// so the initial pass picks them up exactly once.
fn seed_last_known(store: &TaskStore) -> HashMap<String, TaskStatus> {
  let mut map = HashMap::new();
  if let Ok(tasks) = store.load() {
    for task in tasks {
      if task.status == TaskStatus::Todo && task.subagent_id.is_none() {
        continue;
      }
      map.insert(task.id, task.status);
    }
  }
  map
}

/// One watcher pass. Returns the serialized content written, so the
/// caller can recognize the filesystem echo of its own save.
async fn process(
  deps: &TaskWatcherDeps,
  last_known: &mut HashMap<String, TaskStatus>,
) -> Option<String> {
  let snapshot = match deps.store.load() {
    Ok(tasks) => tasks,
    Err(e) => {
      warn!(event = "task_reload_failed", error = %e, "could not reload tasks");
      return None;
    }
  };

  let Ok(manager) = deps.host.manager() else {
    // Agent not set up yet; leave last_known untouched so these entries
    // are retried on the next fire.
    return None;
  };

  // Agents that died with a previous daemon make their tasks fresh again.
  for task in &snapshot {
    if let Some(agent) = &task.subagent_id
      && !manager.knows_agent(agent)
    {
      debug!(event = "task_agent_stale", task_id = %task.id, agent = %agent, "stale agent detected");
      last_known.remove(&task.id);
    }
  }

  let newly: Vec<Task> = snapshot
    .iter()
    .filter(|t| {
      t.status == TaskStatus::Todo
        && t.subagent_id.as_ref().is_none_or(|a| !manager.knows_agent(a))
        && last_known.get(&t.id) != Some(&TaskStatus::Todo)
    })
    .cloned()
    .collect();

  let assignments = if newly.is_empty() {
    Vec::new()
  } else {
    info!(event = "tasks_submitted", count = newly.len(), "newly submitted tasks detected");
    submit(deps, &newly).await
  };

  // Atomic read-modify-write: a completion bridge landing between our
  // snapshot and this save must not be overwritten.
  let manager_for_update = manager.clone();
  let updated = deps
    .store
    .update(move |tasks| {
      for task in tasks.iter_mut() {
        if let Some(agent) = task.subagent_id.clone()
          && !manager_for_update.knows_agent(&agent)
        {
          task.subagent_id = None;
        }
      }
      for (task_id, subagent_id) in &assignments {
        if let Some(task) = tasks.iter_mut().find(|t| t.id == *task_id)
          && task.status == TaskStatus::Todo
        {
          task.subagent_id = Some(subagent_id.clone());
          task.status = TaskStatus::InProgress;
        }
      }
    })
    .await;
  let tasks = match updated {
    Ok(((), tasks)) => tasks,
    Err(e) => {
      warn!(event = "task_save_failed", error = %e, "could not save tasks");
      return None;
    }
  };

  deps
    .host
    .notifier()
    .broadcast("daemon.tasks.changed", serde_json::to_value(&tasks).unwrap_or(json!([])));

  last_known.clear();
  for task in &tasks {
    last_known.insert(task.id.clone(), task.status);
  }
  Some(crate::tasks::model::serialize_tasks(&tasks))
}

/// Delegate to the coordinator; fall back to a direct lock-unaware spawn
/// per task. A task that fails both stays `todo` and is logged.
async fn submit(deps: &TaskWatcherDeps, newly: &[Task]) -> Vec<(String, String)> {
  let gal_tasks: Vec<GalTask> = newly
    .iter()
    .map(|t| GalTask {
      id: t.id.clone(),
      text: t.text.clone(),
    })
    .collect();

  let mut assignments = Vec::new();
  let mut remaining: Vec<&Task> = newly.iter().collect();
  if let Ok(gal) = deps.host.gal() {
    match gal.submit_tasks(&gal_tasks, None, None, None).await {
      Ok(submitted) => {
        return submitted
          .into_iter()
          .map(|w| (w.task_id, w.subagent_id))
          .collect();
      }
      Err(e) => {
        warn!(event = "gal_submit_failed", error = %e, "gal submit failed, falling back to direct spawn");
        // Workers spawned before the failure keep their assignments
        for worker in gal.get_workers() {
          if newly.iter().any(|t| t.id == worker.task_id) {
            assignments.push((worker.task_id.clone(), worker.id.clone()));
          }
        }
        remaining.retain(|t| !assignments.iter().any(|(id, _a)| id == &t.id));
      }
    }
  }

  let Ok(manager) = deps.host.manager() else {
    return assignments;
  };
  for task in remaining {
    let config = SpawnConfig {
      name: format!("worker-{}", &task.id.chars().take(8).collect::<String>()),
      task: Some(format!(
        "{}\n\nYour task: {}",
        texts::DIRECT_SPAWN_PREAMBLE,
        task.text
      )),
      persistent: false,
      can_spawn: Some(false),
      task_id: Some(task.id.clone()),
      model: None,
      thinking: None,
    };
    match manager.spawn(&[config], 0) {
      Ok(infos) => assignments.push((task.id.clone(), infos[0].status.id.clone())),
      Err(e) => {
        // Never silently consumed: the task stays `todo` on disk.
        error!(event = "task_spawn_failed", task_id = %task.id, error = %e, "direct spawn failed");
      }
    }
  }
  assignments
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::FakeProvider;
  use crate::config::Config;
  use crate::daemon::notify::{ClientRegistry, NotificationBus};
  use crate::locks::{DEFAULT_LOCK_TIMEOUT, FileLockTable};
  use crate::tasks::model::serialize_tasks;
  use test_support::wait_for;

  async fn ready_host(td: &tempfile::TempDir, store: Arc<TaskStore>) -> AgentHost {
    let registry = Arc::new(ClientRegistry::new());
    let host = AgentHost::new(
      Config::default(),
      Arc::new(FakeProvider::new()),
      NotificationBus::new(registry),
      FileLockTable::new(DEFAULT_LOCK_TIMEOUT),
      store,
    );
    host.setup_agent(td.path()).await.unwrap();
    host
  }

  fn todo_task(text: &str) -> Task {
    Task::new(text, TaskStatus::Todo)
  }

  async fn poll_first_task(
    store: &Arc<TaskStore>,
    mut predicate: impl FnMut(&Task) -> bool,
  ) -> bool {
    wait_for(Duration::from_secs(5), || {
      let snapshot = store.load().unwrap_or_default();
      let hit = snapshot.first().is_some_and(&mut predicate);
      async move { hit }
    })
    .await
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn pending_todo_is_picked_up_once_on_start() {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(TaskStore::new(td.path().join("tasks.md")));
    let seeded = todo_task("restart pickup");
    std::fs::write(store.path(), serialize_tasks(&[seeded.clone()])).unwrap();

    let host = ready_host(&td, Arc::clone(&store)).await;
    let watcher = TaskWatcher::start(TaskWatcherDeps {
      store: Arc::clone(&store),
      host: host.clone(),
    })
    .await;

    // The scripted provider completes instantly, so the stable state is
    // the full lifecycle: todo -> in-progress -> done with a result.
    let done = poll_first_task(&store, |t| t.status == TaskStatus::Done).await;
    assert!(done, "task never completed: {:?}", store.load());
    let task = store.load().unwrap().remove(0);
    assert!(task.done);
    assert!(task.result.is_some(), "completion result missing");

    // Exactly once: nothing left running, no second pickup
    tokio::time::sleep(Duration::from_millis(700)).await;
    let tasks = store.load().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Done);
    assert_eq!(host.manager().unwrap().subagent_count(), 0);

    watcher.stop();
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn file_edit_triggers_submission() {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(TaskStore::new(td.path().join("tasks.md")));
    store.save(&[]).await.unwrap();

    let host = ready_host(&td, Arc::clone(&store)).await;
    let watcher = TaskWatcher::start(TaskWatcherDeps {
      store: Arc::clone(&store),
      host: host.clone(),
    })
    .await;

    // Simulate a client editing the file on disk
    std::fs::write(
      store.path(),
      serialize_tasks(&[todo_task("new work from the ui")]),
    )
    .unwrap();

    let done = poll_first_task(&store, |t| t.status == TaskStatus::Done).await;
    assert!(done, "edited todo was never submitted: {:?}", store.load());
    // The worker released its registration on completion
    assert!(host.gal().unwrap().get_workers().is_empty());
    watcher.stop();
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn stale_agent_ids_are_cleared_and_resubmitted() {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(TaskStore::new(td.path().join("tasks.md")));
    let mut task = todo_task("survivor");
    task.subagent_id = Some("sub-dead-beef".to_string());
    std::fs::write(store.path(), serialize_tasks(&[task])).unwrap();

    let host = ready_host(&td, Arc::clone(&store)).await;
    let watcher = TaskWatcher::start(TaskWatcherDeps {
      store: Arc::clone(&store),
      host: host.clone(),
    })
    .await;

    // The dead assignment is treated as fresh: resubmitted and completed
    let done = poll_first_task(&store, |t| {
      t.status == TaskStatus::Done && t.subagent_id.as_deref() != Some("sub-dead-beef")
    })
    .await;
    assert!(done, "stale todo was not resubmitted: {:?}", store.load());
    watcher.stop();
  }
}
