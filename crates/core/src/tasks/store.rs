use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use super::model::{Task, TaskStatus, parse_tasks, serialize_tasks};

#[derive(Debug, Error)]
pub enum TaskStoreError {
  #[error("io: {0}")]
  Io(#[from] io::Error),
  #[error("no task is assigned to agent `{0}`")]
  NoTaskForAgent(String),
}

/// Owner of the tasks markdown file. Every write goes through `save` which
/// serializes concurrent writers and lands atomically (temp + rename), so
/// readers always observe either the old or the new file.
pub struct TaskStore {
  path: PathBuf,
  save_lock: Mutex<()>,
}

impl TaskStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      save_lock: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Read and parse the file; a missing file is an empty list.
  pub fn load(&self) -> Result<Vec<Task>, TaskStoreError> {
    match fs::read_to_string(&self.path) {
      Ok(s) => Ok(parse_tasks(&s)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
      Err(e) => Err(e.into()),
    }
  }

  /// Serialize and atomically replace the file.
  pub async fn save(&self, tasks: &[Task]) -> Result<(), TaskStoreError> {
    let _guard = self.save_lock.lock().await;
    self.write_atomic(tasks)
  }

  /// Serialized read-modify-write. The mutation runs under the save lock,
  /// so two near-simultaneous updates cannot interleave.
  pub async fn update<R>(
    &self,
    mutate: impl FnOnce(&mut Vec<Task>) -> R,
  ) -> Result<(R, Vec<Task>), TaskStoreError> {
    let _guard = self.save_lock.lock().await;
    let mut tasks = match fs::read_to_string(&self.path) {
      Ok(s) => parse_tasks(&s),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
      Err(e) => return Err(e.into()),
    };
    let out = mutate(&mut tasks);
    self.write_atomic(&tasks)?;
    Ok((out, tasks))
  }

  /// Completion bridge: mark the task assigned to `agent_id` done and
  /// record the trailing assistant text as its result.
  pub async fn mark_done_by_agent(
    &self,
    agent_id: &str,
    result: &str,
  ) -> Result<Vec<Task>, TaskStoreError> {
    let agent = agent_id.to_string();
    let result = result.to_string();
    let (found, tasks) = self
      .update(move |tasks| {
        let mut found = false;
        for task in tasks.iter_mut() {
          if task.subagent_id.as_deref() == Some(agent.as_str()) {
            task.status = TaskStatus::Done;
            task.done = true;
            task.result = if result.is_empty() { None } else { Some(result.clone()) };
            found = true;
          }
        }
        found
      })
      .await?;
    if !found {
      return Err(TaskStoreError::NoTaskForAgent(agent_id.to_string()));
    }
    info!(event = "task_marked_done", agent_id, "task marked done");
    Ok(tasks)
  }

  /// `request_input` bridge: move the agent's task to refinement, capture
  /// its questions, and detach the agent.
  pub async fn mark_refinement_by_agent(
    &self,
    agent_id: &str,
    questions: &str,
  ) -> Result<Vec<Task>, TaskStoreError> {
    let agent = agent_id.to_string();
    let questions = questions.to_string();
    let (found, tasks) = self
      .update(move |tasks| {
        let mut found = false;
        for task in tasks.iter_mut() {
          if task.subagent_id.as_deref() == Some(agent.as_str()) {
            task.status = TaskStatus::Refinement;
            task.done = false;
            task.result = Some(questions.clone());
            task.subagent_id = None;
            found = true;
          }
        }
        found
      })
      .await?;
    if !found {
      return Err(TaskStoreError::NoTaskForAgent(agent_id.to_string()));
    }
    info!(event = "task_marked_refinement", agent_id, "task moved to refinement");
    Ok(tasks)
  }

  fn write_atomic(&self, tasks: &[Task]) -> Result<(), TaskStoreError> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }
    let tmp = self.path.with_extension("md.tmp");
    fs::write(&tmp, serialize_tasks(tasks))?;
    fs::rename(&tmp, &self.path)?;
    Ok(())
  }
}
