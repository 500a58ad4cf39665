//! One sandboxed extension worker: a child process running the configured
//! JS runtime on the extension source, speaking the line-delimited ABI
//! over its stdio. Resource limits are applied through the runtime
//! command's own flags (e.g. `--max-old-space-size`).

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::abi::{ExtToolSpec, HostMessage, WorkerMessage};

/// Per-call timeout.
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const BASH_DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Worker-originated updates the host reacts to.
#[derive(Debug)]
pub enum WorkerUpdate {
  Registered {
    tools: Vec<ExtToolSpec>,
    events: Vec<String>,
  },
  Memory {
    memory_type: String,
    title: String,
    content: String,
    tags: Vec<String>,
  },
  Exited {
    message: String,
  },
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, String>>>>>;

#[derive(Clone)]
pub struct ExtensionWorker {
  extension_id: String,
  stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
  pending: Pending,
  kill_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
  exited: Arc<AtomicBool>,
}

impl ExtensionWorker {
  /// Spawn the runtime on the extension source and send `init`. Updates
  /// (register, memories, exit) flow out of the returned channel.
  pub async fn spawn(
    runtime: &[String],
    source: &Path,
    extension_id: &str,
  ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<WorkerUpdate>)> {
    let (program, args) = runtime.split_first().ok_or_else(|| {
      std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty extension runtime")
    })?;
    let mut child = Command::new(program)
      .args(args)
      .arg(source)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()?;

    let stdin = child.stdin.take().ok_or_else(|| {
      std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin unavailable")
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
      std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdout unavailable")
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
      std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stderr unavailable")
    })?;

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = oneshot::channel();
    let worker = Self {
      extension_id: extension_id.to_string(),
      stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
      pending: Arc::new(Mutex::new(HashMap::new())),
      kill_tx: Arc::new(Mutex::new(Some(kill_tx))),
      exited: Arc::new(AtomicBool::new(false)),
    };

    worker.spawn_stdout_reader(stdout, updates_tx.clone());
    spawn_stderr_logger(extension_id.to_string(), stderr);
    worker.spawn_exit_watcher(child, kill_rx, updates_tx);

    worker
      .send(&HostMessage::Init {
        extension_id: extension_id.to_string(),
      })
      .await;
    Ok((worker, updates_rx))
  }

  pub fn has_exited(&self) -> bool {
    self.exited.load(Ordering::SeqCst)
  }

  /// Invoke a registered tool. At-most-once: the call either resolves
  /// with the worker's result, times out, or is rejected on worker exit.
  pub async fn call_tool(&self, name: &str, params: Value) -> Result<Value, String> {
    if self.has_exited() {
      return Err(format!("Extension {} exited", self.extension_id));
    }
    let id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    self.pending.lock().insert(id.clone(), tx);
    self
      .send(&HostMessage::ToolCall {
        id: id.clone(),
        name: name.to_string(),
        params,
      })
      .await;

    match tokio::time::timeout(TOOL_CALL_TIMEOUT, rx).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(format!("Extension {} exited", self.extension_id)),
      Err(_) => {
        self.pending.lock().remove(&id);
        Err("Tool call timed out".to_string())
      }
    }
  }

  pub async fn send_event(&self, name: &str, data: Value) {
    self
      .send(&HostMessage::Event {
        name: name.to_string(),
        data,
      })
      .await;
  }

  /// Graceful stop: `shutdown` message, one second of grace, then kill.
  pub async fn shutdown(&self) {
    self.send(&HostMessage::Shutdown).await;
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while !self.has_exited() && tokio::time::Instant::now() < deadline {
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if !self.has_exited()
      && let Some(kill) = self.kill_tx.lock().take()
    {
      debug!(event = "ext_worker_killed", extension = %self.extension_id, "grace expired, killing worker");
      let _ = kill.send(());
    }
  }

  async fn send(&self, message: &HostMessage) {
    let Ok(mut line) = serde_json::to_string(message) else {
      return;
    };
    line.push('\n');
    let mut stdin = self.stdin.lock().await;
    if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
      debug!(event = "ext_send_failed", extension = %self.extension_id, "worker stdin closed");
    }
  }

  fn spawn_stdout_reader(
    &self,
    stdout: tokio::process::ChildStdout,
    updates: mpsc::UnboundedSender<WorkerUpdate>,
  ) {
    let worker = self.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(stdout).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
          continue;
        }
        let message: WorkerMessage = match serde_json::from_str(trimmed) {
          Ok(m) => m,
          Err(e) => {
            warn!(event = "ext_bad_message", extension = %worker.extension_id, error = %e, "undecodable worker message");
            continue;
          }
        };
        match message {
          WorkerMessage::Register { tools, events } => {
            let _ = updates.send(WorkerUpdate::Registered { tools, events });
          }
          WorkerMessage::ToolResult { id, result, error } => {
            if let Some(tx) = worker.pending.lock().remove(&id) {
              let outcome = match error {
                Some(e) => Err(e),
                None => Ok(result.unwrap_or(Value::Null)),
              };
              let _ = tx.send(outcome);
            }
          }
          WorkerMessage::Log { level, message } => match level.as_str() {
            "error" => warn!(event = "ext_log", extension = %worker.extension_id, %message, "extension error log"),
            _ => debug!(event = "ext_log", extension = %worker.extension_id, level = %level, %message, "extension log"),
          },
          WorkerMessage::CreateMemory {
            memory_type,
            title,
            content,
            tags,
          } => {
            let _ = updates.send(WorkerUpdate::Memory {
              memory_type,
              title,
              content,
              tags,
            });
          }
          WorkerMessage::Bash {
            id,
            command,
            timeout_ms,
          } => {
            let worker = worker.clone();
            tokio::spawn(async move {
              let reply = run_bash(&command, timeout_ms).await;
              let message = match reply {
                Ok(result) => HostMessage::ToolResult {
                  id,
                  result: Some(result),
                  error: None,
                },
                Err(e) => HostMessage::ToolResult {
                  id,
                  result: None,
                  error: Some(e),
                },
              };
              worker.send(&message).await;
            });
          }
        }
      }
    });
  }

  fn spawn_exit_watcher(
    &self,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    updates: mpsc::UnboundedSender<WorkerUpdate>,
  ) {
    let extension_id = self.extension_id.clone();
    let pending = Arc::clone(&self.pending);
    let exited = Arc::clone(&self.exited);
    tokio::spawn(async move {
      enum Outcome {
        Exited(std::io::Result<std::process::ExitStatus>),
        Kill,
      }
      let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        _ = &mut kill_rx => Outcome::Kill,
      };
      let status = match outcome {
        Outcome::Exited(status) => status,
        Outcome::Kill => {
          let _ = child.start_kill();
          child.wait().await
        }
      };
      exited.store(true, Ordering::SeqCst);
      let message = match status {
        Ok(s) => format!("Extension {extension_id} exited ({s})"),
        Err(e) => format!("Extension {extension_id} exited (wait failed: {e})"),
      };
      // Pending calls reject rather than hang
      let stranded: Vec<_> = pending.lock().drain().collect();
      for (_id, tx) in stranded {
        let _ = tx.send(Err(format!("Extension {extension_id} exited")));
      }
      debug!(event = "ext_worker_exited", extension = %extension_id, "worker exited");
      let _ = updates.send(WorkerUpdate::Exited { message });
    });
  }
}

fn spawn_stderr_logger(extension_id: String, stderr: tokio::process::ChildStderr) {
  tokio::spawn(async move {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      debug!(event = "ext_stderr", extension = %extension_id, line = %line, "extension stderr");
    }
  });
}

async fn run_bash(command: &str, timeout_ms: Option<u64>) -> Result<Value, String> {
  let timeout = timeout_ms
    .map(Duration::from_millis)
    .unwrap_or(BASH_DEFAULT_TIMEOUT);
  let output = tokio::time::timeout(
    timeout,
    Command::new("sh").arg("-c").arg(command).output(),
  )
  .await
  .map_err(|_| "bash command timed out".to_string())?
  .map_err(|e| format!("bash spawn failed: {e}"))?;
  Ok(json!({
    "stdout": String::from_utf8_lossy(&output.stdout),
    "stderr": String::from_utf8_lossy(&output.stderr),
    "exitCode": output.status.code(),
  }))
}
