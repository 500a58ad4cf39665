//! Structured message ABI between the daemon and extension workers. One
//! JSON object per line on the worker's stdio; no shared memory, no host
//! objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtToolSpec {
  pub name: String,
  pub description: String,
  pub parameters: Value,
}

/// Host -> worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
  #[serde(rename_all = "camelCase")]
  Init { extension_id: String },
  ToolCall {
    id: String,
    name: String,
    params: Value,
  },
  /// Reply to a worker-initiated `bash` request.
  ToolResult {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
  },
  Event { name: String, data: Value },
  Shutdown,
}

/// Worker -> host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
  /// Must arrive within the register window after `init`.
  Register {
    #[serde(default)]
    tools: Vec<ExtToolSpec>,
    #[serde(default)]
    events: Vec<String>,
  },
  ToolResult {
    id: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
  },
  Log { level: String, message: String },
  #[serde(rename_all = "camelCase")]
  CreateMemory {
    memory_type: String,
    title: String,
    content: String,
    #[serde(default)]
    tags: Vec<String>,
  },
  /// Convenience channel: the host shells out and answers with a
  /// `tool_result` carrying stdout/stderr/exitCode.
  #[serde(rename_all = "camelCase")]
  Bash {
    id: String,
    command: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
  },
}
