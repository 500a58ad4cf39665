//! Tool injection. Every spawned agent gets the coordination toolset
//! built here; the main agent gets a reduced set that deliberately
//! excludes `spawn_agents`.

use std::sync::Weak;
use std::time::Duration;

use serde_json::{Value, json};

use super::bus::BROADCAST_ID;
use super::manager::{ManagerInner, SpawnConfig, SubagentManager};
use super::provider::Tool;

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const WAIT_DEFAULT_TIMEOUT_SECS: u64 = 300;

fn upgrade(weak: &Weak<ManagerInner>) -> Result<SubagentManager, String> {
  weak
    .upgrade()
    .map(SubagentManager::from_inner)
    .ok_or_else(|| "agent manager is gone".to_string())
}

impl SubagentManager {
  /// The toolset injected into a spawned agent: `message_agent`,
  /// `wait_for_agents`, `list_agents`, `request_input`, conditionally
  /// `spawn_agents`, plus the extra tools configured at construction.
  pub fn build_tools_for_agent(
    &self,
    id: &str,
    _name: &str,
    can_spawn: bool,
    depth: u8,
  ) -> Vec<Tool> {
    let mut tools = vec![
      self.message_agent_tool(id),
      self.wait_for_agents_tool(id),
      self.list_agents_tool(),
      self.request_input_tool(id),
    ];
    if can_spawn {
      tools.push(self.spawn_agents_tool(depth));
    }
    tools.extend(self.extra_tools().iter().cloned());
    tools
  }

  /// The main agent's toolset: no `spawn_agents` (workers are started
  /// through the task file and the coordinator) and no `request_input`
  /// (there is no task to push back to refinement).
  pub fn build_main_tools(&self) -> Vec<Tool> {
    let mut tools = vec![
      self.message_agent_tool(super::session::MAIN_SESSION_ID),
      self.wait_for_agents_tool(super::session::MAIN_SESSION_ID),
      self.list_agents_tool(),
    ];
    tools.extend(self.extra_tools().iter().cloned());
    tools
  }

  fn message_agent_tool(&self, caller_id: &str) -> Tool {
    let weak = self.downgrade();
    let caller = caller_id.to_string();
    Tool::new(
      "message_agent",
      "Send a message to another agent by name or id. Use \"*\" to broadcast and \"main\" for the main agent.",
      json!({
        "type": "object",
        "properties": {
          "to": {"type": "string"},
          "message": {"type": "string"}
        },
        "required": ["to", "message"]
      }),
      move |args: Value| {
        let weak = weak.clone();
        let caller = caller.clone();
        async move {
          let manager = upgrade(&weak)?;
          let to = args["to"].as_str().ok_or("missing `to`")?;
          let message = args["message"].as_str().ok_or("missing `message`")?;
          let ack = manager
            .send_agent_message(&caller, to, message)
            .map_err(|e| e.to_string())?;
          Ok(json!({ "ok": true, "detail": ack }))
        }
      },
    )
  }

  fn wait_for_agents_tool(&self, caller_id: &str) -> Tool {
    let weak = self.downgrade();
    let caller = caller_id.to_string();
    Tool::new(
      "wait_for_agents",
      "Block until the named agents (or all with [\"*\"]) stop streaming, or the timeout elapses.",
      json!({
        "type": "object",
        "properties": {
          "agents": {"type": "array", "items": {"type": "string"}},
          "timeoutSecs": {"type": "integer"}
        },
        "required": ["agents"]
      }),
      move |args: Value| {
        let weak = weak.clone();
        let caller = caller.clone();
        async move {
          let manager = upgrade(&weak)?;
          let names: Vec<String> = serde_json::from_value(args["agents"].clone())
            .map_err(|e| format!("`agents`: {e}"))?;
          let timeout_secs = args["timeoutSecs"].as_u64().unwrap_or(WAIT_DEFAULT_TIMEOUT_SECS);
          let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

          loop {
            let busy = if names.iter().any(|n| n == BROADCAST_ID) {
              manager
                .list_all()
                .iter()
                .any(|i| i.status.id != caller && i.status.streaming)
            } else {
              names.iter().any(|name| {
                manager
                  .resolve(name)
                  .map(|s| s.is_streaming())
                  // A closed agent is not something to keep waiting on
                  .unwrap_or(false)
              })
            };
            if !busy {
              return Ok(json!({ "done": true }));
            }
            if tokio::time::Instant::now() >= deadline {
              return Ok(json!({ "done": false, "timedOut": true }));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
          }
        }
      },
    )
  }

  fn list_agents_tool(&self) -> Tool {
    let weak = self.downgrade();
    Tool::new(
      "list_agents",
      "List all live subagents with their streaming state.",
      json!({"type": "object", "properties": {}}),
      move |_args: Value| {
        let weak = weak.clone();
        async move {
          let manager = upgrade(&weak)?;
          let agents: Vec<Value> = manager
            .list_all()
            .into_iter()
            .map(|i| {
              json!({
                "id": i.status.id,
                "name": i.status.name,
                "streaming": i.status.streaming,
                "taskId": i.task_id,
              })
            })
            .collect();
          Ok(json!({ "agents": agents }))
        }
      },
    )
  }

  fn request_input_tool(&self, caller_id: &str) -> Tool {
    let weak = self.downgrade();
    let caller = caller_id.to_string();
    Tool::new(
      "request_input",
      "Ask the user for clarification: moves your task to refinement with your questions and detaches you.",
      json!({
        "type": "object",
        "properties": {"questions": {"type": "string"}},
        "required": ["questions"]
      }),
      move |args: Value| {
        let weak = weak.clone();
        let caller = caller.clone();
        async move {
          let manager = upgrade(&weak)?;
          let questions = args["questions"].as_str().ok_or("missing `questions`")?;
          manager.hooks_arc().on_task_refinement(&caller, questions).await
        }
      },
    )
  }

  fn spawn_agents_tool(&self, caller_depth: u8) -> Tool {
    let weak = self.downgrade();
    Tool::new(
      "spawn_agents",
      "Spawn one or more subagents, each with a name and an optional task prompt.",
      json!({
        "type": "object",
        "properties": {
          "agents": {
            "type": "array",
            "items": {
              "type": "object",
              "properties": {
                "name": {"type": "string"},
                "task": {"type": "string"},
                "persistent": {"type": "boolean"}
              },
              "required": ["name"]
            }
          }
        },
        "required": ["agents"]
      }),
      move |args: Value| {
        let weak = weak.clone();
        async move {
          let manager = upgrade(&weak)?;
          let configs: Vec<SpawnConfig> = serde_json::from_value(args["agents"].clone())
            .map_err(|e| format!("`agents`: {e}"))?;
          let infos = manager
            .spawn(&configs, caller_depth)
            .map_err(|e| e.to_string())?;
          Ok(json!({
            "spawned": infos
              .iter()
              .map(|i| json!({ "id": i.status.id, "name": i.status.name }))
              .collect::<Vec<_>>()
          }))
        }
      },
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::bus::MessageBus;
  use crate::agent::provider::FakeProvider;
  use std::sync::Arc;

  fn manager() -> SubagentManager {
    SubagentManager::new(
      Arc::new(FakeProvider::new()),
      MessageBus::new(),
      4,
      Vec::new(),
      None,
      None,
    )
  }

  fn tool_named(tools: &[Tool], name: &str) -> Tool {
    tools
      .iter()
      .find(|t| t.spec.name == name)
      .unwrap_or_else(|| panic!("missing tool {name}"))
      .clone()
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn agent_toolset_includes_spawn_only_when_allowed() {
    let m = manager();
    let with_spawn = m.build_tools_for_agent("sub-x", "X", true, 1);
    assert!(with_spawn.iter().any(|t| t.spec.name == "spawn_agents"));
    let without = m.build_tools_for_agent("sub-y", "Y", false, 2);
    assert!(!without.iter().any(|t| t.spec.name == "spawn_agents"));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn main_toolset_excludes_spawn_and_request_input() {
    let m = manager();
    let tools = m.build_main_tools();
    let names: Vec<&str> = tools.iter().map(|t| t.spec.name.as_str()).collect();
    assert!(names.contains(&"message_agent"));
    assert!(names.contains(&"list_agents"));
    assert!(!names.contains(&"spawn_agents"));
    assert!(!names.contains(&"request_input"));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn spawn_agents_tool_spawns_at_caller_depth() {
    let m = manager();
    let tool = tool_named(&m.build_tools_for_agent("sub-p", "P", true, 1), "spawn_agents");
    let result = tool
      .invoke(serde_json::json!({"agents": [{"name": "Child"}]}))
      .await
      .unwrap();
    assert_eq!(result["spawned"].as_array().unwrap().len(), 1);
    let child_id = result["spawned"][0]["id"].as_str().unwrap();
    // Depth 2 children cannot spawn further
    let grandchild_tools = m.build_tools_for_agent(child_id, "Child", m.depth_of(child_id) < 2, m.depth_of(child_id));
    assert!(!grandchild_tools.iter().any(|t| t.spec.name == "spawn_agents"));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn list_agents_tool_reports_spawned() {
    let m = manager();
    m.spawn(
      &[crate::agent::manager::SpawnConfig {
        name: "Scout".into(),
        ..Default::default()
      }],
      0,
    )
    .unwrap();
    let tool = tool_named(&m.build_main_tools(), "list_agents");
    let result = tool.invoke(serde_json::json!({})).await.unwrap();
    assert_eq!(result["agents"].as_array().unwrap().len(), 1);
    assert_eq!(result["agents"][0]["name"], "Scout");
  }

  #[tokio::test(start_paused = true)]
  async fn wait_for_agents_times_out_on_busy_agent() {
    let m = SubagentManager::new(
      Arc::new(FakeProvider::new().with_delay(std::time::Duration::from_secs(3600))),
      MessageBus::new(),
      4,
      Vec::new(),
      None,
      None,
    );
    m.spawn(
      &[crate::agent::manager::SpawnConfig {
        name: "Slow".into(),
        task: Some("never finishes".into()),
        ..Default::default()
      }],
      0,
    )
    .unwrap();
    tokio::task::yield_now().await;

    let tool = tool_named(&m.build_main_tools(), "wait_for_agents");
    let result = tool
      .invoke(serde_json::json!({"agents": ["Slow"], "timeoutSecs": 5}))
      .await
      .unwrap();
    assert_eq!(result["done"], serde_json::json!(false));
    assert_eq!(result["timedOut"], serde_json::json!(true));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn wait_for_agents_returns_when_idle() {
    let m = manager();
    m.spawn(
      &[crate::agent::manager::SpawnConfig {
        name: "Quick".into(),
        ..Default::default()
      }],
      0,
    )
    .unwrap();
    let tool = tool_named(&m.build_main_tools(), "wait_for_agents");
    let result = tool
      .invoke(serde_json::json!({"agents": ["*"]}))
      .await
      .unwrap();
    assert_eq!(result["done"], serde_json::json!(true));
  }
}
