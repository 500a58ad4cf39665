use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Task lifecycle stage, mapped 1:1 to a `## <Section>` of the tasks file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
  Inbox,
  Todo,
  Refinement,
  InProgress,
  Done,
}

impl TaskStatus {
  /// Fixed serialization order of the sections.
  pub const ALL: [TaskStatus; 5] = [
    TaskStatus::Inbox,
    TaskStatus::Todo,
    TaskStatus::Refinement,
    TaskStatus::InProgress,
    TaskStatus::Done,
  ];

  pub fn section_title(&self) -> &'static str {
    match self {
      TaskStatus::Inbox => "Inbox",
      TaskStatus::Todo => "Todo",
      TaskStatus::Refinement => "Refinement",
      TaskStatus::InProgress => "In Progress",
      TaskStatus::Done => "Done",
    }
  }

  fn from_section(title: &str) -> Option<Self> {
    let t = title.trim().to_ascii_lowercase();
    match t.as_str() {
      "inbox" => Some(TaskStatus::Inbox),
      "todo" => Some(TaskStatus::Todo),
      "refinement" => Some(TaskStatus::Refinement),
      "in progress" => Some(TaskStatus::InProgress),
      "done" => Some(TaskStatus::Done),
      _ => None,
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.section_title())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: String,
  pub text: String,
  pub status: TaskStatus,
  pub done: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subagent_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<String>,
}

impl Task {
  pub fn new(text: impl Into<String>, status: TaskStatus) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      text: text.into(),
      status,
      done: status == TaskStatus::Done,
      subagent_id: None,
      result: None,
    }
  }
}

fn agent_comment_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"<!--\s*agent:([^\s>]+)\s*-->").expect("valid regex"))
}

fn id_comment_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"<!--\s*id:([^\s>]+)\s*-->").expect("valid regex"))
}

/// Parse a tasks markdown file. Unrecognized sections are preserved as
/// inbox; items without an `id:` comment are assigned a fresh uuid so a
/// following save pins them down.
pub fn parse_tasks(content: &str) -> Vec<Task> {
  let mut tasks: Vec<Task> = Vec::new();
  let mut section = TaskStatus::Inbox;

  for line in content.lines() {
    if let Some(title) = line.strip_prefix("## ") {
      section = TaskStatus::from_section(title).unwrap_or(TaskStatus::Inbox);
      continue;
    }
    let trimmed_start = line.trim_start();
    let (done, rest) = if let Some(r) = trimmed_start.strip_prefix("- [ ] ") {
      (false, r)
    } else if let Some(r) = trimmed_start.strip_prefix("- [x] ") {
      (true, r)
    } else if let Some(r) = trimmed_start.strip_prefix("> ")
      && line.starts_with(' ')
    {
      // Result block line attached to the previous item
      if let Some(last) = tasks.last_mut() {
        match &mut last.result {
          Some(existing) => {
            existing.push('\n');
            existing.push_str(r);
          }
          None => last.result = Some(r.to_string()),
        }
      }
      continue;
    } else {
      continue;
    };

    let subagent_id = agent_comment_regex()
      .captures(rest)
      .map(|c| c[1].to_string());
    let id = id_comment_regex().captures(rest).map(|c| c[1].to_string());
    let mut text = agent_comment_regex().replace_all(rest, "").to_string();
    text = id_comment_regex().replace_all(&text, "").to_string();

    tasks.push(Task {
      id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
      text: text.trim().to_string(),
      status: section,
      done,
      subagent_id,
      result: None,
    });
  }

  tasks
}

/// Deterministic serialization: fixed section order, tasks in original
/// order within each section, result blocks as `  > ` lines.
pub fn serialize_tasks(tasks: &[Task]) -> String {
  let mut out = String::from("# Tasks\n");
  for status in TaskStatus::ALL {
    out.push('\n');
    out.push_str("## ");
    out.push_str(status.section_title());
    out.push('\n');
    for task in tasks.iter().filter(|t| t.status == status) {
      out.push_str(if task.done { "- [x] " } else { "- [ ] " });
      out.push_str(&task.text);
      if let Some(agent) = &task.subagent_id {
        out.push_str(&format!(" <!-- agent:{agent} -->"));
      }
      out.push_str(&format!(" <!-- id:{} -->", task.id));
      out.push('\n');
      if let Some(result) = &task.result {
        for line in result.lines() {
          out.push_str("  > ");
          out.push_str(line);
          out.push('\n');
        }
      }
    }
  }
  out
}
