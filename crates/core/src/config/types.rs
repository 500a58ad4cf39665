use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Log level for the daemon and CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Off,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

/// Which LLM provider backs agent sessions.
/// `fake` is the scripted provider used until a real SDK adapter is linked;
/// it is also what the integration tests run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
  #[default]
  Fake,
}

/// Extension sandbox configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionConfig {
  /// Command prefix used to run an extension worker, e.g.
  /// ["node", "--max-old-space-size=128"]. The extension file path is
  /// appended as the last argument.
  pub runtime: Vec<String>,
}

impl Default for ExtensionConfig {
  fn default() -> Self {
    Self {
      runtime: vec!["node".to_string(), "--max-old-space-size=128".to_string()],
    }
  }
}

/// Effective configuration after merging defaults, global, and project config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
  pub log_level: LogLevel,
  pub provider: ProviderKind,
  /// Model hint forwarded to the provider (None means provider default)
  #[serde(default)]
  pub model: Option<String>,
  /// Thinking level hint forwarded to the provider
  #[serde(default)]
  pub thinking: Option<String>,
  /// Hard cap on live subagent sessions (defaults to 10)
  pub max_subagents: usize,
  /// File lock timeout in seconds (defaults to 60)
  pub lock_timeout_secs: u64,
  /// Default scheduled heartbeat interval in seconds (min 60)
  pub heartbeat_interval_secs: u64,
  /// How long CLI verbs wait for the daemon to come up or go down, in
  /// milliseconds (defaults to 3000)
  pub daemon_wait_ms: u64,
  /// Extension sandbox settings
  pub extensions: ExtensionConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      log_level: LogLevel::Info,
      provider: ProviderKind::Fake,
      model: None,
      thinking: None,
      max_subagents: 10,
      lock_timeout_secs: 60,
      heartbeat_interval_secs: 1800,
      daemon_wait_ms: 3000,
      extensions: ExtensionConfig::default(),
    }
  }
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("io: {0}")]
  Io(#[from] std::io::Error),
  #[error("toml: {0}")]
  Toml(#[from] toml::de::Error),
  #[error("could not resolve a home directory")]
  NoHomeDir,
}

pub type Result<T> = std::result::Result<T, ConfigError>;
