use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::paths::{global_config_path, project_config_path};
use super::types::{Config, ExtensionConfig, LogLevel, ProviderKind, Result};

/// Load configuration by resolving the default global and project paths.
/// Project config overrides global; both override defaults.
pub fn load(workspace: Option<&Path>) -> Result<Config> {
  let mut cfg = Config::default();

  // Global
  if let Some(global_path) = global_config_path()
    && let Ok(s) = fs::read_to_string(&global_path)
  {
    let partial: PartialConfig = toml::from_str(&s)?;
    cfg = partial.merge_over(cfg);
  }

  // Project
  if let Some(root) = workspace {
    let project_path = project_config_path(root);
    if let Ok(s) = fs::read_to_string(&project_path) {
      let partial: PartialConfig = toml::from_str(&s)?;
      cfg = partial.merge_over(cfg);
    }
  }

  Ok(cfg)
}

/// Test helper: load configuration from explicit file paths (if present).
#[cfg(test)]
pub(crate) fn load_from_paths(global: Option<&Path>, project: Option<&Path>) -> Result<Config> {
  let mut cfg = Config::default();

  if let Some(g) = global
    && let Ok(s) = fs::read_to_string(g)
  {
    let partial: PartialConfig = toml::from_str(&s)?;
    cfg = partial.merge_over(cfg);
  }

  if let Some(p) = project
    && let Ok(s) = fs::read_to_string(p)
  {
    let partial: PartialConfig = toml::from_str(&s)?;
    cfg = partial.merge_over(cfg);
  }

  Ok(cfg)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
struct PartialExtensionConfig {
  pub runtime: Option<Vec<String>>,
}

impl PartialExtensionConfig {
  fn merge_over(self, base: ExtensionConfig) -> ExtensionConfig {
    ExtensionConfig {
      runtime: self.runtime.unwrap_or(base.runtime),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
struct PartialConfig {
  pub log_level: Option<LogLevel>,
  pub provider: Option<ProviderKind>,
  pub model: Option<String>,
  pub thinking: Option<String>,
  pub max_subagents: Option<usize>,
  pub lock_timeout_secs: Option<u64>,
  pub heartbeat_interval_secs: Option<u64>,
  pub daemon_wait_ms: Option<u64>,
  pub extensions: Option<PartialExtensionConfig>,
}

impl PartialConfig {
  fn merge_over(self, base: Config) -> Config {
    let PartialConfig {
      log_level,
      provider,
      model,
      thinking,
      max_subagents,
      lock_timeout_secs,
      heartbeat_interval_secs,
      daemon_wait_ms,
      extensions,
    } = self;

    let Config {
      log_level: base_log_level,
      provider: base_provider,
      model: base_model,
      thinking: base_thinking,
      max_subagents: base_max_subagents,
      lock_timeout_secs: base_lock_timeout_secs,
      heartbeat_interval_secs: base_heartbeat_interval_secs,
      daemon_wait_ms: base_daemon_wait_ms,
      extensions: base_extensions,
    } = base;

    Config {
      log_level: log_level.unwrap_or(base_log_level),
      provider: provider.unwrap_or(base_provider),
      model: model.or(base_model),
      thinking: thinking.or(base_thinking),
      max_subagents: max_subagents.unwrap_or(base_max_subagents),
      lock_timeout_secs: lock_timeout_secs.unwrap_or(base_lock_timeout_secs),
      heartbeat_interval_secs: heartbeat_interval_secs.unwrap_or(base_heartbeat_interval_secs),
      daemon_wait_ms: daemon_wait_ms.unwrap_or(base_daemon_wait_ms),
      extensions: extensions.unwrap_or_default().merge_over(base_extensions),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn project_overrides_global_overrides_defaults() {
    let td = tempfile::tempdir().unwrap();
    let global = td.path().join("global.toml");
    let project = td.path().join("project.toml");
    std::fs::write(&global, "log_level = \"debug\"\nlock_timeout_secs = 30\n").unwrap();
    std::fs::write(&project, "lock_timeout_secs = 5\nmax_subagents = 3\n").unwrap();

    let cfg = load_from_paths(Some(&global), Some(&project)).unwrap();
    assert_eq!(cfg.log_level, LogLevel::Debug);
    assert_eq!(cfg.lock_timeout_secs, 5);
    assert_eq!(cfg.max_subagents, 3);
    // Untouched values fall back to defaults
    assert_eq!(cfg.heartbeat_interval_secs, 1800);
    assert_eq!(cfg.daemon_wait_ms, 3000);
    assert_eq!(cfg.provider, ProviderKind::Fake);
  }

  #[test]
  fn missing_files_yield_defaults() {
    let cfg = load_from_paths(None, None).unwrap();
    assert_eq!(cfg, Config::default());
  }

  #[test]
  fn extension_runtime_override() {
    let td = tempfile::tempdir().unwrap();
    let project = td.path().join("project.toml");
    std::fs::write(&project, "[extensions]\nruntime = [\"deno\", \"run\"]\n").unwrap();
    let cfg = load_from_paths(None, Some(&project)).unwrap();
    assert_eq!(cfg.extensions.runtime, vec!["deno", "run"]);
  }
}
