mod load;
mod paths;
mod types;

pub use load::load;
pub use paths::{TauPaths, global_config_path, project_config_path, tasks_file_path};
pub use types::{Config, ConfigError, ExtensionConfig, LogLevel, ProviderKind, Result};
