fn main() {
  // Initialize structured logging early
  let workspace = std::env::current_dir().ok();
  let cfg = tau_core::config::load(workspace.as_deref())
    .unwrap_or_else(|_| tau_core::config::Config::default());
  if let Ok(paths) = tau_core::config::TauPaths::resolve() {
    tau_core::logging::init(&paths.logs_path(), cfg.log_level);
  }

  cli::run();
}
