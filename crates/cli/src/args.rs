use std::path::PathBuf;

use clap::{Args as ClapArgs, CommandFactory, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about = "tau daemon CLI", long_about = None, bin_name = "tau")]
pub struct Cli {
  #[command(subcommand)]
  pub command: Option<Commands>,
}

impl Cli {
  pub fn print_help_and_exit() {
    let mut cmd = Cli::command();
    let _ = cmd.print_help();
    println!();
  }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
  /// Daemon related commands
  Daemon(DaemonArgs),
  /// Show daemon health
  Status,
}

#[derive(Debug, ClapArgs)]
pub struct DaemonArgs {
  #[command(subcommand)]
  pub command: DaemonSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum DaemonSubcommand {
  /// Run the daemon in the foreground
  Run(RunArgs),
  /// Start the daemon in the background
  Start,
  /// Stop the running daemon
  Stop,
  /// Show whether the daemon is running
  Status,
  /// Stop then start the daemon
  Restart,
}

#[derive(Debug, ClapArgs, Default)]
pub struct RunArgs {
  /// Override the socket path
  #[arg(long)]
  pub socket_path: Option<PathBuf>,
  /// Workspace the agent operates on (defaults to the current directory)
  #[arg(long)]
  pub workspace: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::Parser;
  use pretty_assertions::assert_eq;

  #[test]
  fn parses_daemon_run_with_overrides() {
    let cli = Cli::parse_from([
      "tau",
      "daemon",
      "run",
      "--socket-path",
      "/tmp/x.sock",
      "--workspace",
      "/work",
    ]);
    let Some(Commands::Daemon(daemon)) = cli.command else {
      panic!("expected daemon subcommand");
    };
    let DaemonSubcommand::Run(run) = daemon.command else {
      panic!("expected run");
    };
    assert_eq!(run.socket_path, Some(PathBuf::from("/tmp/x.sock")));
    assert_eq!(run.workspace, Some(PathBuf::from("/work")));
  }

  #[test]
  fn parses_status_verbs() {
    let cli = Cli::parse_from(["tau", "status"]);
    assert!(matches!(cli.command, Some(Commands::Status)));

    let cli = Cli::parse_from(["tau", "daemon", "stop"]);
    let Some(Commands::Daemon(daemon)) = cli.command else {
      panic!("expected daemon subcommand");
    };
    assert!(matches!(daemon.command, DaemonSubcommand::Stop));
  }
}
