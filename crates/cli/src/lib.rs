//! tau CLI: run and control the daemon over its Unix socket.

pub mod args;
pub mod commands;
pub mod rpc;
pub mod util;

use clap::Parser;

pub fn run() {
  if std::env::args_os().len() == 1 {
    args::Cli::print_help_and_exit();
    return;
  }

  let cli = args::Cli::parse();
  match cli.command {
    Some(args::Commands::Daemon(daemon)) => match daemon.command {
      args::DaemonSubcommand::Run(run_args) => {
        commands::daemon::run_daemon_foreground(run_args);
      }
      args::DaemonSubcommand::Start => {
        commands::daemon::start_daemon();
      }
      args::DaemonSubcommand::Stop => {
        commands::daemon::stop_daemon();
      }
      args::DaemonSubcommand::Status => {
        commands::daemon::print_status();
      }
      args::DaemonSubcommand::Restart => {
        commands::daemon::restart_daemon();
      }
    },
    Some(args::Commands::Status) => {
      commands::daemon::print_health();
    }
    None => {
      args::Cli::print_help_and_exit();
    }
  }
}
