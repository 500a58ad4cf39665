use std::path::PathBuf;
use std::time::Duration;

use yansi::Paint;

use crate::args::RunArgs;
use crate::rpc::client;
use crate::util::daemon_proc::{self, Target};

/// One current-thread runtime per command invocation; everything a verb
/// does happens inside a single `block_on`.
fn runtime() -> tokio::runtime::Runtime {
  tokio::runtime::Builder::new_current_thread()
    .enable_io()
    .enable_time()
    .build()
    .expect("tokio runtime")
}

/// How long the verbs wait for an up/down transition, from config.
fn wait_budget() -> Duration {
  let workspace = std::env::current_dir().ok();
  let cfg = tau_core::config::load(workspace.as_deref()).unwrap_or_default();
  Duration::from_millis(cfg.daemon_wait_ms)
}

fn print_stopped() {
  println!("daemon: {}", "stopped".red());
}

pub fn print_status() {
  let Some(sock) = daemon_proc::resolve_socket() else {
    print_stopped();
    return;
  };
  match runtime().block_on(client::daemon_status(&sock)) {
    Ok(status) => {
      println!(
        "daemon: {} (v{}, pid {}, socket {})",
        "running".green(),
        status.version,
        status.pid,
        status.socket_path
      );
    }
    Err(_) => print_stopped(),
  }
}

pub fn print_health() {
  let Some(sock) = daemon_proc::resolve_socket() else {
    print_stopped();
    return;
  };
  match runtime().block_on(client::daemon_health(&sock)) {
    Ok(health) => {
      println!(
        "daemon: {} (pid {}, up {}s, {} client(s), seq {}, agent {})",
        "running".green(),
        health.pid,
        health.uptime_secs,
        health.clients,
        health.seq,
        if health.ready { "ready".green() } else { "starting".yellow() },
      );
    }
    Err(_) => print_stopped(),
  }
}

pub fn run_daemon_foreground(args: RunArgs) {
  let paths = match tau_core::config::TauPaths::resolve() {
    Ok(p) => p,
    Err(e) => {
      eprintln!("could not resolve tau home: {e}");
      std::process::exit(1);
    }
  };
  let sock = args.socket_path.unwrap_or_else(|| paths.socket_path());
  let workspace = args
    .workspace
    .or_else(|| std::env::current_dir().ok())
    .unwrap_or_else(|| PathBuf::from("."));
  let config = tau_core::config::load(Some(&workspace)).unwrap_or_default();

  let rt = tokio::runtime::Builder::new_multi_thread()
    .enable_io()
    .enable_time()
    .worker_threads(2)
    .build()
    .expect("tokio runtime");
  rt.block_on(async move {
    let options = tau_core::daemon::DaemonOptions {
      socket_path: sock,
      workspace,
      paths,
      config,
    };
    match tau_core::daemon::start(options).await {
      Ok(handle) => {
        handle.wait().await;
      }
      Err(e) => {
        eprintln!("failed to start daemon: {e}");
        std::process::exit(1);
      }
    }
  });
}

enum StartOutcome {
  AlreadyRunning,
  Started,
  SpawnFailed(std::io::Error),
  /// The child exited before the socket ever answered.
  DiedEarly(std::process::ExitStatus),
  TimedOut,
}

pub fn start_daemon() {
  let Some(paths) = daemon_proc::resolve_paths() else {
    print_stopped();
    return;
  };
  let sock = paths.socket_path();
  let budget = wait_budget();
  let workspace = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

  let outcome = runtime().block_on(async {
    if daemon_proc::await_daemon(&sock, &paths, Target::Up, Duration::ZERO).await {
      return StartOutcome::AlreadyRunning;
    }
    let mut child = match daemon_proc::spawn_daemon_background(&sock, &workspace, &paths) {
      Ok(child) => child,
      Err(e) => return StartOutcome::SpawnFailed(e),
    };

    // Probe with backoff, but bail the moment the child dies instead of
    // burning the rest of the budget.
    let deadline = tokio::time::Instant::now() + budget;
    let mut pause = Duration::from_millis(25);
    loop {
      if daemon_proc::probe(&sock).await {
        return StartOutcome::Started;
      }
      if let Ok(Some(status)) = child.try_wait() {
        return StartOutcome::DiedEarly(status);
      }
      if tokio::time::Instant::now() >= deadline {
        return StartOutcome::TimedOut;
      }
      tokio::time::sleep(pause).await;
      pause = (pause * 2).min(Duration::from_millis(400));
    }
  });

  match outcome {
    StartOutcome::AlreadyRunning | StartOutcome::Started => print_status(),
    StartOutcome::SpawnFailed(e) => {
      eprintln!("could not launch the daemon: {e}");
      print_stopped();
    }
    StartOutcome::DiedEarly(status) => {
      eprintln!(
        "daemon exited during startup ({status}); see {}",
        paths.daemon_dir().join("daemon.err").display()
      );
      print_stopped();
    }
    StartOutcome::TimedOut => {
      eprintln!("daemon did not answer within {}ms", budget.as_millis());
      print_stopped();
    }
  }
}

pub fn stop_daemon() {
  let Some(paths) = daemon_proc::resolve_paths() else {
    print_stopped();
    return;
  };
  let sock = paths.socket_path();
  let budget = wait_budget();

  let stopped = runtime().block_on(async {
    if !daemon_proc::probe(&sock).await {
      // Nothing answering; just sweep leftovers
      return daemon_proc::await_daemon(&sock, &paths, Target::Down, Duration::ZERO).await;
    }
    let _ = client::daemon_shutdown(&sock).await;
    daemon_proc::await_daemon(&sock, &paths, Target::Down, budget).await
  });

  if stopped {
    print_stopped();
  } else {
    println!("daemon: {}", "still running".yellow());
  }
}

pub fn restart_daemon() {
  stop_daemon();
  start_daemon();
}
