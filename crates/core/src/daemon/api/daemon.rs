use serde_json::json;
use tracing::info;

use crate::agent::ReadyState;
use crate::daemon::Router;
use crate::rpc::RpcError;

/// Register the daemon-only methods: health, status, ping, recover,
/// shutdown.
pub(in crate::daemon) fn register(router: &mut Router) {
  router.register("daemon.status", &[], false, |state, _p| async move {
    info!(event = "daemon_status", pid = std::process::id(), "status served");
    Ok(json!({
      "version": state.version,
      "pid": std::process::id(),
      "socketPath": state.socket_path.display().to_string(),
    }))
  });

  router.register("daemon.health", &[], false, |state, _p| async move {
    Ok(json!({
      "ok": true,
      "pid": std::process::id(),
      "uptimeSecs": state.uptime_secs(),
      "clients": state.registry.count(),
      "seq": state.notifier.current_seq(),
      "ready": state.host.ready_state() == ReadyState::Ready,
      "shuttingDown": state.is_shutting_down(),
    }))
  });

  router.register("daemon.ping", &[], false, |state, _p| async move {
    Ok(json!({ "pong": true, "seq": state.notifier.current_seq() }))
  });

  // Full state snapshot for clients reconnecting after a gap. Events are
  // not buffered per client; the flag tells the UI to re-sync instead.
  router.register("daemon.recover", &[], false, |state, _p| async move {
    let ready = state.host.ready_state() == ReadyState::Ready;
    let (history, subagents) = if ready {
      let history = state
        .host
        .main_session()
        .map(|s| serde_json::to_value(s.history()).unwrap_or(json!([])))
        .unwrap_or(json!([]));
      let subagents = state
        .host
        .manager()
        .map(|m| serde_json::to_value(m.list_all()).unwrap_or(json!([])))
        .unwrap_or(json!([]));
      (history, subagents)
    } else {
      (json!([]), json!([]))
    };
    let tasks = state
      .tasks
      .load()
      .map(|t| serde_json::to_value(t).unwrap_or(json!([])))
      .unwrap_or(json!([]));
    Ok(json!({
      "status": {
        "version": state.version,
        "uptimeSecs": state.uptime_secs(),
        "ready": ready,
        "seq": state.notifier.current_seq(),
      },
      "mainHistory": history,
      "subagents": subagents,
      "tasks": tasks,
      "bufferedEvents": [],
      "fullRecoveryRequired": true,
    }))
  });

  router.register("daemon.shutdown", &["reason"], false, |state, p| async move {
    let reason: Option<String> = p.opt("reason")?;
    state.begin_shutdown(reason.as_deref().unwrap_or("shutdown requested"));
    Ok::<_, RpcError>(json!({ "ok": true }))
  });
}
