use serde_json::json;

use crate::agent::SpawnConfig;
use crate::daemon::Router;
use crate::rpc::RpcError;

/// `subagent.*` — spawn, views, prompting, teardown. Manager failures
/// (unknown agent, cap exceeded) are recoverable: they come back as
/// `{error}` values, not protocol errors.
pub(in crate::daemon) fn register(router: &mut Router) {
  router.register("subagent.spawn", &["agents"], true, |state, p| async move {
    let configs: Vec<SpawnConfig> = p.get("agents")?;
    let manager = state
      .host
      .manager()
      .map_err(|_| RpcError::agent_not_ready())?;
    match manager.spawn(&configs, 0) {
      Ok(infos) => {
        Ok(serde_json::to_value(infos).map_err(|e| RpcError::internal(e.to_string()))?)
      }
      Err(e) => Ok(json!({ "error": e.to_string() })),
    }
  });

  router.register("subagent.list", &[], true, |state, _p| async move {
    let manager = state
      .host
      .manager()
      .map_err(|_| RpcError::agent_not_ready())?;
    Ok(serde_json::to_value(manager.list_all()).map_err(|e| RpcError::internal(e.to_string()))?)
  });

  router.register("subagent.status", &["id"], true, |state, p| async move {
    let id: String = p.get("id")?;
    let manager = state
      .host
      .manager()
      .map_err(|_| RpcError::agent_not_ready())?;
    match manager.get_status(&id) {
      Ok(info) => Ok(serde_json::to_value(info).map_err(|e| RpcError::internal(e.to_string()))?),
      Err(e) => Ok(json!({ "error": e.to_string() })),
    }
  });

  router.register("subagent.history", &["id"], true, |state, p| async move {
    let id: String = p.get("id")?;
    let manager = state
      .host
      .manager()
      .map_err(|_| RpcError::agent_not_ready())?;
    match manager.get_history(&id) {
      Ok(history) => {
        Ok(serde_json::to_value(history).map_err(|e| RpcError::internal(e.to_string()))?)
      }
      Err(e) => Ok(json!({ "error": e.to_string() })),
    }
  });

  router.register("subagent.prompt", &["id", "text"], true, |state, p| async move {
    let id: String = p.get("id")?;
    let text: String = p.get("text")?;
    let manager = state
      .host
      .manager()
      .map_err(|_| RpcError::agent_not_ready())?;
    match manager.prompt(&id, &text) {
      Ok(_) => Ok(json!({ "ok": true })),
      Err(e) => Ok(json!({ "error": e.to_string() })),
    }
  });

  router.register("subagent.abort", &["id"], true, |state, p| async move {
    let id: String = p.get("id")?;
    let manager = state
      .host
      .manager()
      .map_err(|_| RpcError::agent_not_ready())?;
    match manager.abort(&id) {
      Ok(()) => Ok(json!({ "ok": true })),
      Err(e) => Ok(json!({ "error": e.to_string() })),
    }
  });

  router.register("subagent.close", &["id"], true, |state, p| async move {
    let id: String = p.get("id")?;
    let manager = state
      .host
      .manager()
      .map_err(|_| RpcError::agent_not_ready())?;
    match manager.close(&id) {
      Ok(()) => Ok(json!({ "ok": true })),
      Err(e) => Ok(json!({ "error": e.to_string() })),
    }
  });

  router.register(
    "subagent.message",
    &["to", "content", "from"],
    true,
    |state, p| async move {
      let to: String = p.get("to")?;
      let content: String = p.get("content")?;
      let from = p
        .opt::<String>("from")?
        .unwrap_or_else(|| crate::agent::MAIN_SESSION_ID.to_string());
      let manager = state
        .host
        .manager()
        .map_err(|_| RpcError::agent_not_ready())?;
      match manager.send_agent_message(&from, &to, &content) {
        Ok(ack) => Ok(json!({ "ok": true, "detail": ack })),
        Err(e) => Ok(json!({ "error": e.to_string() })),
      }
    },
  );
}
