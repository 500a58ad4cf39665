use serde_json::json;

use crate::daemon::Router;
use crate::rpc::RpcError;
use crate::tasks::Task;

/// `tasks.*` — the task file surface. Saves are funneled through the
/// store's lock, so two near-simultaneous client saves cannot interleave.
pub(in crate::daemon) fn register(router: &mut Router) {
  router.register("tasks.list", &[], false, |state, _p| async move {
    let tasks = state
      .tasks
      .load()
      .map_err(|e| RpcError::internal(e.to_string()))?;
    Ok(serde_json::to_value(tasks).map_err(|e| RpcError::internal(e.to_string()))?)
  });

  router.register("tasks.save", &["tasks"], false, |state, p| async move {
    let tasks: Vec<Task> = p.get("tasks")?;
    state
      .tasks
      .save(&tasks)
      .await
      .map_err(|e| RpcError::internal(e.to_string()))?;
    state.notifier.broadcast(
      "daemon.tasks.changed",
      serde_json::to_value(&tasks).unwrap_or(json!([])),
    );
    Ok(json!({ "ok": true, "count": tasks.len() }))
  });

  router.register("tasks.path", &[], false, |state, _p| async move {
    Ok(json!({ "path": state.tasks.path().display().to_string() }))
  });
}
