use serde::Deserialize;
use serde_json::json;

use crate::daemon::Router;
use crate::gal::GalTask;
use crate::rpc::RpcError;

#[derive(Debug, Deserialize)]
struct SubmitTask {
  #[serde(default)]
  id: Option<String>,
  text: String,
}

/// `gal.*` — coordinator diagnostics and task submission.
pub(in crate::daemon) fn register(router: &mut Router) {
  router.register("gal.status", &[], true, |state, _p| async move {
    let gal = state.host.gal().map_err(|_| RpcError::agent_not_ready())?;
    Ok(gal.get_status())
  });

  router.register("gal.locks", &[], true, |state, _p| async move {
    let gal = state.host.gal().map_err(|_| RpcError::agent_not_ready())?;
    Ok(serde_json::to_value(gal.get_locks()).map_err(|e| RpcError::internal(e.to_string()))?)
  });

  router.register("gal.workers", &[], true, |state, _p| async move {
    let gal = state.host.gal().map_err(|_| RpcError::agent_not_ready())?;
    Ok(serde_json::to_value(gal.get_workers()).map_err(|e| RpcError::internal(e.to_string()))?)
  });

  router.register(
    "gal.submit",
    &["tasks", "context", "model", "thinking"],
    true,
    |state, p| async move {
      let submitted: Vec<SubmitTask> = p.get("tasks")?;
      let context: Option<String> = p.opt("context")?;
      let model: Option<String> = p.opt("model")?;
      let thinking: Option<String> = p.opt("thinking")?;
      let gal = state.host.gal().map_err(|_| RpcError::agent_not_ready())?;
      let gal_tasks: Vec<GalTask> = submitted
        .into_iter()
        .map(|t| GalTask {
          id: t.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
          text: t.text,
        })
        .collect();
      match gal
        .submit_tasks(&gal_tasks, context.as_deref(), model, thinking)
        .await
      {
        Ok(workers) => Ok(json!({
          "submitted": workers
            .iter()
            .map(|w| json!({
              "taskId": w.task_id,
              "subagentId": w.subagent_id,
              "name": w.name,
            }))
            .collect::<Vec<_>>()
        })),
        Err(e) => Ok(json!({ "error": e.to_string() })),
      }
    },
  );

  router.register("gal.revoke", &["path"], true, |state, p| async move {
    let path: String = p.get("path")?;
    let outcome = state.locks.revoke(std::path::Path::new(&path));
    Ok(json!({ "revoked": outcome.revoked, "holderId": outcome.holder_id }))
  });

  router.register("gal.enableSession", &[], true, |state, _p| async move {
    let gal = state.host.gal().map_err(|_| RpcError::agent_not_ready())?;
    Ok(json!({ "sessionId": gal.ensure_gal_session() }))
  });
}
