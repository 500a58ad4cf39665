use serde_json::json;

use crate::daemon::Router;
use crate::rpc::RpcError;

/// `git.*` — read-only repository views. A workspace that is not a git
/// repository is a recoverable `{error}`.
pub(in crate::daemon) fn register(router: &mut Router) {
  router.register("git.status", &[], true, |state, _p| async move {
    let git = state.host.git().map_err(|_| RpcError::agent_not_ready())?;
    match git.status() {
      Ok(status) => {
        Ok(serde_json::to_value(status).map_err(|e| RpcError::internal(e.to_string()))?)
      }
      Err(e) => Ok(json!({ "error": e.to_string() })),
    }
  });

  router.register("git.log", &["limit"], true, |state, p| async move {
    let limit = p.opt::<usize>("limit")?.unwrap_or(20);
    let git = state.host.git().map_err(|_| RpcError::agent_not_ready())?;
    match git.log(limit) {
      Ok(entries) => {
        Ok(serde_json::to_value(entries).map_err(|e| RpcError::internal(e.to_string()))?)
      }
      Err(e) => Ok(json!({ "error": e.to_string() })),
    }
  });
}
