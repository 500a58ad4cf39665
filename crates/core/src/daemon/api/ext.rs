use serde_json::{Value, json};

use crate::daemon::Router;
use crate::rpc::RpcError;

/// `ext.*` — extension host surface. "No extension provides tool X" and
/// call timeouts are recoverable `{error}` results.
pub(in crate::daemon) fn register(router: &mut Router) {
  router.register("ext.list", &[], false, |state, _p| async move {
    Ok(
      serde_json::to_value(state.extensions.list())
        .map_err(|e| RpcError::internal(e.to_string()))?,
    )
  });

  router.register("ext.call", &["tool", "params"], false, |state, p| async move {
    let tool: String = p.get("tool")?;
    let params = p.opt::<Value>("params")?.unwrap_or(json!({}));
    match state.extensions.call_tool(&tool, params).await {
      Ok(result) => Ok(json!({ "result": result })),
      Err(e) => Ok(json!({ "error": e })),
    }
  });

  router.register("ext.reload", &["id"], false, |state, p| async move {
    let id: String = p.get("id")?;
    let source = state
      .extensions
      .list()
      .into_iter()
      .find(|r| r.id == id)
      .map(|r| r.source);
    match source {
      Some(source) => {
        state.extensions.reload(&source).await;
        Ok(json!({ "ok": true }))
      }
      None => Ok(json!({ "error": format!("unknown extension `{id}`") })),
    }
  });
}
