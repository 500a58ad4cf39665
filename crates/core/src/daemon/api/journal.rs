use serde_json::json;

use crate::daemon::Router;
use crate::rpc::RpcError;

/// `journal.*` — watcher diagnostics.
pub(in crate::daemon) fn register(router: &mut Router) {
  router.register("journal.status", &[], false, |state, _p| async move {
    Ok::<_, RpcError>(json!({
      "dir": state.paths.journal_dir().display().to_string(),
      "watching": state.watchers_active(),
    }))
  });
}
