use crate::daemon::Router;
use crate::rpc::RpcError;

/// `heartbeat.*` — scheduled-tick control.
pub(in crate::daemon) fn register(router: &mut Router) {
  router.register("heartbeat.status", &[], false, |state, _p| async move {
    Ok(
      serde_json::to_value(state.heartbeat.status())
        .map_err(|e| RpcError::internal(e.to_string()))?,
    )
  });

  router.register("heartbeat.setEnabled", &["enabled"], false, |state, p| async move {
    let enabled: bool = p.get("enabled")?;
    Ok(
      serde_json::to_value(state.heartbeat.set_enabled(enabled))
        .map_err(|e| RpcError::internal(e.to_string()))?,
    )
  });

  router.register(
    "heartbeat.setInterval",
    &["intervalSecs"],
    false,
    |state, p| async move {
      let interval_secs: u64 = p.get("intervalSecs")?;
      Ok(
        serde_json::to_value(state.heartbeat.set_interval(interval_secs))
          .map_err(|e| RpcError::internal(e.to_string()))?,
      )
    },
  );
}
