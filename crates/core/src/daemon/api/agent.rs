use serde_json::json;

use crate::agent::PromptOutcome;
use crate::daemon::Router;
use crate::rpc::RpcError;
use crate::texts;

fn outcome_label(outcome: PromptOutcome) -> &'static str {
  match outcome {
    PromptOutcome::Started => "started",
    PromptOutcome::Steered => "steered",
  }
}

/// `agent.*`, `session.*`, `model.*`, `thinking.*` — the main session
/// surface.
pub(in crate::daemon) fn register(router: &mut Router) {
  router.register("agent.prompt", &["text", "silent"], true, |state, p| async move {
    let text: String = p.get("text")?;
    let silent = p.opt::<bool>("silent")?.unwrap_or(false);
    let outcome = if silent {
      state.host.prompt_main_silent(&text)
    } else {
      state.host.prompt_main(&text)
    }
    .map_err(|_| RpcError::agent_not_ready())?;
    Ok(json!({ "outcome": outcome_label(outcome) }))
  });

  router.register("agent.abort", &[], true, |state, _p| async move {
    state
      .host
      .abort_main()
      .map_err(|_| RpcError::agent_not_ready())?;
    Ok(json!({ "ok": true }))
  });

  router.register("agent.status", &[], true, |state, _p| async move {
    let session = state
      .host
      .main_session()
      .map_err(|_| RpcError::agent_not_ready())?;
    Ok(serde_json::to_value(session.status()).map_err(|e| RpcError::internal(e.to_string()))?)
  });

  router.register("agent.history", &[], true, |state, _p| async move {
    let session = state
      .host
      .main_session()
      .map_err(|_| RpcError::agent_not_ready())?;
    Ok(serde_json::to_value(session.history()).map_err(|e| RpcError::internal(e.to_string()))?)
  });

  router.register("agent.summarize", &[], true, |state, _p| async move {
    state
      .host
      .prompt_main_silent(texts::SUMMARIZE_PROMPT)
      .map_err(|_| RpcError::agent_not_ready())?;
    Ok(json!({ "ok": true }))
  });

  router.register("session.status", &[], false, |state, _p| async move {
    Ok(json!({
      "ready": matches!(state.host.ready_state(), crate::agent::ReadyState::Ready),
      "workspace": state.host.workspace().map(|p| p.display().to_string()),
    }))
  });

  router.register("session.history", &[], true, |state, _p| async move {
    let session = state
      .host
      .main_session()
      .map_err(|_| RpcError::agent_not_ready())?;
    Ok(serde_json::to_value(session.history()).map_err(|e| RpcError::internal(e.to_string()))?)
  });

  // Re-create the agent stack for the current (or a new) workspace.
  router.register("session.reset", &["workspace"], false, |state, p| async move {
    let workspace: Option<String> = p.opt("workspace")?;
    let target = workspace
      .map(std::path::PathBuf::from)
      .unwrap_or_else(|| state.workspace.clone());
    state
      .host
      .setup_agent(&target)
      .await
      .map_err(|e| RpcError::internal(e.to_string()))?;
    Ok(json!({ "ok": true, "workspace": target.display().to_string() }))
  });

  router.register("model.get", &[], true, |state, _p| async move {
    let session = state
      .host
      .main_session()
      .map_err(|_| RpcError::agent_not_ready())?;
    Ok(json!({ "model": session.model() }))
  });

  router.register("model.set", &["model"], true, |state, p| async move {
    let model: Option<String> = p.opt("model")?;
    let session = state
      .host
      .main_session()
      .map_err(|_| RpcError::agent_not_ready())?;
    session.set_model(model.clone());
    Ok(json!({ "model": model }))
  });

  router.register("thinking.get", &[], true, |state, _p| async move {
    let session = state
      .host
      .main_session()
      .map_err(|_| RpcError::agent_not_ready())?;
    Ok(json!({ "thinking": session.thinking() }))
  });

  router.register("thinking.set", &["thinking"], true, |state, p| async move {
    let thinking: Option<String> = p.opt("thinking")?;
    let session = state
      .host
      .main_session()
      .map_err(|_| RpcError::agent_not_ready())?;
    session.set_thinking(thinking.clone());
    Ok(json!({ "thinking": thinking }))
  });
}
