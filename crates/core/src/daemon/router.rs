//! Static dispatch table mapping JSON-RPC method names to handlers.
//! Every method accepts both named-object and positional-array params;
//! handlers that touch the agent await the ready gate first.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::DaemonState;
use super::api;
use crate::rpc::{self, Notification, Params, Request, RpcError};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;
type Handler = Arc<dyn Fn(Arc<DaemonState>, Params) -> HandlerFuture + Send + Sync>;

struct MethodEntry {
  params: &'static [&'static str],
  needs_agent: bool,
  handler: Handler,
}

pub struct Router {
  methods: HashMap<&'static str, MethodEntry>,
}

impl Router {
  pub fn new() -> Self {
    let mut router = Self {
      methods: HashMap::new(),
    };
    api::daemon::register(&mut router);
    api::agent::register(&mut router);
    api::subagent::register(&mut router);
    api::tasks::register(&mut router);
    api::gal::register(&mut router);
    api::heartbeat::register(&mut router);
    api::ext::register(&mut router);
    api::git::register(&mut router);
    api::journal::register(&mut router);
    router
  }

  /// Register one method with its positional parameter names.
  pub fn register<F, Fut>(
    &mut self,
    name: &'static str,
    params: &'static [&'static str],
    needs_agent: bool,
    handler: F,
  ) where
    F: Fn(Arc<DaemonState>, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
  {
    let handler: Handler = Arc::new(move |state, params| Box::pin(handler(state, params)));
    let previous = self.methods.insert(
      name,
      MethodEntry {
        params,
        needs_agent,
        handler,
      },
    );
    debug_assert!(previous.is_none(), "duplicate method {name}");
  }

  pub fn method_names(&self) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = self.methods.keys().copied().collect();
    names.sort_unstable();
    names
  }

  /// Produce exactly one response for a request.
  pub async fn dispatch(&self, state: Arc<DaemonState>, request: Request) -> Value {
    let id = request.id.clone();
    match self.run(state, &request.method, request.params).await {
      Ok(result) => rpc::result_response(id, result),
      Err(error) => rpc::error_response(id, &error),
    }
  }

  /// Notifications are fire-and-forget; failures are logged only.
  pub async fn dispatch_notification(&self, state: Arc<DaemonState>, note: Notification) {
    if let Err(e) = self.run(state, &note.method, note.params).await {
      debug!(
        event = "notification_handler_failed",
        method = %note.method,
        code = e.code,
        error = %e.message,
        "notification handler failed"
      );
    }
  }

  async fn run(
    &self,
    state: Arc<DaemonState>,
    method: &str,
    raw_params: Option<Value>,
  ) -> Result<Value, RpcError> {
    if state.is_shutting_down() && !matches!(method, "daemon.shutdown" | "daemon.health") {
      return Err(RpcError::shutting_down());
    }
    let entry = self
      .methods
      .get(method)
      .ok_or_else(|| RpcError::method_not_found(method))?;
    let params = Params::coerce(entry.params, raw_params)?;
    if entry.needs_agent && state.host.await_ready().await.is_err() {
      return Err(RpcError::agent_not_ready());
    }
    let result = (entry.handler)(Arc::clone(&state), params).await;
    if let Err(e) = &result {
      warn!(
        event = "rpc_handler_error",
        method,
        code = e.code,
        error = %e.message,
        "handler returned error"
      );
    }
    result
  }
}

impl Default for Router {
  fn default() -> Self {
    Self::new()
  }
}
