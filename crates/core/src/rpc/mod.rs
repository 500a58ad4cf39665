pub mod wire;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};

/// JSON-RPC 2.0 error codes used on the wire.
pub mod codes {
  pub const PARSE_ERROR: i64 = -32700;
  pub const INVALID_REQUEST: i64 = -32600;
  pub const METHOD_NOT_FOUND: i64 = -32601;
  pub const INVALID_PARAMS: i64 = -32602;
  pub const INTERNAL_ERROR: i64 = -32603;
  pub const AGENT_NOT_READY: i64 = -32000;
  pub const SHUTTING_DOWN: i64 = -32001;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
  pub code: i64,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
}

impl RpcError {
  pub fn new(code: i64, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
      data: None,
    }
  }

  pub fn with_data(mut self, data: Value) -> Self {
    self.data = Some(data);
    self
  }

  pub fn parse_error() -> Self {
    Self::new(codes::PARSE_ERROR, "parse error")
  }

  pub fn invalid_request() -> Self {
    Self::new(codes::INVALID_REQUEST, "invalid request")
  }

  pub fn method_not_found(method: &str) -> Self {
    Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
  }

  pub fn invalid_params(detail: impl Into<String>) -> Self {
    Self::new(codes::INVALID_PARAMS, format!("invalid params: {}", detail.into()))
  }

  pub fn internal(detail: impl Into<String>) -> Self {
    Self::new(codes::INTERNAL_ERROR, detail.into())
  }

  pub fn agent_not_ready() -> Self {
    Self::new(codes::AGENT_NOT_READY, "agent not initialized")
  }

  pub fn shutting_down() -> Self {
    Self::new(codes::SHUTTING_DOWN, "daemon shutting down")
  }
}

/// A request carries an id and expects exactly one response.
#[derive(Debug, Clone)]
pub struct Request {
  pub id: Value,
  pub method: String,
  pub params: Option<Value>,
}

/// A notification has no id and is dispatched fire-and-forget.
#[derive(Debug, Clone)]
pub struct Notification {
  pub method: String,
  pub params: Option<Value>,
}

/// Classification of a decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Incoming {
  Request(Request),
  Notification(Notification),
  /// Structurally broken: answer -32600 when an id is present, drop otherwise.
  Invalid { id: Option<Value> },
}

/// Classify a decoded JSON value per the JSON-RPC 2.0 rules the daemon
/// enforces: `jsonrpc` must be exactly "2.0" and `method` a string.
pub fn parse_incoming(v: Value) -> Incoming {
  let Some(obj) = v.as_object() else {
    return Incoming::Invalid { id: None };
  };
  let id = obj.get("id").cloned().filter(|id| !id.is_null());
  let version_ok = obj.get("jsonrpc").and_then(Value::as_str) == Some("2.0");
  let method = obj.get("method").and_then(Value::as_str);
  match (version_ok, method) {
    (true, Some(m)) => {
      let params = obj.get("params").cloned().filter(|p| !p.is_null());
      match id {
        Some(id) => Incoming::Request(Request {
          id,
          method: m.to_string(),
          params,
        }),
        None => Incoming::Notification(Notification {
          method: m.to_string(),
          params,
        }),
      }
    }
    _ => Incoming::Invalid { id },
  }
}

pub fn result_response(id: Value, result: Value) -> Value {
  json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn error_response(id: Value, error: &RpcError) -> Value {
  let mut e = json!({ "code": error.code, "message": error.message });
  if let Some(data) = &error.data {
    e["data"] = data.clone();
  }
  json!({ "jsonrpc": "2.0", "id": id, "error": e })
}

pub fn notification(method: &str, params: Value) -> Value {
  json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

/// Request params after coercion. Every method accepts both a named-object
/// form and a positional-array form; arrays are zipped against the method's
/// declared parameter names.
#[derive(Debug, Clone)]
pub struct Params {
  map: Map<String, Value>,
}

impl Params {
  pub fn coerce(names: &[&str], raw: Option<Value>) -> Result<Self, RpcError> {
    let mut map = Map::new();
    match raw {
      None => {}
      Some(Value::Object(obj)) => map = obj,
      Some(Value::Array(items)) => {
        if items.len() > names.len() {
          return Err(RpcError::invalid_params(format!(
            "expected at most {} positional params, got {}",
            names.len(),
            items.len()
          )));
        }
        for (name, value) in names.iter().zip(items) {
          map.insert((*name).to_string(), value);
        }
      }
      Some(other) => {
        return Err(RpcError::invalid_params(format!(
          "params must be an object or array, got {}",
          type_name(&other)
        )));
      }
    }
    Ok(Self { map })
  }

  pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, RpcError> {
    let v = self
      .map
      .get(name)
      .cloned()
      .ok_or_else(|| RpcError::invalid_params(format!("missing `{name}`")))?;
    serde_json::from_value(v).map_err(|e| RpcError::invalid_params(format!("`{name}`: {e}")))
  }

  pub fn opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, RpcError> {
    match self.map.get(name) {
      None | Some(Value::Null) => Ok(None),
      Some(v) => serde_json::from_value(v.clone())
        .map(Some)
        .map_err(|e| RpcError::invalid_params(format!("`{name}`: {e}"))),
    }
  }
}

fn type_name(v: &Value) -> &'static str {
  match v {
    Value::Null => "null",
    Value::Bool(_) => "bool",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}
