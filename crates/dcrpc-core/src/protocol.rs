//! JSON-RPC message types exchanged with the engine.
//!
//! Requests carry positional `params`; the engine answers with exactly one of
//! `result` or `error`. Messages without an `id` are notifications.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// Outgoing call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    pub id: u64,
}

/// Error payload of a failed call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: u64,
}

/// Message without an id. Sent by the engine for events, or by the client
/// for fire-and-forget calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl ErrorObject {
    pub fn method_not_found(method: &str) -> Self {
        Self::application_error(-32601, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::application_error(-32602, message)
    }

    pub fn application_error(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params,
            id,
        }
    }
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: u64, error: ErrorObject) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params,
        }
    }
}

/// What a response resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(ErrorObject),
    /// The response had a usable id but its body broke the wire format.
    Invalid(String),
}

/// Classification of one decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response { id: u64, outcome: Outcome },
    Notification(Notification),
    /// A call initiated by the engine. The client does not serve any.
    Request { id: Value, method: String },
    Invalid(String),
}

impl Incoming {
    /// Sorts a frame into response, notification or protocol violation.
    pub fn classify(message: Value) -> Self {
        let mut obj = match message {
            Value::Object(obj) => obj,
            other => {
                return Incoming::Invalid(format!(
                    "frame is not a JSON object: {}",
                    kind_of(&other)
                ))
            }
        };

        let id = obj.remove("id").filter(|id| !id.is_null());
        let method = match obj.remove("method") {
            Some(Value::String(method)) => Some(method),
            Some(other) => {
                return Incoming::Invalid(format!("method is not a string: {}", kind_of(&other)))
            }
            None => None,
        };

        match (id, method) {
            (Some(id), Some(method)) => Incoming::Request { id, method },
            (Some(id), None) => match id.as_u64() {
                Some(id) => Incoming::Response {
                    id,
                    outcome: response_outcome(&mut obj),
                },
                None => Incoming::Invalid(format!("response id is not an unsigned integer: {}", id)),
            },
            (None, Some(method)) => Incoming::Notification(Notification::new(
                method,
                obj.remove("params").unwrap_or(Value::Null),
            )),
            (None, None) => Incoming::Invalid("message has neither id nor method".to_string()),
        }
    }
}

fn response_outcome(obj: &mut Map<String, Value>) -> Outcome {
    match obj.remove("error").filter(|e| !e.is_null()) {
        Some(error) => match serde_json::from_value::<ErrorObject>(error) {
            Ok(error) => Outcome::Error(error),
            Err(e) => Outcome::Invalid(format!("malformed error object: {}", e)),
        },
        None => match obj.remove("result") {
            Some(result) => Outcome::Result(result),
            None => Outcome::Invalid("response carries neither result nor error".to_string()),
        },
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
