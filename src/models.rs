//! Wire models for both sides of the relay.
//!
//! Host messages arrive as loosely shaped JSON objects from the browser
//! extension; they are classified once into [`HostMessage`] so dispatch can
//! match on the variant instead of probing fields. Subprocess lines are
//! classified the same way into [`ServerMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC "method not found" error code.
pub const METHOD_NOT_FOUND: i32 = -32601;

/// Caller-supplied identifier. Opaque: echoed back exactly as received.
pub type ExternalId = Value;

// =============================================================================
// Host Channel
// =============================================================================

/// Host payload before classification.
#[derive(Debug, Default, Deserialize)]
struct RawHostMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    action: Option<Value>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    response: Option<Value>,
}

/// A classified message from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    /// Liveness probe (`"action": "ping"`).
    Ping { id: ExternalId },
    /// The host answering something itself (`id` plus non-null `response`).
    Reply { id: ExternalId, response: Value },
    /// An action request to route through the catalog.
    Action {
        id: ExternalId,
        action: String,
        params: Option<Value>,
    },
    /// Neither an action nor a reply. Dropped without answering so two
    /// relays can never bounce messages at each other.
    Unroutable { id: Option<ExternalId> },
}

impl HostMessage {
    /// Decode and classify a host payload.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Parse`] if the payload is not a JSON object.
    pub fn from_slice(payload: &[u8]) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_slice(payload)?;
        if !value.is_object() {
            return Err(RelayError::Parse(format!(
                "expected a JSON object, got {}",
                json_type_name(&value)
            )));
        }
        let raw: RawHostMessage = serde_json::from_value(value)?;
        Ok(Self::classify(raw))
    }

    fn classify(raw: RawHostMessage) -> Self {
        let action = raw.action.and_then(|a| match a {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        });

        if action.as_deref() == Some("ping") {
            return HostMessage::Ping {
                id: raw.id.unwrap_or(Value::Null),
            };
        }

        if let (Some(id), Some(response)) = (raw.id.clone(), raw.response) {
            return HostMessage::Reply { id, response };
        }

        match action {
            Some(action) => HostMessage::Action {
                id: raw.id.unwrap_or(Value::Null),
                action,
                params: raw.params,
            },
            None => HostMessage::Unroutable { id: raw.id },
        }
    }

    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            HostMessage::Ping { .. } => "ping",
            HostMessage::Reply { .. } => "reply",
            HostMessage::Action { .. } => "action",
            HostMessage::Unroutable { .. } => "unroutable",
        }
    }
}

/// A message written to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HostReply {
    /// `{"id": ..., "response": ...}`
    Response { id: ExternalId, response: Value },
    /// `{"id": ..., "error": "..."}`
    Error { id: ExternalId, error: String },
    /// Unsolicited notice, e.g. `{"type": "ready", "message": "..."}`
    Notice {
        #[serde(rename = "type")]
        kind: String,
        message: String,
    },
}

impl HostReply {
    pub fn response(id: ExternalId, response: Value) -> Self {
        HostReply::Response { id, response }
    }

    pub fn error(id: ExternalId, error: impl Into<String>) -> Self {
        HostReply::Error {
            id,
            error: error.into(),
        }
    }

    /// The startup notice telling the extension the bridge is up.
    pub fn ready(message: impl Into<String>) -> Self {
        HostReply::Notice {
            kind: "ready".to_string(),
            message: message.into(),
        }
    }

    /// Caller id this reply answers, if any.
    pub fn id(&self) -> Option<&ExternalId> {
        match self {
            HostReply::Response { id, .. } | HostReply::Error { id, .. } => Some(id),
            HostReply::Notice { .. } => None,
        }
    }
}

// =============================================================================
// Subprocess Channel (JSON-RPC 2.0)
// =============================================================================

/// Outgoing JSON-RPC request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(id),
        }
    }

    /// A notification carries no id and expects no reply.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outgoing JSON-RPC response (the relay answering the subprocess).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Subprocess line before classification.
#[derive(Debug, Deserialize)]
struct RawServerMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// A classified message from the subprocess.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Reply to one of our requests. `Err` holds a displayable error message.
    Response {
        id: Value,
        outcome: Result<Value, String>,
    },
    /// The server asking us something.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl ServerMessage {
    /// Parse and classify one JSON-RPC line.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Parse`] if the line is not JSON, not an object,
    /// or carries neither a method nor an id.
    pub fn parse(line: &str) -> Result<Self, RelayError> {
        let raw: RawServerMessage = serde_json::from_str(line)?;

        if let Some(method) = raw.method {
            return Ok(match raw.id {
                Some(id) => ServerMessage::Request {
                    id,
                    method,
                    params: raw.params,
                },
                None => ServerMessage::Notification {
                    method,
                    params: raw.params,
                },
            });
        }

        let id = raw
            .id
            .ok_or_else(|| RelayError::Parse("message has neither method nor id".to_string()))?;

        // A `"result": null` deserializes to None, which is still a success.
        let outcome = match raw.error {
            Some(error) => Err(error_text(&error)),
            None => Ok(raw.result.unwrap_or(Value::Null)),
        };
        Ok(ServerMessage::Response { id, outcome })
    }

    /// The relay-issued id a response refers to. Ids we never issue (strings,
    /// negatives) cannot correlate.
    pub fn internal_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Response { id, .. } => id.as_u64(),
            _ => None,
        }
    }
}

/// Human-readable text for a JSON-RPC error value.
fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => error.to_string(),
        },
        Value::Null => "Unknown error".to_string(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
