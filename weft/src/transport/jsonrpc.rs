//! JSON-RPC 2.0 message types for the MCP wire protocol.
//!
//! All three transports frame the same messages; request ids are
//! monotonically increasing integers assigned per connection. Incoming
//! traffic is parsed into [`JsonRpcMessage`], a sum type covering server
//! results, server-initiated requests (e.g. `roots/list`) and notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

fn version() -> String {
    JSONRPC_VERSION.to_string()
}

/// JSON-RPC id: integer for ids we assign; string tolerated from servers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Int(i64),
    Str(String),
}

impl MessageId {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Str(s) => s.parse().ok(),
        }
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(default = "version")]
    pub jsonrpc: String,
    pub id: MessageId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RequestMessage {
    pub fn new(id: i64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: version(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationMessage {
    #[serde(default = "version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl NotificationMessage {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: version(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
}

/// A response: `result` or `error`, keyed by the request id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default = "version")]
    pub jsonrpc: String,
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl ResultMessage {
    pub fn success(id: impl Into<MessageId>, result: Value) -> Self {
        Self {
            jsonrpc: version(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<MessageId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: version(),
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// Any incoming JSON-RPC message. Variant order matters for untagged
/// deserialization: a request has `id` + `method`, a result has `id` without
/// `method`, a notification has `method` without `id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(RequestMessage),
    Result(ResultMessage),
    Notification(NotificationMessage),
}
