//! MCP transport adapters: stdio subprocess, streamable HTTP, and SSE behind
//! one [`TransportConn`] trait.
//!
//! Each adapter performs the `initialize` / `notifications/initialized`
//! handshake on connect and then supports `tools/list` and `tools/call`.
//! `tools/list` replies are accepted both as a bare array and as an object
//! wrapping a `tools` field; `tools/call` replies are reduced to a string.
//! Adapters never retry: I/O errors are surfaced to the caller, and the pool
//! decides what to do with the connection.

mod http;
mod jsonrpc;
mod sse;
mod stdio;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{ServerSpec, TransportKind};

pub use http::HttpConn;
pub use jsonrpc::{
    ErrorObject, JsonRpcMessage, MessageId, NotificationMessage, RequestMessage, ResultMessage,
};
pub use sse::SseConn;
pub use stdio::StdioConn;

/// MCP protocol version sent during initialize.
pub(crate) const PROTOCOL_VERSION: &str = "2025-11-25";
/// Per-request wait for `tools/list` / `tools/call` round trips.
pub(crate) const CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// One tool as advertised by a server's `tools/list`.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    /// Opaque JSON schema describing the tool's arguments.
    pub input_schema: Value,
}

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("tool error: {0}")]
    Tool(String),
    #[error("connection closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// An open channel to one MCP server, able to issue request/response pairs.
///
/// **Interaction**: Owned by the [`ConnectionPool`](crate::pool::ConnectionPool)
/// and borrowed by the [`McpManager`](crate::manager::McpManager) for one
/// operation at a time.
#[async_trait]
pub trait TransportConn: Send + Sync {
    /// One `tools/list` round trip.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError>;

    /// One `tools/call` round trip, reduced to a string payload.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, TransportError>;

    /// Releases OS / network resources. Idempotent.
    async fn close(&self);
}

/// Opens a transport for the given spec. The connect timeout is the spec's
/// configured `timeout` (per-transport default otherwise).
pub async fn connect(spec: &ServerSpec) -> Result<Arc<dyn TransportConn>, TransportError> {
    match spec.transport {
        TransportKind::Stdio => Ok(Arc::new(StdioConn::connect(spec).await?)),
        TransportKind::Http => Ok(Arc::new(HttpConn::connect(spec).await?)),
        TransportKind::Sse => Ok(Arc::new(SseConn::connect(spec).await?)),
    }
}

/// Parses a `tools/list` result. Accepts `[...tools]` and `{tools: [...]}`.
pub(crate) fn parse_tools_result(
    result: ResultMessage,
) -> Result<Vec<ToolDescriptor>, TransportError> {
    if let Some(err) = result.error {
        return Err(TransportError::Rpc(err.message));
    }
    let value = result
        .result
        .ok_or_else(|| TransportError::Protocol("no result in tools/list response".into()))?;
    let tools_value = match value {
        Value::Array(_) => value,
        _ => value
            .get("tools")
            .cloned()
            .ok_or_else(|| TransportError::Protocol("no tools in response".into()))?,
    };
    let tools_array = tools_value
        .as_array()
        .ok_or_else(|| TransportError::Protocol("tools not an array".into()))?;
    let mut descriptors = Vec::with_capacity(tools_array.len());
    for item in tools_array {
        let obj = item
            .as_object()
            .ok_or_else(|| TransportError::Protocol("tool item not an object".into()))?;
        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let description = obj
            .get("description")
            .and_then(|v| v.as_str())
            .map(String::from);
        let input_schema = obj
            .get("inputSchema")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));
        descriptors.push(ToolDescriptor {
            name,
            description,
            input_schema,
        });
    }
    Ok(descriptors)
}

/// Reduces a `tools/call` result to a string: text content blocks joined by
/// newlines, `structuredContent` JSON as fallback, raw values stringified.
/// `isError: true` surfaces as [`TransportError::Tool`].
pub(crate) fn reduce_call_result(result: ResultMessage) -> Result<String, TransportError> {
    if let Some(err) = result.error {
        return Err(TransportError::Rpc(err.message));
    }
    let value = result
        .result
        .ok_or_else(|| TransportError::Protocol("no result in tools/call response".into()))?;
    if value
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        let msg = value
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|b| b.get("text").and_then(|t| t.as_str()))
            .unwrap_or("tool returned error")
            .to_string();
        return Err(TransportError::Tool(msg));
    }

    let mut text_parts = Vec::new();
    let has_content = match value.get("content").and_then(|c| c.as_array()) {
        Some(blocks) => {
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                    if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                        text_parts.push(t);
                    }
                }
            }
            true
        }
        None => false,
    };
    let text = text_parts.join("\n").trim().to_string();
    if !text.is_empty() {
        return Ok(text);
    }
    if let Some(structured) = value.get("structuredContent") {
        return Ok(serde_json::to_string(structured).unwrap_or_default());
    }
    if !has_content {
        // Raw value reply: a plain string, or any other JSON stringified.
        return Ok(match value {
            Value::String(s) => s,
            other => other.to_string(),
        });
    }
    Err(TransportError::Protocol(
        "no text or structuredContent in tools/call response".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_tools_result_maps_fields() {
        let result = ResultMessage::success(
            1,
            json!({
                "tools": [
                    {
                        "name": "read_file",
                        "description": "Read file content",
                        "inputSchema": {"type":"object","properties":{"path":{"type":"string"}}}
                    }
                ]
            }),
        );
        let tools = parse_tools_result(result).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "read_file");
        assert_eq!(tools[0].description.as_deref(), Some("Read file content"));
        assert_eq!(tools[0].input_schema["type"], "object");
    }

    /// **Scenario**: Some servers reply with a bare array instead of `{tools: [...]}`;
    /// both shapes must normalise to the same list.
    #[test]
    fn parse_tools_result_accepts_bare_array() {
        let result = ResultMessage::success(
            1,
            json!([
                {"name": "google_search", "inputSchema": {"type": "object"}}
            ]),
        );
        let tools = parse_tools_result(result).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "google_search");
        assert!(tools[0].description.is_none());
    }

    #[test]
    fn parse_tools_result_errors_for_missing_or_invalid_tools() {
        let missing = ResultMessage::success(1, json!({}));
        assert!(matches!(
            parse_tools_result(missing),
            Err(TransportError::Protocol(_))
        ));

        let non_array = ResultMessage::success(1, json!({"tools": {}}));
        assert!(matches!(
            parse_tools_result(non_array),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn parse_tools_result_propagates_rpc_error() {
        let err = ResultMessage::failure(1, ErrorObject::new(-32000, "rpc failed", None));
        assert!(matches!(
            parse_tools_result(err),
            Err(TransportError::Rpc(msg)) if msg == "rpc failed"
        ));
    }

    #[test]
    fn reduce_call_result_joins_text_blocks() {
        let result = ResultMessage::success(
            1,
            json!({
                "content": [
                    {"type":"text","text":"line1"},
                    {"type":"image","text":"ignored"},
                    {"type":"text","text":"line2"}
                ]
            }),
        );
        assert_eq!(reduce_call_result(result).unwrap(), "line1\nline2");
    }

    #[test]
    fn reduce_call_result_uses_structured_content_fallback() {
        let result = ResultMessage::success(1, json!({"structuredContent": {"ok": true}}));
        let out = reduce_call_result(result).unwrap();
        assert!(out.contains("\"ok\":true"));
    }

    #[test]
    fn reduce_call_result_stringifies_raw_values() {
        let as_string = ResultMessage::success(1, json!("plain result"));
        assert_eq!(reduce_call_result(as_string).unwrap(), "plain result");

        let as_number = ResultMessage::success(1, json!(42));
        assert_eq!(reduce_call_result(as_number).unwrap(), "42");
    }

    #[test]
    fn reduce_call_result_surfaces_is_error_as_tool_error() {
        let is_error = ResultMessage::success(
            1,
            json!({
                "isError": true,
                "content": [{"type":"text","text":"boom"}]
            }),
        );
        assert!(matches!(
            reduce_call_result(is_error),
            Err(TransportError::Tool(msg)) if msg == "boom"
        ));
    }

    #[test]
    fn reduce_call_result_propagates_rpc_error() {
        let err = ResultMessage::failure(1, ErrorObject::new(-32000, "call failed", None));
        assert!(matches!(
            reduce_call_result(err),
            Err(TransportError::Rpc(msg)) if msg == "call failed"
        ));
    }

    #[test]
    fn reduce_call_result_errors_on_empty_content() {
        let empty = ResultMessage::success(1, json!({"content": []}));
        assert!(matches!(
            reduce_call_result(empty),
            Err(TransportError::Protocol(_))
        ));
    }
}
