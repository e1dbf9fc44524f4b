//! MCP streamable-HTTP transport: POST one JSON-RPC message per request and
//! parse the response body, which may be `application/json` (single object)
//! or `text/event-stream` (SSE lines carrying JSON-RPC messages).
//!
//! Sends `Accept: application/json, text/event-stream` and the
//! `MCP-Protocol-Version` header on every request; captures the server's
//! `MCP-Session-Id` from initialize and echoes it afterwards.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ServerSpec;

use super::jsonrpc::{ErrorObject, MessageId, NotificationMessage, RequestMessage, ResultMessage};
use super::{
    parse_tools_result, reduce_call_result, ToolDescriptor, TransportConn, TransportError,
    PROTOCOL_VERSION,
};

/// JSON-RPC error object in a response body.
#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC response body (id + result or error).
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: Option<MessageId>,
    result: Option<Value>,
    error: Option<JsonRpcErrorBody>,
}

/// Parses a JSON-RPC response from an HTTP body. Supports both
/// `application/json` (single object) and `text/event-stream` (`data:` lines).
/// Returns the first message that carries a result or an error.
fn parse_json_rpc_from_body(
    body: &str,
    content_type: Option<&reqwest::header::HeaderValue>,
) -> Result<JsonRpcResponse, TransportError> {
    let is_sse = content_type
        .and_then(|v| v.to_str().ok())
        .map(|s| s.contains("text/event-stream"))
        .unwrap_or(false);

    if !is_sse {
        return serde_json::from_str(body)
            .map_err(|e| TransportError::Protocol(format!("response json: {}", e)));
    }

    let mut data_buffer = String::new();
    let mut flush = |buffer: &mut String| -> Option<JsonRpcResponse> {
        if buffer.is_empty() {
            return None;
        }
        let parsed = serde_json::from_str::<JsonRpcResponse>(buffer).ok();
        buffer.clear();
        parsed.filter(|r| r.result.is_some() || r.error.is_some())
    };
    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            if data.is_empty() || data == "[DONE]" {
                if let Some(r) = flush(&mut data_buffer) {
                    return Ok(r);
                }
                continue;
            }
            if !data_buffer.is_empty() {
                data_buffer.push('\n');
            }
            data_buffer.push_str(data);
            // Some servers emit one JSON object per data line without blank separators.
            if let Ok(r) = serde_json::from_str::<JsonRpcResponse>(&data_buffer) {
                if r.result.is_some() || r.error.is_some() {
                    return Ok(r);
                }
            }
        } else if line.trim().is_empty() {
            if let Some(r) = flush(&mut data_buffer) {
                return Ok(r);
            }
        }
    }
    if let Some(r) = flush(&mut data_buffer) {
        return Ok(r);
    }
    Err(TransportError::Protocol(
        "SSE stream: no JSON-RPC response (result/error) found".into(),
    ))
}

/// MCP session over streamable HTTP.
pub struct HttpConn {
    client: Client,
    url: String,
    /// Extra headers (e.g. API keys) sent on every request.
    headers: Vec<(String, String)>,
    /// Session id from the server's `MCP-Session-Id` header.
    session_id: StdMutex<Option<String>>,
    next_id: AtomicI64,
}

impl HttpConn {
    /// Opens the session and completes the initialize handshake. A `202
    /// Accepted` reply to initialize is tolerated (some servers skip the
    /// result body).
    pub async fn connect(spec: &ServerSpec) -> Result<Self, TransportError> {
        let url = spec
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                TransportError::Unreachable(format!("http server '{}' has no url", spec.name))
            })?;
        let client = Client::builder()
            .timeout(spec.connect_timeout())
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let conn = Self {
            client,
            url,
            headers: spec.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            session_id: StdMutex::new(None),
            next_id: AtomicI64::new(1),
        };
        conn.initialize().await?;
        debug!(server = %spec.name, "http transport connected");
        Ok(conn)
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": "weft-mcp",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RequestMessage::new(id, "initialize", params);
        let resp = self
            .post_json(&serde_json::to_vec(&request).map_err(to_protocol)?)
            .await?;

        let status = resp.status();
        if let Some(sid) = resp
            .headers()
            .get("MCP-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut guard) = self.session_id.lock() {
                *guard = Some(sid.to_string());
            }
        }
        if status != reqwest::StatusCode::ACCEPTED {
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(TransportError::Handshake(format!(
                    "initialize HTTP {}: {}",
                    status,
                    if text.is_empty() { "no body" } else { &text }
                )));
            }
            let content_type = resp.headers().get("content-type").cloned();
            let text = resp.text().await.map_err(|e| {
                TransportError::Handshake(format!("initialize response body: {}", e))
            })?;
            let parsed = parse_json_rpc_from_body(&text, content_type.as_ref())
                .map_err(|e| TransportError::Handshake(format!("initialize {}", e)))?;
            if let Some(err) = parsed.error {
                return Err(TransportError::Handshake(err.message));
            }
        }

        let notification = NotificationMessage::new("notifications/initialized", Some(json!({})));
        let resp = self
            .post_json(&serde_json::to_vec(&notification).map_err(to_protocol)?)
            .await?;
        let status = resp.status();
        if status != reqwest::StatusCode::ACCEPTED && !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::Handshake(format!(
                "notifications/initialized HTTP {}: {}",
                status,
                if text.is_empty() { "no body" } else { &text }
            )));
        }
        Ok(())
    }

    async fn post_json(&self, body: &[u8]) -> Result<reqwest::Response, TransportError> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .body(body.to_vec());
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Ok(guard) = self.session_id.lock() {
            if let Some(ref sid) = *guard {
                req = req.header("MCP-Session-Id", sid.as_str());
            }
        }
        req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(e.to_string())
            } else if e.is_connect() {
                TransportError::Unreachable(e.to_string())
            } else {
                TransportError::Protocol(e.to_string())
            }
        })
    }

    /// One request/response round trip.
    async fn request(&self, method: &str, params: Value) -> Result<ResultMessage, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RequestMessage::new(id, method, params);
        let resp = self
            .post_json(&serde_json::to_vec(&request).map_err(to_protocol)?)
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::Protocol(format!(
                "{} HTTP {}: {}",
                method,
                status,
                if text.is_empty() { "no body" } else { &text }
            )));
        }
        let content_type = resp.headers().get("content-type").cloned();
        let text = resp.text().await.map_err(|e| TransportError::Protocol(e.to_string()))?;
        let parsed = parse_json_rpc_from_body(&text, content_type.as_ref())?;
        let msg_id = parsed.id.unwrap_or(MessageId::Int(id));
        if let Some(err) = parsed.error {
            return Ok(ResultMessage::failure(
                msg_id,
                ErrorObject::new(err.code, err.message, None),
            ));
        }
        Ok(ResultMessage::success(
            msg_id,
            parsed.result.unwrap_or(Value::Null),
        ))
    }
}

fn to_protocol(e: serde_json::Error) -> TransportError {
    TransportError::Protocol(e.to_string())
}

#[async_trait]
impl TransportConn for HttpConn {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let result = self.request("tools/list", json!({})).await?;
        parse_tools_result(result)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, TransportError> {
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request("tools/call", params).await?;
        reduce_call_result(result)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn read_http_request(stream: &mut TcpStream) -> (String, String) {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 1024];
        loop {
            let n = stream.read(&mut tmp).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let header_end = pos + 4;
                let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = headers
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);
                let mut body = buf[header_end..].to_vec();
                while body.len() < content_length {
                    let m = stream.read(&mut tmp).await.unwrap();
                    if m == 0 {
                        break;
                    }
                    body.extend_from_slice(&tmp[..m]);
                }
                let body = String::from_utf8_lossy(&body[..content_length]).to_string();
                return (headers, body);
            }
        }
        (String::new(), String::new())
    }

    async fn write_http_response(
        stream: &mut TcpStream,
        status: &str,
        content_type: Option<&str>,
        extra_headers: &[(&str, &str)],
        body: &str,
    ) {
        let mut resp = format!("HTTP/1.1 {}\r\nConnection: close\r\n", status);
        if let Some(ct) = content_type {
            resp.push_str(&format!("Content-Type: {}\r\n", ct));
        }
        for (k, v) in extra_headers {
            resp.push_str(&format!("{}: {}\r\n", k, v));
        }
        resp.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
        stream.write_all(resp.as_bytes()).await.unwrap();
    }

    fn spec_for(addr: std::net::SocketAddr) -> ServerSpec {
        let mut spec = ServerSpec::http("http-test", format!("http://{}", addr));
        spec.headers.insert("X-Test".into(), "1".into());
        spec
    }

    #[tokio::test]
    async fn http_conn_list_and_call_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let methods: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let methods_clone = Arc::clone(&methods);
        let server = tokio::spawn(async move {
            for _ in 0..4 {
                let (mut stream, _) = listener.accept().await.unwrap();
                let (_headers, body) = read_http_request(&mut stream).await;
                let json: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                let id = json.get("id").cloned().unwrap_or(Value::Null);
                let method = json
                    .get("method")
                    .and_then(|m| m.as_str())
                    .unwrap_or("")
                    .to_string();
                methods_clone.lock().unwrap().push(method.clone());
                match method.as_str() {
                    "initialize" => {
                        let body = serde_json::json!({
                            "jsonrpc":"2.0",
                            "id": id,
                            "result":{"protocolVersion":"2025-11-25"}
                        })
                        .to_string();
                        write_http_response(
                            &mut stream,
                            "200 OK",
                            Some("application/json"),
                            &[("MCP-Session-Id", "sess-1")],
                            &body,
                        )
                        .await;
                    }
                    "notifications/initialized" => {
                        write_http_response(&mut stream, "202 Accepted", None, &[], "").await;
                    }
                    "tools/list" => {
                        let body = serde_json::json!({
                            "jsonrpc":"2.0",
                            "id": id,
                            "result":{"tools":[{"name":"http_tool","description":"from http","inputSchema":{"type":"object"}}]}
                        })
                        .to_string();
                        write_http_response(
                            &mut stream,
                            "200 OK",
                            Some("application/json"),
                            &[],
                            &body,
                        )
                        .await;
                    }
                    "tools/call" => {
                        let body = serde_json::json!({
                            "jsonrpc":"2.0",
                            "id": id,
                            "result":{"content":[{"type":"text","text":"ok-from-http"}]}
                        })
                        .to_string();
                        write_http_response(
                            &mut stream,
                            "200 OK",
                            Some("application/json"),
                            &[],
                            &body,
                        )
                        .await;
                    }
                    _ => panic!("unexpected method: {}", method),
                }
            }
        });

        let conn = HttpConn::connect(&spec_for(addr)).await.unwrap();
        let tools = conn.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "http_tool");
        let out = conn
            .call_tool("http_tool", serde_json::json!({"q":"x"}))
            .await
            .unwrap();
        assert_eq!(out, "ok-from-http");
        let called = methods.lock().unwrap().clone();
        assert_eq!(
            called,
            vec![
                "initialize".to_string(),
                "notifications/initialized".to_string(),
                "tools/list".to_string(),
                "tools/call".to_string()
            ]
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn http_conn_supports_sse_jsonrpc_responses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                let (_, body) = read_http_request(&mut stream).await;
                let json: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                let method = json.get("method").and_then(|m| m.as_str()).unwrap_or("");
                match method {
                    "initialize" => {
                        write_http_response(&mut stream, "202 Accepted", None, &[], "").await;
                    }
                    "tools/list" => {
                        let id = json.get("id").cloned().unwrap_or(Value::Null);
                        let sse = format!(
                            "data: {}\n\n",
                            serde_json::json!({
                                "jsonrpc":"2.0",
                                "id": id,
                                "result":{"tools":[{"name":"sse_tool","description":"sse","inputSchema":{"type":"object"}}]}
                            })
                        );
                        write_http_response(
                            &mut stream,
                            "200 OK",
                            Some("text/event-stream"),
                            &[],
                            &sse,
                        )
                        .await;
                    }
                    _ => panic!("unexpected method: {}", method),
                }
            }
        });

        let conn = HttpConn::connect(&spec_for(addr)).await.unwrap();
        let tools = conn.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "sse_tool");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn http_conn_maps_jsonrpc_error_from_tools_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                let (_, body) = read_http_request(&mut stream).await;
                let json: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                let method = json.get("method").and_then(|m| m.as_str()).unwrap_or("");
                match method {
                    "initialize" => {
                        write_http_response(&mut stream, "202 Accepted", None, &[], "").await;
                    }
                    "tools/call" => {
                        let id = json.get("id").cloned().unwrap_or(Value::Null);
                        let body = serde_json::json!({
                            "jsonrpc":"2.0",
                            "id": id,
                            "error":{"code":-32000,"message":"call failed"}
                        })
                        .to_string();
                        write_http_response(
                            &mut stream,
                            "200 OK",
                            Some("application/json"),
                            &[],
                            &body,
                        )
                        .await;
                    }
                    _ => panic!("unexpected method: {}", method),
                }
            }
        });

        let conn = HttpConn::connect(&spec_for(addr)).await.unwrap();
        let err = conn
            .call_tool("bad_tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rpc(msg) if msg == "call failed"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn http_conn_initialize_http_error_surfaces_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_http_request(&mut stream).await;
            write_http_response(
                &mut stream,
                "500 Internal Server Error",
                Some("text/plain"),
                &[],
                "boom",
            )
            .await;
        });

        let err = match HttpConn::connect(&spec_for(addr)).await {
            Ok(_) => panic!("expected initialization to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, TransportError::Handshake(msg) if msg.contains("initialize HTTP")));
        server.await.unwrap();
    }
}
