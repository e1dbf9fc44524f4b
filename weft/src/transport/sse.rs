//! MCP SSE transport: a long-lived GET event stream carries server→client
//! messages; client→server requests are POSTed to the endpoint the server
//! announces in its first `endpoint` event.
//!
//! The event stream honours a separate `read_timeout` (default 120 s): if the
//! stream goes idle for longer, the connection is considered dead and every
//! waiter is released with `Closed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::config::ServerSpec;

use super::jsonrpc::{JsonRpcMessage, NotificationMessage, RequestMessage, ResultMessage};
use super::{
    parse_tools_result, reduce_call_result, ToolDescriptor, TransportConn, TransportError,
    CALL_TIMEOUT, PROTOCOL_VERSION,
};

type PendingMap = Arc<StdMutex<HashMap<i64, oneshot::Sender<ResultMessage>>>>;

/// One server-sent event: `event` field (default "message") plus joined data lines.
#[derive(Debug, PartialEq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Incremental SSE frame parser. Chunks may split events at arbitrary byte
/// boundaries; complete events are returned as they close (blank line).
#[derive(Debug, Default)]
struct SseParser {
    buffer: String,
}

impl SseParser {
    fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let raw: String = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            if let Some(ev) = parse_event(&raw) {
                events.push(ev);
            }
        }
        events
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        if let Some(v) = line.strip_prefix("event:") {
            event = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("data:") {
            data_lines.push(v.strip_prefix(' ').unwrap_or(v).to_string());
        }
        // id: and comment lines are irrelevant here
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(SseEvent {
            event,
            data: data_lines.join("\n"),
        })
    }
}

pub struct SseConn {
    client: Client,
    post_url: Url,
    headers: Vec<(String, String)>,
    pending: PendingMap,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl SseConn {
    /// Opens the event stream, resolves the POST endpoint and completes the
    /// initialize handshake.
    pub async fn connect(spec: &ServerSpec) -> Result<Self, TransportError> {
        let url_str = spec
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                TransportError::Unreachable(format!("sse server '{}' has no url", spec.name))
            })?;
        let base = Url::parse(&url_str)
            .map_err(|e| TransportError::Unreachable(format!("bad url '{}': {}", url_str, e)))?;
        // No global request timeout: the GET stream stays open indefinitely.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let headers: Vec<(String, String)> = spec
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut req = client
            .get(base.clone())
            .header("Accept", "text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let connect_timeout = spec.connect_timeout();
        let resp = tokio::time::timeout(connect_timeout, req.send())
            .await
            .map_err(|_| TransportError::Timeout("connecting event stream".into()))?
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::Unreachable(format!(
                "event stream HTTP {}",
                resp.status()
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut parser = SseParser::default();

        // The server's first event names the endpoint for client→server POSTs.
        let deadline = tokio::time::Instant::now() + connect_timeout;
        let post_url = 'endpoint: loop {
            let chunk = tokio::time::timeout_at(deadline, stream.next())
                .await
                .map_err(|_| TransportError::Handshake("timeout waiting for endpoint event".into()))?
                .ok_or_else(|| {
                    TransportError::Handshake("event stream closed before endpoint event".into())
                })?
                .map_err(|e| TransportError::Unreachable(e.to_string()))?;
            let text = String::from_utf8_lossy(&chunk).replace('\r', "");
            for ev in parser.push(&text) {
                if ev.event == "endpoint" {
                    let endpoint = ev.data.trim();
                    break 'endpoint base.join(endpoint).map_err(|e| {
                        TransportError::Handshake(format!("bad endpoint '{}': {}", endpoint, e))
                    })?;
                }
            }
        };

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            spec.name.clone(),
            stream,
            parser,
            Arc::clone(&pending),
            spec.event_read_timeout(),
            Arc::clone(&closed),
        ));

        let conn = Self {
            client,
            post_url,
            headers,
            pending,
            next_id: AtomicI64::new(1),
            closed,
            reader: StdMutex::new(Some(reader)),
        };
        conn.initialize(connect_timeout).await?;
        debug!(server = %spec.name, "sse transport connected");
        Ok(conn)
    }

    async fn initialize(&self, timeout: Duration) -> Result<(), TransportError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": "weft-mcp",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = self
            .request("initialize", params, timeout)
            .await
            .map_err(|e| match e {
                TransportError::Timeout(_) => {
                    TransportError::Handshake("timeout waiting for initialize".into())
                }
                other => other,
            })?;
        if let Some(err) = result.error {
            return Err(TransportError::Handshake(err.message));
        }
        self.post(&NotificationMessage::new(
            "notifications/initialized",
            Some(json!({})),
        ))
        .await?;
        Ok(())
    }

    /// POSTs one message to the announced endpoint. A `202 Accepted` with an
    /// empty body is the expected reply; responses arrive on the event stream.
    async fn post<T: serde::Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let body =
            serde_json::to_vec(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let mut req = self
            .client
            .post(self.post_url.clone())
            .header("Content-Type", "application/json")
            .body(body);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_connect() {
                TransportError::Unreachable(e.to_string())
            } else {
                TransportError::Protocol(e.to_string())
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Protocol(format!("POST HTTP {}", status)));
        }
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        wait: Duration,
    ) -> Result<ResultMessage, TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut p) = self.pending.lock() {
            p.insert(id, tx);
        } else {
            return Err(TransportError::Closed);
        }

        let request = RequestMessage::new(id, method, params);
        if let Err(e) = self.post(&request).await {
            if let Ok(mut p) = self.pending.lock() {
                p.remove(&id);
            }
            return Err(e);
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                if let Ok(mut p) = self.pending.lock() {
                    p.remove(&id);
                }
                Err(TransportError::Timeout(format!("waiting for {}", method)))
            }
        }
    }
}

async fn read_loop<S, B>(
    server: String,
    mut stream: S,
    mut parser: SseParser,
    pending: PendingMap,
    read_timeout: Duration,
    closed: Arc<AtomicBool>,
) where
    S: futures_util::Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        match tokio::time::timeout(read_timeout, stream.next()).await {
            Ok(Some(Ok(chunk))) => {
                let text = String::from_utf8_lossy(chunk.as_ref()).replace('\r', "");
                for ev in parser.push(&text) {
                    if ev.event != "message" {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcMessage>(&ev.data) {
                        Ok(JsonRpcMessage::Result(msg)) => {
                            let sender = msg.id.as_int().and_then(|id| {
                                pending.lock().ok().and_then(|mut p| p.remove(&id))
                            });
                            if let Some(tx) = sender {
                                let _ = tx.send(msg);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => debug!(server = %server, "unparseable sse event: {}", e),
                    }
                }
            }
            Ok(Some(Err(e))) => {
                warn!(server = %server, "event stream error: {}", e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(server = %server, "event stream idle beyond {:?}, closing", read_timeout);
                break;
            }
        }
    }
    closed.store(true, Ordering::Relaxed);
    if let Ok(mut p) = pending.lock() {
        p.clear();
    }
}

#[async_trait]
impl TransportConn for SseConn {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let result = self.request("tools/list", json!({}), CALL_TIMEOUT).await?;
        parse_tools_result(result)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, TransportError> {
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request("tools/call", params, CALL_TIMEOUT).await?;
        reduce_call_result(result)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.lock().ok().and_then(|mut g| g.take()) {
            handle.abort();
        }
    }
}
