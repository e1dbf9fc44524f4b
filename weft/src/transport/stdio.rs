//! MCP stdio transport: spawns the server subprocess and speaks
//! newline-delimited JSON-RPC over its stdin/stdout.
//!
//! A background reader task routes responses to waiting callers by request id
//! and answers server-issued `roots/list` requests with empty roots. Child
//! stderr is discarded for quiet UX; the child is killed on close (and on
//! drop, as a backstop).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ServerSpec;

use super::jsonrpc::{JsonRpcMessage, NotificationMessage, RequestMessage, ResultMessage};
use super::{
    parse_tools_result, reduce_call_result, ToolDescriptor, TransportConn, TransportError,
    CALL_TIMEOUT, PROTOCOL_VERSION,
};

type PendingMap = Arc<StdMutex<HashMap<i64, oneshot::Sender<ResultMessage>>>>;

pub struct StdioConn {
    server: String,
    child: Mutex<Child>,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicI64,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl StdioConn {
    /// Spawns the server process and completes the initialize handshake.
    /// The handshake is bounded by the spec's connect timeout (default 120 s,
    /// long enough for package-fetching cold starts).
    pub async fn connect(spec: &ServerSpec) -> Result<Self, TransportError> {
        let command = spec
            .command
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                TransportError::Unreachable(format!("stdio server '{}' has no command", spec.name))
            })?;
        let mut child = Command::new(&command)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Unreachable(format!("spawn {}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Unreachable("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Unreachable("child stdout unavailable".into()))?;

        let stdin = Arc::new(Mutex::new(stdin));
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(
            spec.name.clone(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&stdin),
        ));

        let conn = Self {
            server: spec.name.clone(),
            child: Mutex::new(child),
            stdin,
            pending,
            next_id: AtomicI64::new(1),
            reader: StdMutex::new(Some(reader)),
        };
        conn.initialize(spec.connect_timeout()).await?;
        debug!(server = %conn.server, "stdio transport connected");
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
        self.notify("notifications/initialized", json!({})).await
    }

    /// Sends one request and waits for the matching response.
    async fn request(
        &self,
        method: &str,
        params: Value,
        wait: Duration,
    ) -> Result<ResultMessage, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut p) = self.pending.lock() {
            p.insert(id, tx);
        } else {
            return Err(TransportError::Closed);
        }

        let request = RequestMessage::new(id, method, params);
        if let Err(e) = self.write_message(&JsonRpcMessage::Request(request)).await {
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

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let notification = NotificationMessage::new(method, Some(params));
        self.write_message(&JsonRpcMessage::Notification(notification))
            .await
    }

    async fn write_message(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let bytes =
            serde_json::to_vec(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&bytes).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

async fn read_loop(
    server: String,
    stdout: ChildStdout,
    pending: PendingMap,
    stdin: Arc<Mutex<ChildStdin>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcMessage>(line) {
                    Ok(JsonRpcMessage::Result(msg)) => {
                        let sender = msg.id.as_int().and_then(|id| {
                            pending.lock().ok().and_then(|mut p| p.remove(&id))
                        });
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(msg);
                            }
                            None => debug!(server = %server, "response with unknown id"),
                        }
                    }
                    Ok(JsonRpcMessage::Request(req)) if req.method == "roots/list" => {
                        let reply = ResultMessage::success(req.id, json!({ "roots": [] }));
                        if let Ok(bytes) = serde_json::to_vec(&JsonRpcMessage::Result(reply)) {
                            let mut guard = stdin.lock().await;
                            let _ = guard.write_all(&bytes).await;
                            let _ = guard.write_all(b"\n").await;
                            let _ = guard.flush().await;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(server = %server, "unparseable stdio line: {}", e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(server = %server, "stdio read error: {}", e);
                break;
            }
        }
    }
    // Dropping the senders wakes every waiter with Closed.
    if let Ok(mut p) = pending.lock() {
        p.clear();
    }
}

#[async_trait]
impl TransportConn for StdioConn {
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
        if let Some(handle) = self.reader.lock().ok().and_then(|mut g| g.take()) {
            handle.abort();
        }
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}
