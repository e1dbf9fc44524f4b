//! MCP manager: glues transports, pool and cache together.
//!
//! On startup it walks every enabled server spec, borrows a pooled
//! connection, lists tools and populates the cache — in parallel with bounded
//! concurrency. At call time it resolves a tool name to its owning server,
//! borrows a connection, times the round trip and folds the result into the
//! metrics. Exactly one metrics update happens per invocation, timeouts and
//! failures included.
//!
//! Duplicate tool names across servers resolve **last-writer-wins** in
//! configured server order; both per-server manifests stay cached. An unknown
//! tool name is not an error: the caller gets an observable
//! "not found" string the reasoner can react to.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{ServerStatus, ToolCache, ToolInfo};
use crate::config::ServerSpec;
use crate::context;
use crate::pool::{ConnectionPool, PoolError};
use crate::transport::TransportError;

/// Upper bound on concurrent per-server discovery.
const DISCOVERY_CONCURRENCY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("connect failed: {0}")]
    ConnectFailed(#[from] PoolError),
    #[error("tool '{tool}' timed out after {timeout:?}")]
    CallTimeout { tool: String, timeout: Duration },
    #[error("tool '{tool}' failed: {source}")]
    CallFailed {
        tool: String,
        #[source]
        source: TransportError,
    },
    #[error("server '{0}' is not configured")]
    UnknownServer(String),
}

pub struct McpManager {
    specs: Vec<ServerSpec>,
    pool: Arc<ConnectionPool>,
    cache: Arc<ToolCache>,
    /// tool name → owning server; later-discovered bindings overwrite.
    routes: RwLock<HashMap<String, String>>,
    call_timeout: Duration,
}

impl McpManager {
    pub fn new(
        specs: Vec<ServerSpec>,
        pool: Arc<ConnectionPool>,
        cache: Arc<ToolCache>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            specs,
            pool,
            cache,
            routes: RwLock::new(HashMap::new()),
            call_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<ToolCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Discovers every enabled server's tools and populates the cache.
    /// I/O runs per-server in parallel (bounded); cache and routing updates
    /// happen in configured server order so precedence is deterministic.
    /// Servers that fail to connect appear with an empty list and an error
    /// status; the rest proceed.
    pub async fn initialize_with_caching(&self) -> HashMap<String, Vec<ToolInfo>> {
        let enabled: Vec<ServerSpec> = self.specs.iter().filter(|s| s.enabled).cloned().collect();
        if enabled.is_empty() {
            info!("no enabled MCP servers configured");
            return HashMap::new();
        }
        let limit = enabled.len().min(DISCOVERY_CONCURRENCY);

        let mut fetched: HashMap<String, Result<Vec<ToolInfo>, String>> =
            stream::iter(enabled.iter().cloned().map(|spec| {
                let this = &*self;
                async move {
                    let name = spec.name.clone();
                    (name, this.fetch_server_tools(&spec).await)
                }
            }))
            .buffer_unordered(limit)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect();

        let mut discovered = HashMap::new();
        for spec in &enabled {
            match fetched.remove(&spec.name) {
                Some(Ok(tools)) => {
                    self.cache
                        .update_server_status(ServerStatus::connected(&spec.name, spec.transport));
                    self.cache.cache_server_tools(&spec.name, tools.clone());
                    if let Ok(mut routes) = self.routes.write() {
                        for tool in &tools {
                            if let Some(prev) =
                                routes.insert(tool.name.clone(), spec.name.clone())
                            {
                                if prev != spec.name {
                                    warn!(
                                        tool = %tool.name,
                                        old = %prev,
                                        new = %spec.name,
                                        "duplicate tool name; later binding wins"
                                    );
                                }
                            }
                        }
                    }
                    info!(server = %spec.name, tools = tools.len(), "discovered server tools");
                    discovered.insert(spec.name.clone(), tools);
                }
                Some(Err(message)) => {
                    warn!(server = %spec.name, "discovery failed: {}", message);
                    self.cache.update_server_status(ServerStatus::error(
                        &spec.name,
                        spec.transport,
                        message,
                    ));
                    discovered.insert(spec.name.clone(), Vec::new());
                }
                None => {}
            }
        }
        discovered
    }

    async fn fetch_server_tools(&self, spec: &ServerSpec) -> Result<Vec<ToolInfo>, String> {
        if let Some(cached) = self.cache.get_cached_tools(&spec.name) {
            debug!(server = %spec.name, "using still-valid cached tool list");
            return Ok(cached);
        }
        let handle = self.pool.acquire(spec).await.map_err(|e| e.to_string())?;
        match handle.conn().list_tools().await {
            Ok(descriptors) => {
                self.pool.release(handle, false).await;
                Ok(descriptors
                    .into_iter()
                    .map(|d| {
                        let category = context::derive_category(&d.name);
                        ToolInfo::new(
                            d.name.clone(),
                            d.description.unwrap_or_default(),
                            spec.name.clone(),
                            d.input_schema,
                            category,
                        )
                    })
                    .collect())
            }
            Err(e) => {
                let message = e.to_string();
                self.pool.release(handle, true).await;
                Err(message)
            }
        }
    }

    /// The server a tool name currently routes to.
    pub fn resolve(&self, tool_name: &str) -> Option<String> {
        if let Ok(routes) = self.routes.read() {
            if let Some(server) = routes.get(tool_name) {
                return Some(server.clone());
            }
        }
        self.cache.get_tool_by_name(tool_name).map(|t| t.server_name)
    }

    pub fn knows_tool(&self, tool_name: &str) -> bool {
        self.resolve(tool_name).is_some()
    }

    /// Invokes a tool and normalises the outcome.
    ///
    /// Unknown names return `Ok` with a "not found" message (the reasoner may
    /// recover by picking another tool). Real failures — timeout, protocol
    /// breakage, tool error payloads — return `Err` after recording a failed
    /// call in the metrics.
    pub async fn call_tool(&self, tool_name: &str, args: Value) -> Result<String, ManagerError> {
        let Some(server) = self.resolve(tool_name) else {
            let known = self.cache.all_tool_names();
            let shown = known
                .iter()
                .take(10)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            info!(tool = tool_name, "tool not found; reporting known tools");
            return Ok(format!(
                "Tool '{}' not found. Available tools: {}",
                tool_name, shown
            ));
        };
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == server)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownServer(server.clone()))?;

        let handle = self.pool.acquire(&spec).await?;
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.call_timeout, handle.conn().call_tool(tool_name, args))
                .await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(Ok(payload)) => {
                self.cache.update_tool_performance(tool_name, true, elapsed);
                self.pool.release(handle, false).await;
                debug!(tool = tool_name, server = %server, elapsed, "tool call succeeded");
                Ok(payload)
            }
            Ok(Err(e)) => {
                self.cache.update_tool_performance(tool_name, false, elapsed);
                self.pool.release(handle, true).await;
                Err(ManagerError::CallFailed {
                    tool: tool_name.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                self.cache.update_tool_performance(tool_name, false, elapsed);
                self.pool.release(handle, true).await;
                Err(ManagerError::CallTimeout {
                    tool: tool_name.to_string(),
                    timeout: self.call_timeout,
                })
            }
        }
    }

    /// Stops the pool and the cache writer.
    pub async fn shutdown(&self) {
        self.pool.stop().await;
        self.cache.shutdown().await;
        info!("mcp manager shut down");
    }
}
