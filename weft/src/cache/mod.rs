//! Tool cache: the single source of truth for which tools exist, which server
//! owns them, and how they have been performing.
//!
//! Mutations are pure in-memory; when persistence is enabled every
//! state-changing call publishes a snapshot to a single writer task that
//! performs the atomic write (see [`persist`]). Readers never observe a
//! half-written entry: all state sits behind one `RwLock`, and per-server
//! lists are replaced wholesale.

pub mod persist;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CacheSettings, TransportKind};

pub use persist::CacheSnapshot;

/// Per-tool call statistics. The response-time average is an exponential
/// moving average with weight 0.2 on the newest sample.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub last_call_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
}

impl PerformanceMetrics {
    /// Folds one call result in. Exactly one call per tool invocation,
    /// success or failure.
    pub fn record_call(&mut self, success: bool, response_time: f64) {
        self.total_calls += 1;
        self.last_call_time = Some(Utc::now());
        if success {
            self.successful_calls += 1;
            self.last_success_time = Some(Utc::now());
        } else {
            self.failed_calls += 1;
        }
        self.success_rate = self.successful_calls as f64 / self.total_calls as f64;
        if self.avg_response_time == 0.0 {
            self.avg_response_time = response_time;
        } else {
            self.avg_response_time = 0.8 * self.avg_response_time + 0.2 * response_time;
        }
    }
}

/// One cached tool with its embedded metrics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub server_name: String,
    /// Opaque JSON schema describing the tool's arguments.
    pub schema: Value,
    pub category: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub performance_metrics: PerformanceMetrics,
}

impl ToolInfo {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        server_name: impl Into<String>,
        schema: Value,
        category: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            server_name: server_name.into(),
            schema,
            category: category.into(),
            last_updated: Utc::now(),
            performance_metrics: PerformanceMetrics::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Connected,
    Disconnected,
    Error,
}

/// Status of one server as last observed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: TransportKind,
    pub state: ServerState,
    pub last_ping: Option<DateTime<Utc>>,
    pub connection_count: u32,
    pub tools_count: usize,
    pub error_message: Option<String>,
}

impl ServerStatus {
    pub fn connected(name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            name: name.into(),
            transport,
            state: ServerState::Connected,
            last_ping: Some(Utc::now()),
            connection_count: 1,
            tools_count: 0,
            error_message: None,
        }
    }

    pub fn error(
        name: impl Into<String>,
        transport: TransportKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            state: ServerState::Error,
            last_ping: None,
            connection_count: 0,
            tools_count: 0,
            error_message: Some(message.into()),
        }
    }
}

/// Aggregate view returned by [`ToolCache::performance_summary`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct PerformanceSummary {
    pub servers_cached: usize,
    pub total_tools: usize,
    pub global: PerformanceMetrics,
    pub servers: HashMap<String, ServerPerformance>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ServerPerformance {
    pub tools_count: usize,
    pub total_calls: u64,
    pub avg_success_rate: f64,
}

#[derive(Default)]
struct CacheInner {
    /// Server insertion order; lookups by name scan in this order.
    order: Vec<String>,
    tools: HashMap<String, Vec<ToolInfo>>,
    status: HashMap<String, ServerStatus>,
    stamps: HashMap<String, DateTime<Utc>>,
    global: PerformanceMetrics,
    overflow_warned: HashSet<String>,
}

impl CacheInner {
    fn is_valid(&self, server: &str, cache_duration: std::time::Duration) -> bool {
        let Some(stamp) = self.stamps.get(server) else {
            return false;
        };
        let age = Utc::now()
            .signed_duration_since(*stamp)
            .to_std()
            .unwrap_or_default();
        age < cache_duration
    }
}

pub struct ToolCache {
    settings: CacheSettings,
    inner: RwLock<CacheInner>,
    dirty_tx: Option<mpsc::UnboundedSender<CacheSnapshot>>,
    writer: StdMutex<Option<JoinHandle<()>>>,
}

impl ToolCache {
    /// Creates the cache, loading a persisted snapshot best-effort and
    /// starting the writer task when persistence is configured. Must be
    /// called within a tokio runtime when `persist_cache` is on.
    pub fn new(settings: CacheSettings) -> Arc<Self> {
        let mut inner = CacheInner::default();
        let mut dirty_tx = None;
        let mut writer = None;

        if settings.persist_cache {
            if let Some(path) = settings.cache_file.clone() {
                if path.exists() {
                    match persist::load(&path) {
                        Ok(snapshot) => {
                            inner = inner_from_snapshot(snapshot);
                            info!(path = %path.display(), "loaded cache snapshot");
                        }
                        Err(e) => {
                            warn!(path = %path.display(), "discarding corrupt cache snapshot: {}", e);
                        }
                    }
                }
                let (tx, rx) = mpsc::unbounded_channel();
                writer = Some(tokio::spawn(persist::writer_task(rx, path)));
                dirty_tx = Some(tx);
            }
        }

        Arc::new(Self {
            settings,
            inner: RwLock::new(inner),
            dirty_tx,
            writer: StdMutex::new(writer),
        })
    }

    /// Atomically replaces the entry for `server`. Metrics for tools that
    /// still exist under the same name survive the refresh. An incoming list
    /// with the same size as a still-valid entry is treated as already cached.
    pub fn cache_server_tools(&self, server: &str, mut tools: Vec<ToolInfo>) {
        let snapshot = {
            let mut inner = match self.inner.write() {
                Ok(g) => g,
                Err(_) => return,
            };
            if inner.is_valid(server, self.settings.cache_duration())
                && inner.tools.get(server).map(Vec::len) == Some(tools.len())
            {
                debug!(server, count = tools.len(), "tools already cached");
                return;
            }
            if tools.len() > self.settings.max_cache_size {
                if inner.overflow_warned.insert(server.to_string()) {
                    warn!(
                        server,
                        count = tools.len(),
                        max = self.settings.max_cache_size,
                        "tool list exceeds max_cache_size, truncating"
                    );
                }
                tools.truncate(self.settings.max_cache_size);
            }
            if let Some(old) = inner.tools.get(server) {
                let old_metrics: HashMap<&str, &PerformanceMetrics> = old
                    .iter()
                    .map(|t| (t.name.as_str(), &t.performance_metrics))
                    .collect();
                for tool in &mut tools {
                    if let Some(metrics) = old_metrics.get(tool.name.as_str()) {
                        tool.performance_metrics = (*metrics).clone();
                    }
                }
            }
            if !inner.tools.contains_key(server) {
                inner.order.push(server.to_string());
            }
            let count = tools.len();
            inner.tools.insert(server.to_string(), tools);
            inner.stamps.insert(server.to_string(), Utc::now());
            if let Some(status) = inner.status.get_mut(server) {
                status.tools_count = count;
                status.last_ping = Some(Utc::now());
            }
            debug!(server, count, "cached server tools");
            self.snapshot_if_persisting(&inner)
        };
        self.publish(snapshot);
    }

    /// Returns the cached list iff it is still within `cache_duration`.
    pub fn get_cached_tools(&self, server: &str) -> Option<Vec<ToolInfo>> {
        let inner = self.inner.read().ok()?;
        if !inner.is_valid(server, self.settings.cache_duration()) {
            return None;
        }
        inner.tools.get(server).cloned()
    }

    pub fn is_cache_valid(&self, server: &str) -> bool {
        self.inner
            .read()
            .map(|inner| inner.is_valid(server, self.settings.cache_duration()))
            .unwrap_or(false)
    }

    /// All still-valid entries, in server insertion order.
    pub fn all_cached_tools(&self) -> Vec<(String, Vec<ToolInfo>)> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        inner
            .order
            .iter()
            .filter(|s| inner.is_valid(s, self.settings.cache_duration()))
            .filter_map(|s| inner.tools.get(s).map(|t| (s.clone(), t.clone())))
            .collect()
    }

    /// Every cached tool name in server insertion order (validity ignored);
    /// used for "known tools" listings in routing failures.
    pub fn all_tool_names(&self) -> Vec<String> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        inner
            .order
            .iter()
            .filter_map(|s| inner.tools.get(s))
            .flatten()
            .map(|t| t.name.clone())
            .collect()
    }

    /// First match scanning servers in insertion order. When two servers
    /// advertise the same name, the earlier-cached server wins *here*; the
    /// manager's routing table is the authority for call routing and is
    /// last-writer-wins.
    pub fn get_tool_by_name(&self, name: &str) -> Option<ToolInfo> {
        let inner = self.inner.read().ok()?;
        inner
            .order
            .iter()
            .filter_map(|s| inner.tools.get(s))
            .flatten()
            .find(|t| t.name == name)
            .cloned()
    }

    pub fn update_server_status(&self, status: ServerStatus) {
        let snapshot = {
            let mut inner = match self.inner.write() {
                Ok(g) => g,
                Err(_) => return,
            };
            debug!(server = %status.name, state = ?status.state, "updated server status");
            if !inner.tools.contains_key(&status.name) && !inner.order.contains(&status.name) {
                inner.order.push(status.name.clone());
            }
            inner.status.insert(status.name.clone(), status);
            self.snapshot_if_persisting(&inner)
        };
        self.publish(snapshot);
    }

    pub fn get_server_status(&self, name: &str) -> Option<ServerStatus> {
        self.inner.read().ok()?.status.get(name).cloned()
    }

    pub fn all_server_status(&self) -> HashMap<String, ServerStatus> {
        self.inner
            .read()
            .map(|inner| inner.status.clone())
            .unwrap_or_default()
    }

    /// Folds one call result into the named tool's metrics and the global
    /// aggregate. Unknown names are ignored (the call never resolved).
    pub fn update_tool_performance(&self, name: &str, success: bool, response_time: f64) {
        let snapshot = {
            let mut inner = match self.inner.write() {
                Ok(g) => g,
                Err(_) => return,
            };
            let order = inner.order.clone();
            let mut found = false;
            'servers: for server in &order {
                if let Some(tools) = inner.tools.get_mut(server) {
                    for tool in tools.iter_mut() {
                        if tool.name == name {
                            tool.performance_metrics.record_call(success, response_time);
                            found = true;
                            break 'servers;
                        }
                    }
                }
            }
            if !found {
                return;
            }
            inner.global.record_call(success, response_time);
            debug!(tool = name, success, response_time, "updated tool performance");
            self.snapshot_if_persisting(&inner)
        };
        self.publish(snapshot);
    }

    /// Drops one server's entries, or everything (statuses and global metrics
    /// included) when `server` is `None`.
    pub fn clear_cache(&self, server: Option<&str>) {
        let snapshot = {
            let mut inner = match self.inner.write() {
                Ok(g) => g,
                Err(_) => return,
            };
            match server {
                Some(name) => {
                    inner.tools.remove(name);
                    inner.stamps.remove(name);
                    inner.order.retain(|s| s != name);
                    info!(server = name, "cleared cache");
                }
                None => {
                    inner.tools.clear();
                    inner.stamps.clear();
                    inner.status.clear();
                    inner.order.clear();
                    inner.global = PerformanceMetrics::default();
                    info!("cleared all cache");
                }
            }
            self.snapshot_if_persisting(&inner)
        };
        self.publish(snapshot);
    }

    pub fn performance_summary(&self) -> PerformanceSummary {
        let Ok(inner) = self.inner.read() else {
            return PerformanceSummary::default();
        };
        let mut summary = PerformanceSummary {
            global: inner.global.clone(),
            ..PerformanceSummary::default()
        };
        for server in &inner.order {
            if !inner.is_valid(server, self.settings.cache_duration()) {
                continue;
            }
            let Some(tools) = inner.tools.get(server) else {
                continue;
            };
            summary.servers_cached += 1;
            summary.total_tools += tools.len();
            let total_calls = tools.iter().map(|t| t.performance_metrics.total_calls).sum();
            let avg_success_rate = if tools.is_empty() {
                0.0
            } else {
                tools
                    .iter()
                    .map(|t| t.performance_metrics.success_rate)
                    .sum::<f64>()
                    / tools.len() as f64
            };
            summary.servers.insert(
                server.clone(),
                ServerPerformance {
                    tools_count: tools.len(),
                    total_calls,
                    avg_success_rate,
                },
            );
        }
        summary
    }

    /// Seconds since the most recent cache refresh, if any.
    pub fn cache_age_secs(&self) -> Option<f64> {
        let inner = self.inner.read().ok()?;
        inner
            .stamps
            .values()
            .map(|stamp| {
                Utc::now()
                    .signed_duration_since(*stamp)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64()
            })
            .fold(None, |acc: Option<f64>, age| {
                Some(acc.map_or(age, |a| a.min(age)))
            })
    }

    /// Current state as a snapshot (also used by the persistence writer).
    pub fn snapshot(&self) -> CacheSnapshot {
        self.inner
            .read()
            .map(|inner| snapshot_from_inner(&inner))
            .unwrap_or_else(|_| CacheSnapshot::empty())
    }

    fn snapshot_if_persisting(&self, inner: &CacheInner) -> Option<CacheSnapshot> {
        self.dirty_tx.as_ref().map(|_| snapshot_from_inner(inner))
    }

    fn publish(&self, snapshot: Option<CacheSnapshot>) {
        if let (Some(tx), Some(snapshot)) = (&self.dirty_tx, snapshot) {
            let _ = tx.send(snapshot);
        }
    }

    /// Stops the writer task after draining pending snapshots.
    pub async fn shutdown(&self) {
        let handle = self.writer.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            // Give the writer a moment to drain pending snapshots, then stop it.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            handle.abort();
        }
    }
}

fn snapshot_from_inner(inner: &CacheInner) -> CacheSnapshot {
    CacheSnapshot {
        metadata_version: persist::METADATA_VERSION.to_string(),
        last_updated: Utc::now(),
        tool_metadata: inner.tools.clone(),
        server_status: inner.status.clone(),
        cache_timestamps: inner.stamps.clone(),
        global_performance: inner.global.clone(),
    }
}

fn inner_from_snapshot(snapshot: CacheSnapshot) -> CacheInner {
    let mut order: Vec<String> = snapshot.tool_metadata.keys().cloned().collect();
    order.sort();
    for name in snapshot.server_status.keys() {
        if !order.contains(name) {
            order.push(name.clone());
        }
    }
    CacheInner {
        order,
        tools: snapshot.tool_metadata,
        status: snapshot.server_status,
        stamps: snapshot.cache_timestamps,
        global: snapshot.global_performance,
        overflow_warned: HashSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> Arc<ToolCache> {
        ToolCache::new(CacheSettings::default())
    }

    fn tool(name: &str, server: &str) -> ToolInfo {
        ToolInfo::new(name, format!("{} tool", name), server, json!({}), "unknown")
    }

    #[test]
    fn metrics_ema_follows_documented_rule() {
        let mut m = PerformanceMetrics::default();
        m.record_call(true, 1.0);
        m.record_call(true, 2.0);
        assert!((m.success_rate - 1.0).abs() < 1e-9);
        assert!((m.avg_response_time - 1.2).abs() < 1e-9);
        assert_eq!(m.total_calls, 2);
        assert_eq!(m.successful_calls, 2);
    }

    #[test]
    fn metrics_success_rate_is_success_over_total() {
        let mut m = PerformanceMetrics::default();
        m.record_call(true, 0.5);
        m.record_call(false, 0.5);
        m.record_call(false, 0.5);
        assert_eq!(m.total_calls, 3);
        assert!((m.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.failed_calls, 2);
    }

    #[test]
    fn cached_tools_expire_after_duration() {
        let c = ToolCache::new(CacheSettings {
            cache_duration: 0.0,
            ..CacheSettings::default()
        });
        c.cache_server_tools("fs", vec![tool("read_file", "fs")]);
        assert!(!c.is_cache_valid("fs"));
        assert!(c.get_cached_tools("fs").is_none());
    }

    #[test]
    fn valid_cache_returns_tools() {
        let c = cache();
        c.cache_server_tools("fs", vec![tool("read_file", "fs")]);
        assert!(c.is_cache_valid("fs"));
        let tools = c.get_cached_tools("fs").unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "read_file");
    }

    /// **Scenario**: re-caching an identically-sized list while the entry is
    /// still valid is a no-op, so accumulated metrics are untouched.
    #[test]
    fn same_size_recache_is_idempotent() {
        let c = cache();
        c.cache_server_tools("fs", vec![tool("read_file", "fs")]);
        c.update_tool_performance("read_file", true, 1.0);
        c.cache_server_tools("fs", vec![tool("read_file", "fs")]);
        let tools = c.get_cached_tools("fs").unwrap();
        assert_eq!(tools[0].performance_metrics.total_calls, 1);
    }

    /// **Scenario**: a refresh with a different tool count replaces the list,
    /// but metrics for a tool that still exists survive.
    #[test]
    fn metrics_survive_refresh_for_same_tool() {
        let c = cache();
        c.cache_server_tools("fs", vec![tool("read_file", "fs")]);
        c.update_tool_performance("read_file", true, 1.0);
        c.cache_server_tools(
            "fs",
            vec![tool("read_file", "fs"), tool("write_file", "fs")],
        );
        let tools = c.get_cached_tools("fs").unwrap();
        let read = tools.iter().find(|t| t.name == "read_file").unwrap();
        assert_eq!(read.performance_metrics.total_calls, 1);
        let write = tools.iter().find(|t| t.name == "write_file").unwrap();
        assert_eq!(write.performance_metrics.total_calls, 0);
    }

    #[test]
    fn oversized_lists_are_truncated() {
        let c = ToolCache::new(CacheSettings {
            max_cache_size: 2,
            ..CacheSettings::default()
        });
        c.cache_server_tools(
            "big",
            vec![tool("a", "big"), tool("b", "big"), tool("c", "big")],
        );
        assert_eq!(c.get_cached_tools("big").unwrap().len(), 2);
    }

    #[test]
    fn get_tool_by_name_scans_in_insertion_order() {
        let c = cache();
        c.cache_server_tools("first", vec![tool("dup", "first")]);
        c.cache_server_tools("second", vec![tool("dup", "second")]);
        let found = c.get_tool_by_name("dup").unwrap();
        assert_eq!(found.server_name, "first");
    }

    #[test]
    fn update_tool_performance_also_updates_global() {
        let c = cache();
        c.cache_server_tools("fs", vec![tool("read_file", "fs")]);
        c.update_tool_performance("read_file", true, 1.0);
        c.update_tool_performance("read_file", false, 3.0);
        let summary = c.performance_summary();
        assert_eq!(summary.global.total_calls, 2);
        assert!((summary.global.success_rate - 0.5).abs() < 1e-9);
        assert_eq!(summary.servers["fs"].total_calls, 2);
    }

    #[test]
    fn unknown_tool_performance_update_is_ignored() {
        let c = cache();
        c.update_tool_performance("ghost", true, 1.0);
        assert_eq!(c.performance_summary().global.total_calls, 0);
    }

    #[test]
    fn clear_cache_single_server_and_all() {
        let c = cache();
        c.cache_server_tools("a", vec![tool("t1", "a")]);
        c.cache_server_tools("b", vec![tool("t2", "b")]);
        c.clear_cache(Some("a"));
        assert!(c.get_cached_tools("a").is_none());
        assert!(c.get_cached_tools("b").is_some());
        c.clear_cache(None);
        assert!(c.all_cached_tools().is_empty());
    }

    #[test]
    fn server_status_round_trip() {
        let c = cache();
        c.update_server_status(ServerStatus::connected("fs", TransportKind::Stdio));
        let status = c.get_server_status("fs").unwrap();
        assert_eq!(status.state, ServerState::Connected);

        c.update_server_status(ServerStatus::error("web", TransportKind::Http, "down"));
        let status = c.get_server_status("web").unwrap();
        assert_eq!(status.state, ServerState::Error);
        assert_eq!(status.error_message.as_deref(), Some("down"));
    }

    #[test]
    fn status_tools_count_follows_cached_list() {
        let c = cache();
        c.update_server_status(ServerStatus::connected("fs", TransportKind::Stdio));
        c.cache_server_tools("fs", vec![tool("read_file", "fs"), tool("write_file", "fs")]);
        assert_eq!(c.get_server_status("fs").unwrap().tools_count, 2);
    }
}
