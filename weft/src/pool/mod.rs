//! Per-server connection pool: acquisition, reuse, idle eviction and health
//! probing for MCP transports.
//!
//! One shard (a locked `Vec` of pooled entries) exists per server; the
//! per-shard lock serialises creation so two concurrent acquires never dial
//! the same server twice. Two background workers run while the pool is
//! started: an idle cleaner that closes cold or broken entries, and a health
//! prober that runs `tools/list` with a short deadline against every active
//! entry. [`Connector`] is the seam tests use to inject fake transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PoolSettings, ServerSpec};
use crate::transport::{self, TransportConn, TransportError};

/// Deadline for the health prober's `tools/list` probe.
const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connect to '{server}': {source}")]
    Connect {
        server: String,
        #[source]
        source: TransportError,
    },
}

/// Opens transports; the production impl defers to [`transport::connect`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, spec: &ServerSpec) -> Result<Arc<dyn TransportConn>, TransportError>;
}

/// Default connector backed by the real transport adapters.
pub struct TransportConnector;

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, spec: &ServerSpec) -> Result<Arc<dyn TransportConn>, TransportError> {
        transport::connect(spec).await
    }
}

/// One pooled connection with its bookkeeping.
struct PooledConn {
    id: u64,
    conn: Arc<dyn TransportConn>,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    error_count: u32,
    active: bool,
}

impl PooledConn {
    fn healthy(&self, settings: &PoolSettings) -> bool {
        self.active
            && self.error_count < settings.max_error_count
            && self.last_used.elapsed() < settings.idle_timeout()
    }
}

/// A scoped borrow of a pooled connection. Return it with
/// [`ConnectionPool::release`]; dropping it without releasing merely skips
/// the bookkeeping update (the connection itself stays pooled).
pub struct PoolHandle {
    pub server: String,
    conn_id: u64,
    conn: Arc<dyn TransportConn>,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("server", &self.server)
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

impl PoolHandle {
    pub fn conn(&self) -> &Arc<dyn TransportConn> {
        &self.conn
    }
}

/// Per-server stats snapshot (see [`ConnectionPool::stats`]).
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct ServerPoolStats {
    pub connections: usize,
    pub active_connections: usize,
    pub total_uses: u64,
    pub avg_connection_age_secs: f64,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct PoolStats {
    pub total_pools: usize,
    pub total_connections: usize,
    pub servers: HashMap<String, ServerPoolStats>,
}

type Shard = Arc<Mutex<Vec<PooledConn>>>;

pub struct ConnectionPool {
    settings: PoolSettings,
    connector: Arc<dyn Connector>,
    shards: DashMap<String, Shard>,
    next_conn_id: AtomicU64,
    cancel: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            connector,
            shards: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Starts the idle cleaner and the health prober. Idempotent per pool
    /// (further calls add no workers once some are running).
    pub fn start(self: &Arc<Self>) {
        let mut workers = match self.workers.lock() {
            Ok(w) => w,
            Err(_) => return,
        };
        if !workers.is_empty() {
            return;
        }
        workers.push(tokio::spawn(cleanup_loop(
            Arc::downgrade(self),
            self.cancel.clone(),
        )));
        workers.push(tokio::spawn(health_loop(
            Arc::downgrade(self),
            self.cancel.clone(),
        )));
        info!("connection pool started");
    }

    /// Stops the workers and closes every pooled connection.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut w) => w.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.close_all().await;
        info!("connection pool stopped");
    }

    /// Returns a healthy pooled connection for the server, dialling a new one
    /// on miss. Bounded connect retries follow `retry_attempts` / `retry_delay`.
    pub async fn acquire(&self, spec: &ServerSpec) -> Result<PoolHandle, PoolError> {
        let shard = self.shard(&spec.name);
        let mut pool = shard.lock().await;

        if let Some(entry) = pool.iter_mut().find(|c| c.healthy(&self.settings)) {
            entry.last_used = Instant::now();
            entry.use_count += 1;
            debug!(server = %spec.name, "reusing pooled connection");
            return Ok(PoolHandle {
                server: spec.name.clone(),
                conn_id: entry.id,
                conn: Arc::clone(&entry.conn),
            });
        }

        debug!(server = %spec.name, "creating new connection");
        let conn = self.dial(spec).await?;
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        if pool.len() >= self.settings.max_connections_per_server {
            // Evict the entry that has been unused longest.
            if let Some((idx, _)) = pool
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.last_used)
            {
                let evicted = pool.swap_remove(idx);
                evicted.conn.close().await;
                debug!(server = %spec.name, "evicted oldest pooled connection");
            }
        }

        pool.push(PooledConn {
            id,
            conn: Arc::clone(&conn),
            created_at: Instant::now(),
            last_used: Instant::now(),
            use_count: 1,
            error_count: 0,
            active: true,
        });
        Ok(PoolHandle {
            server: spec.name.clone(),
            conn_id: id,
            conn,
        })
    }

    /// Returns a borrow. Errors observed during the borrow must be reported
    /// here so the health invariant can deactivate bad connections.
    pub async fn release(&self, handle: PoolHandle, had_error: bool) {
        let shard = self.shard(&handle.server);
        let mut pool = shard.lock().await;
        if let Some(entry) = pool.iter_mut().find(|c| c.id == handle.conn_id) {
            entry.last_used = Instant::now();
            if had_error {
                entry.error_count += 1;
                if entry.error_count >= self.settings.max_error_count {
                    entry.active = false;
                    warn!(server = %handle.server, "connection deactivated after repeated errors");
                }
            }
        }
    }

    /// Closes and drops every pooled connection for one server.
    pub async fn invalidate_server(&self, name: &str) {
        if let Some((_, shard)) = self.shards.remove(name) {
            let mut pool = shard.lock().await;
            for entry in pool.drain(..) {
                entry.conn.close().await;
            }
            info!(server = %name, "invalidated pooled connections");
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        let shards: Vec<(String, Shard)> = self
            .shards
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (server, shard) in shards {
            let pool = shard.lock().await;
            if pool.is_empty() {
                continue;
            }
            let entry = ServerPoolStats {
                connections: pool.len(),
                active_connections: pool.iter().filter(|c| c.active).count(),
                total_uses: pool.iter().map(|c| c.use_count).sum(),
                avg_connection_age_secs: pool
                    .iter()
                    .map(|c| c.created_at.elapsed().as_secs_f64())
                    .sum::<f64>()
                    / pool.len() as f64,
            };
            stats.total_pools += 1;
            stats.total_connections += entry.connections;
            stats.servers.insert(server, entry);
        }
        stats
    }

    /// Number of pooled connections for one server (tests and diagnostics).
    pub async fn connection_count(&self, server: &str) -> usize {
        match self.shards.get(server) {
            Some(shard) => shard.lock().await.len(),
            None => 0,
        }
    }

    /// Use count of one server's pooled connections summed (tests and diagnostics).
    pub async fn use_count(&self, server: &str) -> u64 {
        match self.shards.get(server) {
            Some(shard) => shard.lock().await.iter().map(|c| c.use_count).sum(),
            None => 0,
        }
    }

    fn shard(&self, server: &str) -> Shard {
        self.shards
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    async fn dial(&self, spec: &ServerSpec) -> Result<Arc<dyn TransportConn>, PoolError> {
        let attempts = self.settings.retry_attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.retry_delay()).await;
            }
            match self.connector.connect(spec).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(server = %spec.name, attempt, "connect failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(PoolError::Connect {
            server: spec.name.clone(),
            source: last_err.unwrap_or(TransportError::Closed),
        })
    }

    async fn close_all(&self) {
        let keys: Vec<String> = self.shards.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, shard)) = self.shards.remove(&key) {
                let mut pool = shard.lock().await;
                for entry in pool.drain(..) {
                    entry.conn.close().await;
                }
            }
        }
    }

    /// One cleaner pass: drop inactive, error-saturated and idle entries.
    async fn cleanup_idle(&self) {
        let keys: Vec<String> = self.shards.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(shard) = self.shards.get(&key).map(|s| s.clone()) else {
                continue;
            };
            let mut pool = shard.lock().await;
            let mut kept = Vec::with_capacity(pool.len());
            for entry in pool.drain(..) {
                let idle_too_long = entry.last_used.elapsed() > self.settings.idle_timeout();
                if !entry.active
                    || entry.error_count >= self.settings.max_error_count
                    || idle_too_long
                {
                    entry.conn.close().await;
                    debug!(server = %key, "cleaned up connection");
                } else {
                    kept.push(entry);
                }
            }
            *pool = kept;
            let empty = pool.is_empty();
            drop(pool);
            if empty {
                self.shards.remove_if(&key, |_, shard| {
                    shard.try_lock().map(|p| p.is_empty()).unwrap_or(false)
                });
            }
        }
    }

    /// One prober pass: `tools/list` with a short deadline against every
    /// active entry. Success clears the error count; failure increments it.
    async fn probe_health(&self) {
        let keys: Vec<String> = self.shards.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(shard) = self.shards.get(&key).map(|s| s.clone()) else {
                continue;
            };
            // Snapshot outside the probe I/O so acquires are not blocked.
            let targets: Vec<(u64, Arc<dyn TransportConn>)> = {
                let pool = shard.lock().await;
                pool.iter()
                    .filter(|c| c.active)
                    .map(|c| (c.id, Arc::clone(&c.conn)))
                    .collect()
            };
            for (id, conn) in targets {
                let ok = tokio::time::timeout(PROBE_TIMEOUT, conn.list_tools())
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                let mut pool = shard.lock().await;
                if let Some(entry) = pool.iter_mut().find(|c| c.id == id) {
                    if ok {
                        entry.error_count = 0;
                    } else {
                        entry.error_count += 1;
                        warn!(server = %key, "health check failed");
                        if entry.error_count >= self.settings.max_error_count {
                            entry.active = false;
                        }
                    }
                }
            }
        }
    }
}

async fn cleanup_loop(pool: Weak<ConnectionPool>, cancel: CancellationToken) {
    let interval = match pool.upgrade() {
        Some(p) => p.settings.health_check_interval(),
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(p) = pool.upgrade() else { break };
                p.cleanup_idle().await;
            }
        }
    }
}

async fn health_loop(pool: Weak<ConnectionPool>, cancel: CancellationToken) {
    let interval = match pool.upgrade() {
        Some(p) => p.settings.health_check_interval(),
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(p) = pool.upgrade() else { break };
                p.probe_health().await;
            }
        }
    }
}
