//! Atomic JSON persistence for the tool cache.
//!
//! Format: `metadata_version` "1.0", `last_updated` plus the four state maps,
//! with datetimes as ISO-8601 strings. Writes go to a temp file in the target
//! directory, are synced, then renamed over the target. Loading is
//! best-effort: a corrupt file is reported and the in-memory state starts
//! empty.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{PerformanceMetrics, ServerStatus, ToolInfo};

pub const METADATA_VERSION: &str = "1.0";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub metadata_version: String,
    pub last_updated: DateTime<Utc>,
    pub tool_metadata: HashMap<String, Vec<ToolInfo>>,
    pub server_status: HashMap<String, ServerStatus>,
    pub cache_timestamps: HashMap<String, DateTime<Utc>>,
    pub global_performance: PerformanceMetrics,
}

impl CacheSnapshot {
    pub fn empty() -> Self {
        Self {
            metadata_version: METADATA_VERSION.to_string(),
            last_updated: Utc::now(),
            tool_metadata: HashMap::new(),
            server_status: HashMap::new(),
            cache_timestamps: HashMap::new(),
            global_performance: PerformanceMetrics::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes temp file + sync + rename so readers only ever see a complete file.
pub fn write_atomic(path: &Path, snapshot: &CacheSnapshot) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    let json = serde_json::to_vec_pretty(snapshot)?;
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

pub fn load(path: &Path) -> Result<CacheSnapshot, SnapshotError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Single writer task: drains the dirty channel to the newest snapshot and
/// writes it off the hot path. Exits when the channel closes.
pub(crate) async fn writer_task(mut rx: mpsc::UnboundedReceiver<CacheSnapshot>, path: PathBuf) {
    while let Some(mut snapshot) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            snapshot = newer;
        }
        let target = path.clone();
        match tokio::task::spawn_blocking(move || write_atomic(&target, &snapshot)).await {
            Ok(Ok(())) => debug!(path = %path.display(), "cache snapshot written"),
            Ok(Err(e)) => warn!(path = %path.display(), "failed to persist cache: {}", e),
            Err(e) => warn!("cache writer task panicked: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ServerState, ToolCache};
    use crate::config::{CacheSettings, TransportKind};
    use serde_json::json;

    fn sample_snapshot() -> CacheSnapshot {
        let mut snapshot = CacheSnapshot::empty();
        let mut tool = ToolInfo::new(
            "read_file",
            "Read file content",
            "fs",
            json!({"type": "object"}),
            "file_operations",
        );
        tool.performance_metrics.record_call(true, 1.0);
        snapshot.tool_metadata.insert("fs".into(), vec![tool]);
        snapshot
            .server_status
            .insert("fs".into(), ServerStatus::connected("fs", TransportKind::Stdio));
        snapshot.cache_timestamps.insert("fs".into(), Utc::now());
        snapshot.global_performance.record_call(true, 1.0);
        snapshot
    }

    /// **Scenario**: writing a snapshot and reading it back yields an equal
    /// JSON structure after canonicalisation.
    #[test]
    fn snapshot_round_trip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let snapshot = sample_snapshot();

        write_atomic(&path, &snapshot).unwrap();
        let loaded = load(&path).unwrap();

        let before = serde_json::to_value(&snapshot).unwrap();
        let after = serde_json::to_value(&loaded).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        write_atomic(&path, &sample_snapshot()).unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["cache.json".to_string()]);
    }

    #[test]
    fn load_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load(&path), Err(SnapshotError::Json(_))));
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_discarded_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "garbage").unwrap();

        let cache = ToolCache::new(CacheSettings {
            persist_cache: true,
            cache_file: Some(path),
            ..CacheSettings::default()
        });
        assert!(cache.all_cached_tools().is_empty());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn mutations_reach_disk_via_writer_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = ToolCache::new(CacheSettings {
            persist_cache: true,
            cache_file: Some(path.clone()),
            ..CacheSettings::default()
        });

        cache.cache_server_tools(
            "fs",
            vec![ToolInfo::new("read_file", "reads", "fs", json!({}), "file_operations")],
        );

        // The writer runs off the hot path; poll briefly for the file.
        let mut loaded = None;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if let Ok(snapshot) = load(&path) {
                loaded = Some(snapshot);
                break;
            }
        }
        let snapshot = loaded.expect("snapshot file never appeared");
        assert_eq!(snapshot.metadata_version, METADATA_VERSION);
        assert!(snapshot.tool_metadata.contains_key("fs"));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let settings = CacheSettings {
            persist_cache: true,
            cache_file: Some(path.clone()),
            ..CacheSettings::default()
        };

        {
            let cache = ToolCache::new(settings.clone());
            cache.cache_server_tools(
                "fs",
                vec![ToolInfo::new("read_file", "reads", "fs", json!({}), "file_operations")],
            );
            cache.update_tool_performance("read_file", true, 1.5);
            for _ in 0..50 {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                if load(&path).is_ok() {
                    break;
                }
            }
            cache.shutdown().await;
        }

        let reborn = ToolCache::new(settings);
        let tool = reborn.get_tool_by_name("read_file").expect("tool persisted");
        assert_eq!(tool.server_name, "fs");
        let status = reborn.get_server_status("fs");
        assert!(status.is_none() || matches!(status.unwrap().state, ServerState::Connected));
        reborn.shutdown().await;
    }
}
