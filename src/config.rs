//! Runtime configuration.
//!
//! Each component owns a plain, `serde`-derived config struct with a
//! [`Default`] impl matching the documented defaults. [`RuntimeConfig`]
//! aggregates all of them into a single value that can be loaded from, or
//! saved to, one JSON document.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Storage (C1) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_document_size: u64,
    pub max_total_size: u64,
    pub compression_enabled: bool,
    pub compression_threshold: u64,
    pub checksum_enabled: bool,
    pub auto_cleanup: bool,
    pub cleanup_interval: Duration,
    pub max_age: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_document_size: 10 * 1024 * 1024,
            max_total_size: 1024 * 1024 * 1024,
            compression_enabled: true,
            compression_threshold: 1024,
            checksum_enabled: true,
            auto_cleanup: true,
            cleanup_interval: Duration::from_secs(3600),
            max_age: None,
        }
    }
}

/// SnapshotManager (C2) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub auto_snapshot_enabled: bool,
    pub auto_snapshot_interval: Duration,
    pub operations_per_snapshot: u64,
    pub delta_enabled: bool,
    pub delta_threshold: f64,
    pub max_snapshots_per_document: usize,
    pub max_snapshot_age: Duration,
    pub keep_hourly: usize,
    pub keep_daily: usize,
    pub compress_snapshots: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            auto_snapshot_enabled: true,
            auto_snapshot_interval: Duration::from_secs(300),
            operations_per_snapshot: 100,
            delta_enabled: true,
            delta_threshold: 0.3,
            max_snapshots_per_document: 50,
            max_snapshot_age: Duration::from_secs(7 * 24 * 3600),
            keep_hourly: 24,
            keep_daily: 7,
            compress_snapshots: true,
        }
    }
}

/// SessionManager (C4) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub session_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_sessions_per_user: usize,
    pub max_documents_per_session: usize,
    pub idle_sweep_interval: Duration,
    pub expiry_sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(24 * 3600),
            idle_timeout: Duration::from_secs(30 * 60),
            max_sessions_per_user: 10,
            max_documents_per_session: 50,
            idle_sweep_interval: Duration::from_secs(60),
            expiry_sweep_interval: Duration::from_secs(60),
        }
    }
}

/// LockManager (C5) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_timeout: Duration,
    pub max_lock_duration: Duration,
    pub max_locks_per_user: usize,
    pub max_locks_per_document: usize,
    pub enable_queuing: bool,
    pub queue_timeout: Duration,
    pub max_queue_length: usize,
    pub heartbeat_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5 * 60),
            max_lock_duration: Duration::from_secs(3600),
            max_locks_per_user: 50,
            max_locks_per_document: 100,
            enable_queuing: true,
            queue_timeout: Duration::from_secs(30),
            max_queue_length: 1024,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// ConflictManager (C6) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub default_strategy: crate::conflict::ResolutionStrategy,
    pub auto_resolve_timeout: Duration,
    pub max_conflicts_per_document: usize,
    pub conflict_history_ttl: Duration,
    pub merge_timeout: Duration,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            default_strategy: crate::conflict::ResolutionStrategy::LastWriterWins,
            auto_resolve_timeout: Duration::from_secs(30),
            max_conflicts_per_document: 100,
            conflict_history_ttl: Duration::from_secs(24 * 3600),
            merge_timeout: Duration::from_secs(5),
        }
    }
}

/// Coordinator (C7) configuration: governs how the per-document
/// serialisation point decides when to trigger a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub concurrent_edit_threshold: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrent_edit_threshold: Duration::from_millis(1000),
        }
    }
}

/// Aggregate configuration for the whole runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub storage: StorageConfig,
    pub snapshot: SnapshotConfig,
    pub session: SessionConfig,
    pub lock: LockConfig,
    pub conflict: ConflictConfig,
    pub coordinator: CoordinatorConfig,
}

impl RuntimeConfig {
    /// Load a configuration document from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Persist this configuration as a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
