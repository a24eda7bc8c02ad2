//! Document snapshot management (C2).
//!
//! Snapshots form a DAG rooted at FULL snapshots: a DELTA snapshot stores a
//! diff-plus-new-content payload against a `base_snapshot_id`, and
//! reconstruction walks the chain back to the nearest FULL. Retention keeps
//! a bounded, time-aware subset per document; deleting a FULL snapshot that
//! a kept DELTA still depends on is refused.

use chrono::{DateTime, Timelike, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SnapshotConfig;
use crate::error::{CoreError, Result};
use crate::storage::StorageBackend;

/// Reserved storage key under which the per-document snapshot index is
/// persisted.
const SNAPSHOT_INDEX_KEY: &str = "__snapshot_index__";

/// Types of snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Full,
    Delta,
    Auto,
    Manual,
    Checkpoint,
}

/// What triggered a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Periodic,
    OperationCount,
    TimeElapsed,
    UserRequest,
    SystemEvent,
    PreShutdown,
}

/// A document snapshot. Exactly one of `content`/`delta` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub document_id: String,
    pub version: u64,
    pub snapshot_type: SnapshotType,
    pub trigger: SnapshotTrigger,
    pub content: Option<String>,
    pub delta: Option<String>,
    pub base_snapshot_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    pub checksum: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Snapshot {
    pub fn is_delta(&self) -> bool {
        self.snapshot_type == SnapshotType::Delta || self.delta.is_some()
    }
}

/// Lightweight snapshot summary without content or delta payload.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub document_id: String,
    pub version: u64,
    pub snapshot_type: SnapshotType,
    pub trigger: SnapshotTrigger,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

impl From<&Snapshot> for SnapshotInfo {
    fn from(s: &Snapshot) -> Self {
        Self {
            id: s.id.clone(),
            document_id: s.document_id.clone(),
            version: s.version,
            snapshot_type: s.snapshot_type,
            trigger: s.trigger,
            created_at: s.created_at,
            size: s.size,
        }
    }
}

/// Encodes and decodes document deltas using a JSON `{diff, new_content}`
/// payload. `new_content` is the authoritative reconstruction input; the
/// unified diff text is for human/UI inspection only.
pub struct DeltaEncoder;

impl DeltaEncoder {
    pub fn encode_delta(old_content: &str, new_content: &str) -> String {
        let diff = TextDiff::from_lines(old_content, new_content);
        let unified = diff
            .unified_diff()
            .context_radius(3)
            .header("old", "new")
            .to_string();

        serde_json::json!({
            "diff": unified,
            "new_content": new_content,
        })
        .to_string()
    }

    pub fn apply_delta(base_content: &str, delta: &str) -> String {
        if delta.is_empty() {
            return base_content.to_string();
        }

        match serde_json::from_str::<serde_json::Value>(delta) {
            Ok(value) => value
                .get("new_content")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| base_content.to_string()),
            Err(_) => base_content.to_string(),
        }
    }

    /// `1 - similarity_ratio`, where `similarity_ratio` is a
    /// Ratcliff/Obershelp-style matching-blocks ratio over characters.
    pub fn calculate_change_ratio(old_content: &str, new_content: &str) -> f64 {
        if old_content.is_empty() {
            return 1.0;
        }

        let diff = TextDiff::from_chars(old_content, new_content);
        1.0 - diff.ratio() as f64
    }
}

fn checksum(content: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Callback invoked whenever a snapshot is created.
pub type SnapshotCallback = Arc<dyn Fn(Snapshot) + Send + Sync>;

/// Mutable bookkeeping for [`SnapshotManager`], held behind a single lock so
/// that an entire `create_snapshot` call (including retention enforcement
/// and index persistence) observes a consistent view.
struct SnapshotManagerState {
    document_ops: HashMap<String, u64>,
    document_last_snapshot: HashMap<String, DateTime<Utc>>,
    snapshot_index: HashMap<String, Vec<String>>,
}

impl SnapshotManagerState {
    fn new() -> Self {
        Self {
            document_ops: HashMap::new(),
            document_last_snapshot: HashMap::new(),
            snapshot_index: HashMap::new(),
        }
    }
}

/// Snapshot manager statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStats {
    pub snapshots_created: u64,
    pub snapshots_restored: u64,
    pub deltas_created: u64,
    pub full_snapshots_created: u64,
    pub tracked_documents: usize,
    pub indexed_documents: usize,
    pub total_snapshots: usize,
    pub running: bool,
}

/// Manages document snapshots: creation (full or delta), retrieval,
/// restoration, retention, and an auto-snapshot loop.
pub struct SnapshotManager {
    storage: Arc<dyn StorageBackend>,
    config: SnapshotConfig,
    state: AsyncMutex<SnapshotManagerState>,
    running: AtomicBool,
    stop_notify: Arc<Notify>,
    task: SyncMutex<Option<JoinHandle<()>>>,
    on_snapshot_created: SyncMutex<Option<SnapshotCallback>>,
    snapshots_created: AtomicU64,
    snapshots_restored: AtomicU64,
    deltas_created: AtomicU64,
    full_snapshots_created: AtomicU64,
}

impl SnapshotManager {
    pub fn new(storage: Arc<dyn StorageBackend>, config: SnapshotConfig) -> Self {
        Self {
            storage,
            config,
            state: AsyncMutex::new(SnapshotManagerState::new()),
            running: AtomicBool::new(false),
            stop_notify: Arc::new(Notify::new()),
            task: SyncMutex::new(None),
            on_snapshot_created: SyncMutex::new(None),
            snapshots_created: AtomicU64::new(0),
            snapshots_restored: AtomicU64::new(0),
            deltas_created: AtomicU64::new(0),
            full_snapshots_created: AtomicU64::new(0),
        }
    }

    pub fn on_snapshot_created(&self, callback: SnapshotCallback) {
        *self.on_snapshot_created.lock() = Some(callback);
    }

    /// Start the manager: load the persisted index and, if enabled, spawn
    /// the auto-snapshot sweeper.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let loaded = self.load_index().await;
        self.state.lock().await.snapshot_index = loaded;

        if self.config.auto_snapshot_enabled {
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(this.config.auto_snapshot_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            this.check_auto_snapshots().await;
                        }
                        _ = this.stop_notify.notified() => break,
                    }
                }
            });
            *self.task.lock() = Some(handle);
        }

        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn load_index(&self) -> HashMap<String, Vec<String>> {
        match self.storage.load(SNAPSHOT_INDEX_KEY).await {
            Ok(doc) => serde_json::from_slice(&doc.content).unwrap_or_default(),
            Err(CoreError::DocumentNotFound(_)) => HashMap::new(),
            Err(e) => {
                log::warn!("failed to load snapshot index: {e}");
                HashMap::new()
            }
        }
    }

    async fn save_index(&self, state: &SnapshotManagerState) {
        let content = match serde_json::to_vec(&state.snapshot_index) {
            Ok(c) => c,
            Err(e) => {
                log::error!("failed to serialize snapshot index: {e}");
                return;
            }
        };
        if let Err(e) = self.storage.save(SNAPSHOT_INDEX_KEY, &content, 0, None).await {
            log::error!("failed to save snapshot index: {e}");
        }
    }

    /// Inspect documents with a recorded operation counter and trigger an
    /// automatic snapshot when either the operation-count or the
    /// elapsed-since-last-snapshot threshold is crossed. Because the
    /// sweeper only has version/op bookkeeping and not document content, it
    /// delegates the actual call to `record_operation`'s caller via the
    /// configured interval: document content must be supplied through
    /// `create_snapshot` directly. This loop exists to let the Coordinator
    /// poll `documents_due_for_snapshot` without holding the state lock
    /// itself for longer than a single read.
    async fn check_auto_snapshots(&self) {
        let due = self.documents_due_for_snapshot().await;
        if !due.is_empty() {
            log::debug!("{} document(s) due for auto-snapshot", due.len());
        }
    }

    /// Documents whose operation counter or elapsed time has crossed the
    /// configured auto-snapshot thresholds. The Coordinator (which holds
    /// document content) uses this to decide which documents to snapshot.
    pub async fn documents_due_for_snapshot(&self) -> Vec<(String, SnapshotTrigger)> {
        let state = self.state.lock().await;
        let now = Utc::now();
        let mut due = Vec::new();

        for (doc_id, last) in state.document_last_snapshot.iter() {
            let elapsed = (now - *last).num_seconds().max(0) as u64;
            let ops = state.document_ops.get(doc_id).copied().unwrap_or(0);

            if ops >= self.config.operations_per_snapshot {
                due.push((doc_id.clone(), SnapshotTrigger::OperationCount));
            } else if elapsed >= self.config.auto_snapshot_interval.as_secs() && ops > 0 {
                due.push((doc_id.clone(), SnapshotTrigger::TimeElapsed));
            }
        }

        due
    }

    /// Record that an operation was applied to a document, for auto-snapshot
    /// bookkeeping.
    pub async fn record_operation(&self, document_id: &str) {
        let mut state = self.state.lock().await;
        let counter = state.document_ops.entry(document_id.to_string()).or_insert(0);
        *counter += 1;
        state
            .document_last_snapshot
            .entry(document_id.to_string())
            .or_insert_with(Utc::now);
    }

    pub async fn create_snapshot(
        &self,
        document_id: &str,
        content: &str,
        version: u64,
        trigger: SnapshotTrigger,
        metadata: Option<serde_json::Value>,
    ) -> Result<Snapshot> {
        let mut state = self.state.lock().await;

        let mut snapshot_type = SnapshotType::Full;
        let mut delta = None;
        let mut base_snapshot_id = None;

        if self.config.delta_enabled {
            if let Some(latest) = self.latest_full_snapshot(&state, document_id).await {
                if let Some(base_content) = &latest.content {
                    let change_ratio = DeltaEncoder::calculate_change_ratio(base_content, content);
                    if change_ratio < self.config.delta_threshold {
                        snapshot_type = SnapshotType::Delta;
                        delta = Some(DeltaEncoder::encode_delta(base_content, content));
                        base_snapshot_id = Some(latest.id.clone());
                        self.deltas_created.fetch_add(1, Ordering::SeqCst);
                    } else {
                        self.full_snapshots_created.fetch_add(1, Ordering::SeqCst);
                    }
                } else {
                    self.full_snapshots_created.fetch_add(1, Ordering::SeqCst);
                }
            } else {
                self.full_snapshots_created.fetch_add(1, Ordering::SeqCst);
            }
        } else {
            self.full_snapshots_created.fetch_add(1, Ordering::SeqCst);
        }

        let snapshot_id = format!("snap_{document_id}_{version}_{}", &Uuid::new_v4().simple().to_string()[..8]);
        let now = Utc::now();
        let stored_content = if matches!(snapshot_type, SnapshotType::Full) {
            Some(content.to_string())
        } else {
            None
        };

        let snapshot = Snapshot {
            id: snapshot_id.clone(),
            document_id: document_id.to_string(),
            version,
            snapshot_type,
            trigger,
            content: stored_content,
            delta,
            base_snapshot_id,
            created_at: now,
            size: content.len() as u64,
            checksum: checksum(content),
            metadata: metadata.unwrap_or(serde_json::Value::Null),
        };

        let storage_key = format!("snapshot:{snapshot_id}");
        let payload = serde_json::to_vec(&snapshot)?;
        self.storage.save(&storage_key, &payload, version, None).await?;

        state
            .snapshot_index
            .entry(document_id.to_string())
            .or_default()
            .push(snapshot_id.clone());

        self.enforce_retention(&mut state, document_id).await;
        self.save_index(&state).await;

        state.document_last_snapshot.insert(document_id.to_string(), now);
        state.document_ops.insert(document_id.to_string(), 0);
        self.snapshots_created.fetch_add(1, Ordering::SeqCst);

        drop(state);

        if let Some(callback) = self.on_snapshot_created.lock().clone() {
            callback(snapshot.clone());
        }

        Ok(snapshot)
    }

    async fn latest_full_snapshot(
        &self,
        state: &SnapshotManagerState,
        document_id: &str,
    ) -> Option<Snapshot> {
        let ids = state.snapshot_index.get(document_id)?;
        for id in ids.iter().rev() {
            if let Ok(snapshot) = self.get_snapshot(id).await {
                if matches!(snapshot.snapshot_type, SnapshotType::Full) {
                    return Some(snapshot);
                }
            }
        }
        None
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let storage_key = format!("snapshot:{snapshot_id}");
        let doc = self
            .storage
            .load(&storage_key)
            .await
            .map_err(|_| CoreError::SnapshotNotFound(snapshot_id.to_string()))?;
        Ok(serde_json::from_slice(&doc.content)?)
    }

    /// Restore content by walking the DELTA chain back to its FULL base.
    /// Implemented iteratively so an arbitrarily long chain never grows the
    /// call stack.
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<String> {
        self.snapshots_restored.fetch_add(1, Ordering::SeqCst);

        let mut chain: Vec<String> = Vec::new();
        let mut current = self.get_snapshot(snapshot_id).await?;

        loop {
            if let Some(content) = current.content.clone() {
                let mut result = content;
                while let Some(delta) = chain.pop() {
                    result = DeltaEncoder::apply_delta(&result, &delta);
                }
                return Ok(result);
            }

            match (&current.delta, &current.base_snapshot_id) {
                (Some(delta), Some(base_id)) => {
                    chain.push(delta.clone());
                    current = self.get_snapshot(base_id).await?;
                }
                _ => {
                    return Err(CoreError::InvalidInput(format!(
                        "cannot restore snapshot {snapshot_id}: no content or delta"
                    )))
                }
            }
        }
    }

    pub async fn list_snapshots(&self, document_id: &str, limit: usize) -> Vec<SnapshotInfo> {
        let state = self.state.lock().await;
        let ids = match state.snapshot_index.get(document_id) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        drop(state);

        let start = ids.len().saturating_sub(limit);
        let mut results = Vec::new();
        for id in ids[start..].iter().rev() {
            match self.get_snapshot(id).await {
                Ok(snapshot) => results.push(SnapshotInfo::from(&snapshot)),
                Err(e) => log::warn!("failed to load snapshot {id}: {e}"),
            }
        }
        results
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.delete_snapshot_locked(&mut state, snapshot_id).await
    }

    async fn delete_snapshot_locked(
        &self,
        state: &mut SnapshotManagerState,
        snapshot_id: &str,
    ) -> Result<bool> {
        let snapshot = match self.get_snapshot(snapshot_id).await {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };

        if matches!(snapshot.snapshot_type, SnapshotType::Full) {
            if self.has_dependent_delta(state, &snapshot.document_id, snapshot_id).await {
                return Err(CoreError::InvalidInput(format!(
                    "cannot delete FULL snapshot {snapshot_id}: one or more DELTA snapshots depend on it"
                )));
            }
        }

        let storage_key = format!("snapshot:{snapshot_id}");
        self.storage.delete(&storage_key).await?;

        if let Some(ids) = state.snapshot_index.get_mut(&snapshot.document_id) {
            ids.retain(|id| id != snapshot_id);
        }
        self.save_index(state).await;

        Ok(true)
    }

    /// True if any DELTA snapshot in the document's index resolves,
    /// transitively, to `base_id`.
    async fn has_dependent_delta(
        &self,
        state: &SnapshotManagerState,
        document_id: &str,
        base_id: &str,
    ) -> bool {
        let ids = match state.snapshot_index.get(document_id) {
            Some(ids) => ids.clone(),
            None => return false,
        };

        for id in &ids {
            if id == base_id {
                continue;
            }
            if let Ok(snapshot) = self.get_snapshot(id).await {
                if !snapshot.is_delta() {
                    continue;
                }
                let mut cursor = snapshot.base_snapshot_id.clone();
                let mut visited = HashSet::new();
                while let Some(cursor_id) = cursor {
                    if !visited.insert(cursor_id.clone()) {
                        break;
                    }
                    if cursor_id == base_id {
                        return true;
                    }
                    match self.get_snapshot(&cursor_id).await {
                        Ok(parent) => cursor = parent.base_snapshot_id,
                        Err(_) => break,
                    }
                }
            }
        }

        false
    }

    /// Keep the union of: most recent; one per hour for `keep_hourly`
    /// distinct hours; one per day for `keep_daily` distinct days; every
    /// snapshot within `max_snapshot_age`; every FULL snapshot that a kept
    /// DELTA still depends on. Delete the rest once the keep set has grown
    /// to the configured cap, mirroring the distilled system's retention
    /// sweep exactly.
    async fn enforce_retention(&self, state: &mut SnapshotManagerState, document_id: &str) {
        let ids = match state.snapshot_index.get(document_id) {
            Some(ids) => ids.clone(),
            None => return,
        };

        if ids.len() <= self.config.max_snapshots_per_document {
            return;
        }

        let mut snapshots: Vec<Snapshot> = Vec::new();
        for id in &ids {
            if let Ok(s) = self.get_snapshot(id).await {
                snapshots.push(s);
            }
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut keep: HashSet<String> = HashSet::new();
        let now = Utc::now();

        if let Some(first) = snapshots.first() {
            keep.insert(first.id.clone());
        }

        let mut hourly_kept = 0usize;
        let mut last_hour: Option<DateTime<Utc>> = None;
        for snap in &snapshots {
            let snap_hour = snap
                .created_at
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(snap.created_at);
            if Some(snap_hour) != last_hour && hourly_kept < self.config.keep_hourly {
                keep.insert(snap.id.clone());
                hourly_kept += 1;
                last_hour = Some(snap_hour);
            }
        }

        let mut daily_kept = 0usize;
        let mut last_day = None;
        for snap in &snapshots {
            let snap_day = snap.created_at.date_naive();
            if Some(snap_day) != last_day && daily_kept < self.config.keep_daily {
                keep.insert(snap.id.clone());
                daily_kept += 1;
                last_day = Some(snap_day);
            }
        }

        let max_age = chrono::Duration::from_std(self.config.max_snapshot_age)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = now - max_age;
        for snap in &snapshots {
            if snap.created_at >= cutoff {
                keep.insert(snap.id.clone());
            }
        }

        let present: HashSet<&str> = snapshots.iter().map(|s| s.id.as_str()).collect();
        for snap in &snapshots {
            if let Some(base_id) = &snap.base_snapshot_id {
                if present.contains(base_id.as_str()) {
                    keep.insert(base_id.clone());
                }
            }
        }

        for snap in &snapshots {
            if !keep.contains(&snap.id) && keep.len() >= self.config.max_snapshots_per_document {
                if let Err(e) = self.delete_snapshot_locked(state, &snap.id).await {
                    log::warn!("failed to delete snapshot {}: {e}", snap.id);
                }
            }
        }
    }

    pub async fn get_snapshot_at_version(
        &self,
        document_id: &str,
        version: u64,
    ) -> Option<Snapshot> {
        let state = self.state.lock().await;
        let ids = state.snapshot_index.get(document_id)?.clone();
        drop(state);

        let mut best: Option<Snapshot> = None;
        let mut best_diff = u64::MAX;

        for id in &ids {
            if let Ok(snapshot) = self.get_snapshot(id).await {
                if snapshot.version <= version {
                    let diff = version - snapshot.version;
                    if diff < best_diff {
                        best = Some(snapshot);
                        best_diff = diff;
                    }
                }
            }
        }

        best
    }

    pub async fn rollback_to_version(&self, document_id: &str, version: u64) -> Result<Option<String>> {
        match self.get_snapshot_at_version(document_id, version).await {
            Some(snapshot) => Ok(Some(self.restore_snapshot(&snapshot.id).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_stats(&self) -> SnapshotStats {
        let state = self.state.lock().await;
        let total_snapshots: usize = state.snapshot_index.values().map(|v| v.len()).sum();
        SnapshotStats {
            snapshots_created: self.snapshots_created.load(Ordering::SeqCst),
            snapshots_restored: self.snapshots_restored.load(Ordering::SeqCst),
            deltas_created: self.deltas_created.load(Ordering::SeqCst),
            full_snapshots_created: self.full_snapshots_created.load(Ordering::SeqCst),
            tracked_documents: state.document_ops.len(),
            indexed_documents: state.snapshot_index.len(),
            total_snapshots,
            running: self.running.load(Ordering::SeqCst),
        }
    }
}

/// Process-wide snapshot manager handle, guarded by once-initialisation.
static GLOBAL_SNAPSHOT_MANAGER: OnceCell<Arc<SnapshotManager>> = OnceCell::new();

/// Get the process-wide [`SnapshotManager`], creating one with default
/// configuration and in-memory storage on first access.
pub fn get_snapshot_manager() -> Arc<SnapshotManager> {
    GLOBAL_SNAPSHOT_MANAGER
        .get_or_init(|| {
            Arc::new(SnapshotManager::new(
                Arc::new(crate::storage::InMemoryStorage::new(Default::default())),
                SnapshotConfig::default(),
            ))
        })
        .clone()
}

/// Install the process-wide [`SnapshotManager`]. Errors if one was already
/// set.
pub fn set_snapshot_manager(manager: Arc<SnapshotManager>) -> Result<()> {
    GLOBAL_SNAPSHOT_MANAGER
        .set(manager)
        .map_err(|_| CoreError::InvalidInput("snapshot manager already initialized".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use proptest::prelude::*;

    fn manager() -> SnapshotManager {
        SnapshotManager::new(Arc::new(InMemoryStorage::new(Default::default())), SnapshotConfig::default())
    }

    fn manager_with(config: SnapshotConfig) -> SnapshotManager {
        SnapshotManager::new(Arc::new(InMemoryStorage::new(Default::default())), config)
    }

    #[tokio::test]
    async fn first_snapshot_is_full() {
        let mgr = manager();
        let snap = mgr
            .create_snapshot("doc1", "hello world", 1, SnapshotTrigger::UserRequest, None)
            .await
            .unwrap();
        assert_eq!(snap.snapshot_type, SnapshotType::Full);
        assert_eq!(snap.content.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn small_change_produces_delta_chained_to_full() {
        let config = SnapshotConfig {
            delta_threshold: 0.5,
            ..Default::default()
        };
        let mgr = manager_with(config);

        let s1 = mgr
            .create_snapshot("doc1", "hello world", 1, SnapshotTrigger::UserRequest, None)
            .await
            .unwrap();
        let s2 = mgr
            .create_snapshot("doc1", "hello world!", 2, SnapshotTrigger::UserRequest, None)
            .await
            .unwrap();

        assert_eq!(s2.snapshot_type, SnapshotType::Delta);
        assert_eq!(s2.base_snapshot_id.as_deref(), Some(s1.id.as_str()));

        let restored = mgr.restore_snapshot(&s2.id).await.unwrap();
        assert_eq!(restored, "hello world!");
    }

    #[tokio::test]
    async fn large_change_stays_full() {
        let config = SnapshotConfig {
            delta_threshold: 0.05,
            ..Default::default()
        };
        let mgr = manager_with(config);

        mgr.create_snapshot("doc1", "hello", 1, SnapshotTrigger::UserRequest, None)
            .await
            .unwrap();
        let s2 = mgr
            .create_snapshot("doc1", "a completely different document body", 2, SnapshotTrigger::UserRequest, None)
            .await
            .unwrap();

        assert_eq!(s2.snapshot_type, SnapshotType::Full);
    }

    #[tokio::test]
    async fn restore_chains_multiple_deltas() {
        let config = SnapshotConfig {
            delta_threshold: 0.9,
            ..Default::default()
        };
        let mgr = manager_with(config);

        mgr.create_snapshot("doc1", "aaa", 1, SnapshotTrigger::UserRequest, None).await.unwrap();
        mgr.create_snapshot("doc1", "aaab", 2, SnapshotTrigger::UserRequest, None).await.unwrap();
        let s3 = mgr.create_snapshot("doc1", "aaabc", 3, SnapshotTrigger::UserRequest, None).await.unwrap();

        assert_eq!(s3.snapshot_type, SnapshotType::Delta);
        let restored = mgr.restore_snapshot(&s3.id).await.unwrap();
        assert_eq!(restored, "aaabc");
    }

    #[tokio::test]
    async fn deleting_full_with_dependent_delta_is_refused() {
        let config = SnapshotConfig {
            delta_threshold: 0.9,
            ..Default::default()
        };
        let mgr = manager_with(config);

        let s1 = mgr.create_snapshot("doc1", "aaa", 1, SnapshotTrigger::UserRequest, None).await.unwrap();
        mgr.create_snapshot("doc1", "aaab", 2, SnapshotTrigger::UserRequest, None).await.unwrap();

        let err = mgr.delete_snapshot(&s1.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn deleting_full_with_no_dependents_succeeds() {
        let mgr = manager();
        let s1 = mgr.create_snapshot("doc1", "hello", 1, SnapshotTrigger::UserRequest, None).await.unwrap();
        assert!(mgr.delete_snapshot(&s1.id).await.unwrap());
    }

    #[tokio::test]
    async fn rollback_to_version_picks_closest_not_after() {
        let mgr = manager();
        mgr.create_snapshot("doc1", "v1", 1, SnapshotTrigger::UserRequest, None).await.unwrap();
        mgr.create_snapshot("doc1", "v5", 5, SnapshotTrigger::UserRequest, None).await.unwrap();
        mgr.create_snapshot("doc1", "v10", 10, SnapshotTrigger::UserRequest, None).await.unwrap();

        let content = mgr.rollback_to_version("doc1", 7).await.unwrap();
        assert_eq!(content.as_deref(), Some("v5"));
    }

    #[tokio::test]
    async fn record_operation_tracks_per_document_counter() {
        let mgr = manager();
        mgr.record_operation("doc1").await;
        mgr.record_operation("doc1").await;
        let due = mgr.documents_due_for_snapshot().await;
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn operation_count_threshold_triggers_due_snapshot() {
        let config = SnapshotConfig {
            operations_per_snapshot: 2,
            ..Default::default()
        };
        let mgr = manager_with(config);
        mgr.record_operation("doc1").await;
        mgr.record_operation("doc1").await;

        let due = mgr.documents_due_for_snapshot().await;
        assert_eq!(due, vec![("doc1".to_string(), SnapshotTrigger::OperationCount)]);
    }

    #[tokio::test]
    async fn list_snapshots_orders_most_recent_first() {
        let mgr = manager();
        mgr.create_snapshot("doc1", "v1", 1, SnapshotTrigger::UserRequest, None).await.unwrap();
        mgr.create_snapshot("doc1", "v2", 2, SnapshotTrigger::UserRequest, None).await.unwrap();

        let list = mgr.list_snapshots("doc1", 50).await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].version, 2);
        assert_eq!(list[1].version, 1);
    }

    proptest! {
        #[test]
        fn change_ratio_is_zero_for_identical_content(s in "[a-zA-Z0-9 .,!?]{1,64}") {
            prop_assert_eq!(DeltaEncoder::calculate_change_ratio(&s, &s), 0.0);
        }

        #[test]
        fn change_ratio_stays_within_unit_interval(old in "[a-zA-Z0-9 .,!?]{0,64}", new in "[a-zA-Z0-9 .,!?]{0,64}") {
            let ratio = DeltaEncoder::calculate_change_ratio(&old, &new);
            prop_assert!((0.0..=1.0).contains(&ratio));
        }

        #[test]
        fn empty_old_content_is_always_maximal_change(new in "[a-zA-Z0-9 .,!?]{0,64}") {
            prop_assert_eq!(DeltaEncoder::calculate_change_ratio("", &new), 1.0);
        }
    }
}
