//! Conflict detection and strategy-based resolution (C6).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::ConflictConfig;
use crate::error::{CoreError, Result};

/// Kinds of conflicts the detector can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ConcurrentEdit,
    VersionMismatch,
    DeleteUpdate,
    StructureChange,
    PermissionChange,
    LockViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Pluggable conflict resolution strategies, keyed to a handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LastWriterWins,
    FirstWriterWins,
    Merge,
    Manual,
    Reject,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    Detected,
    Resolving,
    Resolved,
    Failed,
}

/// One of the operations participating in a recorded conflict. `operation`
/// is opaque to this module — it is interpreted only by the detector's
/// range-overlap heuristics and by resolution handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictingOperation {
    pub id: String,
    pub user_id: String,
    pub client_id: String,
    pub operation: serde_json::Value,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A recorded conflict. Immutable once `state == Resolved`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub document_id: String,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub state: ConflictState,
    pub operations: Vec<ConflictingOperation>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_strategy: Option<ResolutionStrategy>,
    pub resolution_result: Option<serde_json::Value>,
    pub resolver_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionResult {
    pub success: bool,
    pub conflict_id: String,
    pub strategy_used: ResolutionStrategy,
    pub winning_operation: Option<ConflictingOperation>,
    pub merged_operation: Option<serde_json::Value>,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ResolutionResult {
    fn failure(conflict_id: &str, strategy: ResolutionStrategy, message: impl Into<String>) -> Self {
        Self {
            success: false,
            conflict_id: conflict_id.to_string(),
            strategy_used: strategy,
            winning_operation: None,
            merged_operation: None,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// A pluggable handler for one resolution strategy.
#[async_trait]
pub trait ResolutionHandler: Send + Sync {
    async fn resolve(&self, conflict: &Conflict, context: Option<&serde_json::Value>) -> ResolutionResult;
}

struct LastWriterWinsHandler;

#[async_trait]
impl ResolutionHandler for LastWriterWinsHandler {
    async fn resolve(&self, conflict: &Conflict, _context: Option<&serde_json::Value>) -> ResolutionResult {
        match conflict.operations.iter().max_by_key(|op| op.timestamp) {
            Some(winner) => ResolutionResult {
                success: true,
                conflict_id: conflict.id.clone(),
                strategy_used: ResolutionStrategy::LastWriterWins,
                winning_operation: Some(winner.clone()),
                merged_operation: None,
                message: format!("selected operation from user {}", winner.user_id),
                metadata: serde_json::Value::Null,
            },
            None => ResolutionResult::failure(&conflict.id, ResolutionStrategy::LastWriterWins, "no operations to resolve"),
        }
    }
}

struct FirstWriterWinsHandler;

#[async_trait]
impl ResolutionHandler for FirstWriterWinsHandler {
    async fn resolve(&self, conflict: &Conflict, _context: Option<&serde_json::Value>) -> ResolutionResult {
        match conflict.operations.iter().min_by_key(|op| op.timestamp) {
            Some(winner) => ResolutionResult {
                success: true,
                conflict_id: conflict.id.clone(),
                strategy_used: ResolutionStrategy::FirstWriterWins,
                winning_operation: Some(winner.clone()),
                merged_operation: None,
                message: format!("selected operation from user {}", winner.user_id),
                metadata: serde_json::Value::Null,
            },
            None => ResolutionResult::failure(&conflict.id, ResolutionStrategy::FirstWriterWins, "no operations to resolve"),
        }
    }
}

/// A pluggable merge function. The default wraps operations rather than
/// performing a true text-level merge — the original implementation's
/// behaviour, kept verbatim per design note §9.
pub type MergeFn = Box<dyn Fn(&[serde_json::Value]) -> std::result::Result<serde_json::Value, String> + Send + Sync>;

pub struct MergeHandler {
    merge_fn: MergeFn,
}

impl MergeHandler {
    pub fn new(merge_fn: MergeFn) -> Self {
        Self { merge_fn }
    }

    fn default_merge(operations: &[serde_json::Value]) -> std::result::Result<serde_json::Value, String> {
        Ok(serde_json::json!({
            "type": "batch",
            "operations": operations,
            "merged": true,
        }))
    }
}

impl Default for MergeHandler {
    fn default() -> Self {
        Self::new(Box::new(Self::default_merge))
    }
}

#[async_trait]
impl ResolutionHandler for MergeHandler {
    async fn resolve(&self, conflict: &Conflict, _context: Option<&serde_json::Value>) -> ResolutionResult {
        if conflict.operations.is_empty() {
            return ResolutionResult::failure(&conflict.id, ResolutionStrategy::Merge, "no operations to merge");
        }

        let operations: Vec<serde_json::Value> = conflict.operations.iter().map(|op| op.operation.clone()).collect();
        match (self.merge_fn)(&operations) {
            Ok(merged) => ResolutionResult {
                success: true,
                conflict_id: conflict.id.clone(),
                strategy_used: ResolutionStrategy::Merge,
                winning_operation: None,
                merged_operation: Some(merged),
                message: format!("merged {} operations", operations.len()),
                metadata: serde_json::Value::Null,
            },
            Err(e) => ResolutionResult::failure(&conflict.id, ResolutionStrategy::Merge, format!("merge failed: {e}")),
        }
    }
}

struct RejectHandler;

#[async_trait]
impl ResolutionHandler for RejectHandler {
    async fn resolve(&self, conflict: &Conflict, _context: Option<&serde_json::Value>) -> ResolutionResult {
        ResolutionResult {
            success: true,
            conflict_id: conflict.id.clone(),
            strategy_used: ResolutionStrategy::Reject,
            winning_operation: None,
            merged_operation: None,
            message: format!("rejected {} conflicting operations", conflict.operations.len()),
            metadata: serde_json::json!({ "rejected_count": conflict.operations.len() }),
        }
    }
}

fn operation_range(op: &serde_json::Value) -> (i64, i64) {
    let pos = op
        .get("position")
        .or_else(|| op.get("pos"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let length = op
        .get("length")
        .or_else(|| op.get("count"))
        .and_then(|v| v.as_i64())
        .or_else(|| op.get("text").and_then(|v| v.as_str()).map(|s| s.len() as i64))
        .unwrap_or(0);
    (pos, pos + length)
}

fn ranges_overlap(a: (i64, i64), b: (i64, i64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn operation_document_id(op: &serde_json::Value) -> String {
    op.get("document_id").and_then(|v| v.as_str()).unwrap_or("unknown").to_string()
}

fn operation_type(op: &serde_json::Value) -> &str {
    op.get("type").and_then(|v| v.as_str()).unwrap_or("")
}

fn generate_conflict_id(document_id: &str, operations: &[ConflictingOperation]) -> String {
    let ids: Vec<&str> = operations.iter().map(|op| op.id.as_str()).collect();
    let content = format!("{}:{}", document_id, ids.join(":"));
    let digest = hex::encode(Sha256::digest(content.as_bytes()));
    format!("conflict_{}", &digest[..12])
}

/// Pure detection functions over pairs of [`ConflictingOperation`].
pub struct ConflictDetector;

impl ConflictDetector {
    fn build(
        document_id: String,
        conflict_type: ConflictType,
        severity: ConflictSeverity,
        operations: Vec<ConflictingOperation>,
        metadata: serde_json::Value,
    ) -> Conflict {
        let id = generate_conflict_id(&document_id, &operations);
        Conflict {
            id,
            document_id,
            conflict_type,
            severity,
            state: ConflictState::Detected,
            operations,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution_strategy: None,
            resolution_result: None,
            resolver_id: None,
            metadata,
        }
    }

    /// `|op1.ts - op2.ts| <= threshold_ms AND op1.version == op2.version AND ranges overlap`.
    pub fn detect_concurrent_edit(
        op1: &ConflictingOperation,
        op2: &ConflictingOperation,
        threshold_ms: i64,
    ) -> Option<Conflict> {
        let diff_ms = (op1.timestamp - op2.timestamp).num_milliseconds().abs();
        if diff_ms <= threshold_ms
            && op1.version == op2.version
            && ranges_overlap(operation_range(&op1.operation), operation_range(&op2.operation))
        {
            return Some(Self::build(
                operation_document_id(&op1.operation),
                ConflictType::ConcurrentEdit,
                ConflictSeverity::Medium,
                vec![op1.clone(), op2.clone()],
                serde_json::Value::Null,
            ));
        }
        None
    }

    pub fn detect_version_mismatch(
        operation: &ConflictingOperation,
        expected_version: u64,
        current_version: u64,
    ) -> Option<Conflict> {
        if operation.version != expected_version {
            return Some(Self::build(
                operation_document_id(&operation.operation),
                ConflictType::VersionMismatch,
                ConflictSeverity::High,
                vec![operation.clone()],
                serde_json::json!({
                    "expected_version": expected_version,
                    "actual_version": operation.version,
                    "current_version": current_version,
                }),
            ));
        }
        None
    }

    pub fn detect_delete_update(
        delete_op: &ConflictingOperation,
        update_op: &ConflictingOperation,
    ) -> Option<Conflict> {
        let is_delete = operation_type(&delete_op.operation) == "delete";
        let is_update = matches!(operation_type(&update_op.operation), "insert" | "replace" | "retain");

        if is_delete
            && is_update
            && ranges_overlap(operation_range(&delete_op.operation), operation_range(&update_op.operation))
        {
            return Some(Self::build(
                operation_document_id(&delete_op.operation),
                ConflictType::DeleteUpdate,
                ConflictSeverity::High,
                vec![delete_op.clone(), update_op.clone()],
                serde_json::Value::Null,
            ));
        }
        None
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ConflictStats {
    pub total_conflicts: usize,
    pub active_conflicts: usize,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub conflicts_failed: u64,
    pub documents_with_conflicts: usize,
    pub resolution_rate: f64,
}

/// Callback fired when a conflict is first recorded.
pub type OnConflictDetected = Box<dyn Fn(Conflict) + Send + Sync>;
/// Callback fired when a conflict finishes resolving (successfully or not).
pub type OnConflictResolved = Box<dyn Fn(Conflict, ResolutionResult) + Send + Sync>;

/// Coordinates detection, recording, capacity management, and
/// strategy-based resolution of conflicts.
pub struct ConflictManager {
    config: ConflictConfig,
    conflicts: AsyncMutex<std::collections::HashMap<String, Conflict>>,
    document_conflicts: AsyncMutex<std::collections::HashMap<String, Vec<String>>>,
    handlers: DashMap<ResolutionStrategy, Arc<dyn ResolutionHandler>>,
    on_conflict_detected: parking_lot::Mutex<Option<OnConflictDetected>>,
    on_conflict_resolved: parking_lot::Mutex<Option<OnConflictResolved>>,
    conflicts_detected: std::sync::atomic::AtomicU64,
    conflicts_resolved: std::sync::atomic::AtomicU64,
    conflicts_failed: std::sync::atomic::AtomicU64,
}

impl ConflictManager {
    pub fn new(config: ConflictConfig) -> Self {
        let handlers: DashMap<ResolutionStrategy, Arc<dyn ResolutionHandler>> = DashMap::new();
        handlers.insert(ResolutionStrategy::LastWriterWins, Arc::new(LastWriterWinsHandler));
        handlers.insert(ResolutionStrategy::FirstWriterWins, Arc::new(FirstWriterWinsHandler));
        handlers.insert(ResolutionStrategy::Merge, Arc::new(MergeHandler::default()));
        handlers.insert(ResolutionStrategy::Reject, Arc::new(RejectHandler));

        Self {
            config,
            conflicts: AsyncMutex::new(std::collections::HashMap::new()),
            document_conflicts: AsyncMutex::new(std::collections::HashMap::new()),
            handlers,
            on_conflict_detected: parking_lot::Mutex::new(None),
            on_conflict_resolved: parking_lot::Mutex::new(None),
            conflicts_detected: std::sync::atomic::AtomicU64::new(0),
            conflicts_resolved: std::sync::atomic::AtomicU64::new(0),
            conflicts_failed: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn on_conflict_detected(&self, callback: OnConflictDetected) {
        *self.on_conflict_detected.lock() = Some(callback);
    }

    pub fn on_conflict_resolved(&self, callback: OnConflictResolved) {
        *self.on_conflict_resolved.lock() = Some(callback);
    }

    pub fn register_handler(&self, strategy: ResolutionStrategy, handler: Arc<dyn ResolutionHandler>) {
        self.handlers.insert(strategy, handler);
    }

    /// Detect a concurrent-edit conflict and record it if found.
    pub async fn detect_and_record(
        &self,
        op1: &ConflictingOperation,
        op2: &ConflictingOperation,
    ) -> Option<Conflict> {
        let conflict = ConflictDetector::detect_concurrent_edit(op1, op2, 1000)?;
        self.record_conflict(conflict.clone()).await;
        Some(conflict)
    }

    pub async fn record_conflict(&self, conflict: Conflict) {
        {
            let mut conflicts = self.conflicts.lock().await;
            let mut doc_conflicts = self.document_conflicts.lock().await;

            let entry = doc_conflicts.entry(conflict.document_id.clone()).or_default();
            if entry.len() >= self.config.max_conflicts_per_document {
                let oldest = entry.remove(0);
                conflicts.remove(&oldest);
            }

            conflicts.insert(conflict.id.clone(), conflict.clone());
            entry.push(conflict.id.clone());

            self.conflicts_detected.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        if let Some(cb) = self.on_conflict_detected.lock().as_ref() {
            cb(conflict);
        }
    }

    pub async fn get_conflict(&self, conflict_id: &str) -> Option<Conflict> {
        self.conflicts.lock().await.get(conflict_id).cloned()
    }

    pub async fn get_document_conflicts(&self, document_id: &str, state: Option<ConflictState>) -> Vec<Conflict> {
        let ids = self
            .document_conflicts
            .lock()
            .await
            .get(document_id)
            .cloned()
            .unwrap_or_default();
        let conflicts = self.conflicts.lock().await;
        ids.iter()
            .filter_map(|id| conflicts.get(id))
            .filter(|c| state.map(|s| c.state == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn get_unresolved_conflicts(&self, document_id: &str) -> Vec<Conflict> {
        self.get_document_conflicts(document_id, Some(ConflictState::Detected)).await
    }

    /// Resolve a conflict with the given strategy (or the configured
    /// default), bounded by `auto_resolve_timeout`.
    pub async fn resolve(
        &self,
        conflict_id: &str,
        strategy: Option<ResolutionStrategy>,
        resolver_id: Option<String>,
        context: Option<serde_json::Value>,
    ) -> ResolutionResult {
        let strategy = strategy.unwrap_or(self.config.default_strategy);

        let conflict = match self.conflicts.lock().await.get(conflict_id).cloned() {
            Some(c) => c,
            None => return ResolutionResult::failure(conflict_id, strategy, "conflict not found"),
        };

        if conflict.state == ConflictState::Resolved {
            return ResolutionResult::failure(conflict_id, strategy, "conflict already resolved");
        }

        let handler = match self.handlers.get(&strategy) {
            Some(h) => Arc::clone(h.value()),
            None => return ResolutionResult::failure(conflict_id, strategy, format!("no handler for strategy: {strategy:?}")),
        };

        {
            let mut conflicts = self.conflicts.lock().await;
            if let Some(c) = conflicts.get_mut(conflict_id) {
                c.state = ConflictState::Resolving;
            }
        }

        let timeout = self.config.auto_resolve_timeout;
        let outcome = tokio::time::timeout(timeout, handler.resolve(&conflict, context.as_ref())).await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                self.mark_failed(conflict_id).await;
                return ResolutionResult::failure(conflict_id, strategy, "resolution timed out");
            }
        };

        let resolved_conflict = {
            let mut conflicts = self.conflicts.lock().await;
            let c = match conflicts.get_mut(conflict_id) {
                Some(c) => c,
                None => return ResolutionResult::failure(conflict_id, strategy, "conflict evicted during resolution"),
            };
            if result.success {
                c.state = ConflictState::Resolved;
                c.resolved_at = Some(Utc::now());
                c.resolution_strategy = Some(strategy);
                c.resolution_result = serde_json::to_value(&result).ok();
                c.resolver_id = resolver_id;
                self.conflicts_resolved.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            } else {
                c.state = ConflictState::Failed;
                self.conflicts_failed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            c.clone()
        };

        if let Some(cb) = self.on_conflict_resolved.lock().as_ref() {
            cb(resolved_conflict, result.clone());
        }

        result
    }

    async fn mark_failed(&self, conflict_id: &str) {
        let mut conflicts = self.conflicts.lock().await;
        if let Some(c) = conflicts.get_mut(conflict_id) {
            c.state = ConflictState::Failed;
        }
        self.conflicts_failed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn auto_resolve(&self, conflict_id: &str, context: Option<serde_json::Value>) -> ResolutionResult {
        self.resolve(conflict_id, Some(self.config.default_strategy), Some("system".to_string()), context).await
    }

    /// Resolve by caller-supplied winner, bypassing the handler registry.
    pub async fn manual_resolve(&self, conflict_id: &str, winner_operation_id: &str, resolver_id: &str) -> ResolutionResult {
        let (winner, resolved_conflict) = {
            let mut conflicts = self.conflicts.lock().await;
            let conflict = match conflicts.get_mut(conflict_id) {
                Some(c) => c,
                None => return ResolutionResult::failure(conflict_id, ResolutionStrategy::Manual, "conflict not found"),
            };

            let winner = match conflict.operations.iter().find(|op| op.id == winner_operation_id) {
                Some(op) => op.clone(),
                None => return ResolutionResult::failure(conflict_id, ResolutionStrategy::Manual, "winning operation not found"),
            };

            conflict.state = ConflictState::Resolved;
            conflict.resolved_at = Some(Utc::now());
            conflict.resolution_strategy = Some(ResolutionStrategy::Manual);
            conflict.resolver_id = Some(resolver_id.to_string());
            self.conflicts_resolved.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

            (winner, conflict.clone())
        };

        let result = ResolutionResult {
            success: true,
            conflict_id: conflict_id.to_string(),
            strategy_used: ResolutionStrategy::Manual,
            winning_operation: Some(winner.clone()),
            merged_operation: None,
            message: format!("manually selected operation {winner_operation_id}"),
            metadata: serde_json::Value::Null,
        };

        if let Some(c) = self.conflicts.lock().await.get_mut(conflict_id) {
            c.resolution_result = serde_json::to_value(&result).ok();
        }

        if let Some(cb) = self.on_conflict_resolved.lock().as_ref() {
            cb(resolved_conflict, result.clone());
        }

        result
    }

    pub async fn cleanup_old_conflicts(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.conflict_history_ttl).unwrap_or(chrono::Duration::zero());
        let mut conflicts = self.conflicts.lock().await;
        let mut doc_conflicts = self.document_conflicts.lock().await;

        let to_remove: Vec<String> = conflicts
            .values()
            .filter(|c| c.state == ConflictState::Resolved && c.resolved_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|c| c.id.clone())
            .collect();

        for id in &to_remove {
            if let Some(c) = conflicts.remove(id) {
                if let Some(entry) = doc_conflicts.get_mut(&c.document_id) {
                    entry.retain(|cid| cid != id);
                }
            }
        }

        to_remove.len()
    }

    pub async fn get_stats(&self) -> ConflictStats {
        let conflicts = self.conflicts.lock().await;
        let doc_conflicts = self.document_conflicts.lock().await;
        let active = conflicts
            .values()
            .filter(|c| matches!(c.state, ConflictState::Detected | ConflictState::Resolving))
            .count();
        let detected = self.conflicts_detected.load(std::sync::atomic::Ordering::SeqCst);
        let resolved = self.conflicts_resolved.load(std::sync::atomic::Ordering::SeqCst);

        ConflictStats {
            total_conflicts: conflicts.len(),
            active_conflicts: active,
            conflicts_detected: detected,
            conflicts_resolved: resolved,
            conflicts_failed: self.conflicts_failed.load(std::sync::atomic::Ordering::SeqCst),
            documents_with_conflicts: doc_conflicts.len(),
            resolution_rate: if detected > 0 { resolved as f64 / detected as f64 } else { 0.0 },
        }
    }
}

/// Process-wide [`ConflictManager`] handle, guarded by once-initialisation.
static GLOBAL_CONFLICT_MANAGER: once_cell::sync::OnceCell<Arc<ConflictManager>> = once_cell::sync::OnceCell::new();

pub fn get_conflict_manager() -> Arc<ConflictManager> {
    GLOBAL_CONFLICT_MANAGER
        .get_or_init(|| Arc::new(ConflictManager::new(ConflictConfig::default())))
        .clone()
}

pub fn set_conflict_manager(manager: Arc<ConflictManager>) -> Result<()> {
    GLOBAL_CONFLICT_MANAGER
        .set(manager)
        .map_err(|_| CoreError::InvalidInput("conflict manager already initialised".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn op(id: &str, user: &str, version: u64, ts_ms: i64, pos: i64, len: i64) -> ConflictingOperation {
        ConflictingOperation {
            id: id.to_string(),
            user_id: user.to_string(),
            client_id: format!("client-{user}"),
            operation: serde_json::json!({ "document_id": "D", "position": pos, "length": len, "type": "insert" }),
            version,
            timestamp: Utc.timestamp_millis_opt(ts_ms).unwrap(),
            metadata: serde_json::Value::Null,
        }
    }

    use chrono::TimeZone;

    #[test]
    fn detects_concurrent_edit_with_overlap() {
        let op1 = op("o1", "U1", 5, 0, 0, 5);
        let op2 = op("o2", "U2", 5, 100, 0, 5);
        let conflict = ConflictDetector::detect_concurrent_edit(&op1, &op2, 1000).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::ConcurrentEdit);
        assert_eq!(conflict.severity, ConflictSeverity::Medium);
    }

    #[test]
    fn no_conflict_without_overlap() {
        let op1 = op("o1", "U1", 5, 0, 0, 5);
        let op2 = op("o2", "U2", 5, 100, 100, 5);
        assert!(ConflictDetector::detect_concurrent_edit(&op1, &op2, 1000).is_none());
    }

    #[test]
    fn conflict_id_is_content_addressed() {
        let op1 = op("o1", "U1", 5, 0, 0, 5);
        let op2 = op("o2", "U2", 5, 100, 0, 5);
        let c1 = ConflictDetector::detect_concurrent_edit(&op1, &op2, 1000).unwrap();
        let c2 = ConflictDetector::detect_concurrent_edit(&op1, &op2, 1000).unwrap();
        assert_eq!(c1.id, c2.id);
        assert!(c1.id.starts_with("conflict_"));
    }

    #[tokio::test]
    async fn scenario_c_last_writer_wins() {
        let manager = ConflictManager::new(ConflictConfig::default());
        let op1 = op("o1", "U1", 5, 0, 0, 5);
        let op2 = op("o2", "U2", 5, 100, 0, 5);

        let conflict = manager.detect_and_record(&op1, &op2).await.unwrap();
        let result = manager.resolve(&conflict.id, Some(ResolutionStrategy::LastWriterWins), None, None).await;

        assert!(result.success);
        assert_eq!(result.winning_operation.unwrap().id, "o2");

        let stored = manager.get_conflict(&conflict.id).await.unwrap();
        assert_eq!(stored.state, ConflictState::Resolved);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let config = ConflictConfig {
            max_conflicts_per_document: 1,
            ..Default::default()
        };
        let manager = ConflictManager::new(config);

        let op1 = op("o1", "U1", 5, 0, 0, 5);
        let op2 = op("o2", "U2", 5, 100, 0, 5);
        let c1 = manager.detect_and_record(&op1, &op2).await.unwrap();

        let op3 = op("o3", "U1", 6, 1000, 0, 5);
        let op4 = op("o4", "U2", 6, 1100, 0, 5);
        manager.detect_and_record(&op3, &op4).await.unwrap();

        assert!(manager.get_conflict(&c1.id).await.is_none());
    }

    #[tokio::test]
    async fn manual_resolve_bypasses_registry() {
        let manager = ConflictManager::new(ConflictConfig::default());
        let op1 = op("o1", "U1", 5, 0, 0, 5);
        let op2 = op("o2", "U2", 5, 100, 0, 5);
        let conflict = manager.detect_and_record(&op1, &op2).await.unwrap();

        let result = manager.manual_resolve(&conflict.id, "o1", "admin").await;
        assert!(result.success);
        assert_eq!(result.winning_operation.unwrap().id, "o1");
    }

    #[tokio::test]
    async fn resolving_already_resolved_fails() {
        let manager = ConflictManager::new(ConflictConfig::default());
        let op1 = op("o1", "U1", 5, 0, 0, 5);
        let op2 = op("o2", "U2", 5, 100, 0, 5);
        let conflict = manager.detect_and_record(&op1, &op2).await.unwrap();

        manager.resolve(&conflict.id, Some(ResolutionStrategy::Reject), None, None).await;
        let second = manager.resolve(&conflict.id, Some(ResolutionStrategy::Reject), None, None).await;
        assert!(!second.success);
    }

    proptest! {
        #[test]
        fn ranges_overlap_is_symmetric(a0 in -1000i64..1000, a1 in -1000i64..1000, b0 in -1000i64..1000, b1 in -1000i64..1000) {
            prop_assert_eq!(ranges_overlap((a0, a1), (b0, b1)), ranges_overlap((b0, b1), (a0, a1)));
        }

        #[test]
        fn ranges_overlap_agrees_with_brute_force_point_scan(a0 in -50i64..50, len_a in 0i64..20, b0 in -50i64..50, len_b in 0i64..20) {
            let a = (a0, a0 + len_a);
            let b = (b0, b0 + len_b);
            let brute_force = (a.0..a.1).any(|p| p >= b.0 && p < b.1);
            prop_assert_eq!(ranges_overlap(a, b), brute_force);
        }

        #[test]
        fn operation_range_width_matches_declared_length(pos in 0i64..1000, length in 0i64..1000) {
            let value = serde_json::json!({"position": pos, "length": length});
            let (start, end) = operation_range(&value);
            prop_assert_eq!(start, pos);
            prop_assert_eq!(end - start, length);
        }
    }
}
