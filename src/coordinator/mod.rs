//! Per-document serialisation point wiring C1–C6 together (C7).
//!
//! The Coordinator is the only component that mutates document content. It
//! resolves identity through the SessionManager, gates writes through the
//! AccessController and LockManager, detects conflicts through the
//! ConflictManager under a per-document mutex, and feeds the SnapshotManager
//! so autosnapshotting has something to trigger against.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::access::{AccessController, Permission};
use crate::conflict::{Conflict, ConflictDetector, ConflictManager, ConflictingOperation, ResolutionResult};
use crate::config::CoordinatorConfig;
use crate::error::{CoreError, Result};
use crate::lock::LockManager;
use crate::session::{Session, SessionManager};
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::storage::StorageManager;

/// An opaque edit operation. `op_type` drives how it is applied to content
/// (`insert`, `delete`, `replace`, `retain`); `position`/`field` are read by
/// the LockManager's scope checks and by conflict-range overlap detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub op_type: String,
    pub position: Option<i64>,
    pub length: Option<i64>,
    pub field: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Outcome of [`Coordinator::apply_operation`].
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub success: bool,
    pub new_version: Option<u64>,
    pub conflict: Option<Conflict>,
    pub message: String,
}

/// Events published by the Coordinator. Each variant carries the fully
/// materialised entity at the time of the event.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    SessionCreated(Session),
    SessionTerminated(Session),
    LockAcquired(crate::lock::Lock),
    LockReleased(crate::lock::Lock),
    LockExpired(crate::lock::Lock),
    ConflictDetected(Conflict),
    ConflictResolved(Conflict, ResolutionResult),
    SnapshotCreated(Snapshot),
    AccessGranted {
        user_id: String,
        document_id: String,
        permission: Permission,
    },
    InvitationSent(crate::access::Invitation),
    OperationApplied {
        document_id: String,
        user_id: String,
        operation_id: String,
        new_version: u64,
    },
}

pub type CoordinatorEventCallback = Box<dyn Fn(CoordinatorEvent) + Send + Sync>;

fn emit(callbacks: &SyncMutex<Vec<CoordinatorEventCallback>>, event: CoordinatorEvent) {
    for callback in callbacks.lock().iter() {
        callback(event.clone());
    }
}

/// In-memory view of a document's current content plus the last applied
/// operation, used for both version-mismatch detection and classifying a
/// mismatch as a true concurrent edit (two near-simultaneous writers) versus
/// a stale write against an older version.
struct DocumentState {
    content: String,
    version: u64,
    last_operation: Option<ConflictingOperation>,
}

/// Aggregate statistics across the operations the Coordinator has applied.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub operations_applied: u64,
    pub operations_rejected: u64,
    pub tracked_documents: usize,
    pub running: bool,
}

/// Wires Storage (C1), SnapshotManager (C2), AccessController (C3),
/// SessionManager (C4), LockManager (C5), and ConflictManager (C6) behind a
/// single `ApplyOperation` entry point.
pub struct Coordinator {
    config: CoordinatorConfig,
    storage: Arc<StorageManager>,
    snapshots: Arc<SnapshotManager>,
    access: Arc<AccessController>,
    sessions: Arc<SessionManager>,
    locks: Arc<LockManager>,
    conflicts: Arc<ConflictManager>,
    documents: DashMap<String, Arc<AsyncMutex<DocumentState>>>,
    event_callbacks: Arc<SyncMutex<Vec<CoordinatorEventCallback>>>,
    running: AtomicBool,
    operations_applied: AtomicU64,
    operations_rejected: AtomicU64,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        storage: Arc<StorageManager>,
        snapshots: Arc<SnapshotManager>,
        access: Arc<AccessController>,
        sessions: Arc<SessionManager>,
        locks: Arc<LockManager>,
        conflicts: Arc<ConflictManager>,
    ) -> Self {
        let event_callbacks: Arc<SyncMutex<Vec<CoordinatorEventCallback>>> = Arc::new(SyncMutex::new(Vec::new()));

        {
            let events = Arc::clone(&event_callbacks);
            sessions.on_session_created(Box::new(move |s: &Session| {
                emit(&events, CoordinatorEvent::SessionCreated(s.clone()));
            }));
        }
        {
            let events = Arc::clone(&event_callbacks);
            let locks_for_cascade = Arc::clone(&locks);
            sessions.on_session_terminated(Box::new(move |s: &Session| {
                emit(&events, CoordinatorEvent::SessionTerminated(s.clone()));
                let locks_for_cascade = Arc::clone(&locks_for_cascade);
                let session_id = s.id.to_string();
                tokio::spawn(async move {
                    locks_for_cascade.release_session_locks(&session_id).await;
                });
            }));
        }
        {
            let events = Arc::clone(&event_callbacks);
            locks.on_lock_acquired(Box::new(move |l: &crate::lock::Lock| {
                emit(&events, CoordinatorEvent::LockAcquired(l.clone()));
            }));
        }
        {
            let events = Arc::clone(&event_callbacks);
            locks.on_lock_released(Box::new(move |l: &crate::lock::Lock| {
                emit(&events, CoordinatorEvent::LockReleased(l.clone()));
            }));
        }
        {
            let events = Arc::clone(&event_callbacks);
            locks.on_lock_expired(Box::new(move |l: &crate::lock::Lock| {
                emit(&events, CoordinatorEvent::LockExpired(l.clone()));
            }));
        }
        {
            let events = Arc::clone(&event_callbacks);
            conflicts.on_conflict_detected(Box::new(move |c: Conflict| {
                emit(&events, CoordinatorEvent::ConflictDetected(c));
            }));
        }
        {
            let events = Arc::clone(&event_callbacks);
            conflicts.on_conflict_resolved(Box::new(move |c: Conflict, r: ResolutionResult| {
                emit(&events, CoordinatorEvent::ConflictResolved(c, r));
            }));
        }
        {
            let events = Arc::clone(&event_callbacks);
            snapshots.on_snapshot_created(Arc::new(move |s: Snapshot| {
                emit(&events, CoordinatorEvent::SnapshotCreated(s));
            }));
        }
        {
            let events = Arc::clone(&event_callbacks);
            access.on_access_granted(Box::new(move |user_id: &str, document_id: &str, permission: Permission| {
                emit(
                    &events,
                    CoordinatorEvent::AccessGranted {
                        user_id: user_id.to_string(),
                        document_id: document_id.to_string(),
                        permission,
                    },
                );
            }));
        }
        {
            let events = Arc::clone(&event_callbacks);
            access.on_invitation_sent(Box::new(move |invitation: &crate::access::Invitation| {
                emit(&events, CoordinatorEvent::InvitationSent(invitation.clone()));
            }));
        }

        Self {
            config,
            storage,
            snapshots,
            access,
            sessions,
            locks,
            conflicts,
            documents: DashMap::new(),
            event_callbacks,
            running: AtomicBool::new(false),
            operations_applied: AtomicU64::new(0),
            operations_rejected: AtomicU64::new(0),
        }
    }

    pub fn on_event(&self, callback: CoordinatorEventCallback) {
        self.event_callbacks.lock().push(callback);
    }

    /// Spawn the background sweepers owned by C1/C2/C4/C5 as supervised
    /// tasks.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.storage.start();
        self.sessions.start();
        self.locks.start();

        let snapshots = Arc::clone(&self.snapshots);
        tokio::spawn(async move {
            if let Err(e) = snapshots.start().await {
                log::error!("snapshot manager failed to start: {e}");
            }
        });
    }

    /// Signal and join every background sweeper.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.storage.stop();
        self.sessions.stop().await;
        self.locks.stop().await;
        self.snapshots.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn create_document(&self, document_id: &str, owner_id: &str) -> Result<()> {
        self.access.create_document(document_id, owner_id, Permission::NONE).await;
        self.storage.save(document_id, b"", 0, None).await?;
        self.documents.insert(
            document_id.to_string(),
            Arc::new(AsyncMutex::new(DocumentState {
                content: String::new(),
                version: 0,
                last_operation: None,
            })),
        );
        Ok(())
    }

    async fn document_handle(&self, document_id: &str) -> Arc<AsyncMutex<DocumentState>> {
        if let Some(entry) = self.documents.get(document_id) {
            return Arc::clone(entry.value());
        }

        let state = match self.storage.load(document_id).await {
            Ok(doc) => DocumentState {
                content: String::from_utf8_lossy(&doc.content).into_owned(),
                version: doc.metadata.version,
                last_operation: None,
            },
            Err(_) => DocumentState {
                content: String::new(),
                version: 0,
                last_operation: None,
            },
        };

        let entry = self
            .documents
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(state)));
        Arc::clone(entry.value())
    }

    pub async fn get_document_content(&self, document_id: &str) -> Result<String> {
        let handle = self.document_handle(document_id).await;
        let content = handle.lock().await.content.clone();
        Ok(content)
    }

    pub async fn get_document_version(&self, document_id: &str) -> Result<u64> {
        let handle = self.document_handle(document_id).await;
        let version = handle.lock().await.version;
        Ok(version)
    }

    /// Apply an operation following the contract: resolve identity, check
    /// access, check locks, detect and resolve version conflicts under the
    /// document's serialisation point, apply, and notify observers.
    pub async fn apply_operation(
        &self,
        document_id: &str,
        session_id: Uuid,
        operation: Operation,
        base_version: u64,
    ) -> Result<ApplyResult> {
        let session = self
            .sessions
            .get_session(session_id)
            .await
            .ok_or(CoreError::SessionNotFound(session_id))?;
        self.sessions.update_activity(session_id).await;
        let user_id = session.user_id.clone();

        if !self.access.can_access(&user_id, document_id, Permission::WRITE).await {
            self.operations_rejected.fetch_add(1, Ordering::SeqCst);
            return Err(CoreError::PermissionDenied {
                user: user_id,
                document_id: document_id.to_string(),
                required: Permission::WRITE.bits(),
            });
        }

        if !self
            .locks
            .can_edit(document_id, &user_id, operation.position, operation.field.as_deref())
            .await
        {
            self.operations_rejected.fetch_add(1, Ordering::SeqCst);
            return Err(CoreError::LockViolation {
                document_id: document_id.to_string(),
            });
        }

        let handle = self.document_handle(document_id).await;
        let mut doc = handle.lock().await;

        let mut conflict_record = None;

        if base_version != doc.version {
            let attempted = ConflictingOperation {
                id: operation.id.clone(),
                user_id: user_id.clone(),
                client_id: session.client_id.clone(),
                operation: operation_json(document_id, &operation),
                version: base_version,
                timestamp: Utc::now(),
                metadata: serde_json::Value::Null,
            };

            let threshold_ms = self.config.concurrent_edit_threshold.as_millis() as i64;
            let detected = doc
                .last_operation
                .as_ref()
                .and_then(|prev| ConflictDetector::detect_concurrent_edit(prev, &attempted, threshold_ms))
                .or_else(|| ConflictDetector::detect_version_mismatch(&attempted, doc.version, doc.version));

            if let Some(conflict) = detected {
                self.conflicts.record_conflict(conflict.clone()).await;
                let resolution = self.conflicts.auto_resolve(&conflict.id, None).await;
                conflict_record = self.conflicts.get_conflict(&conflict.id).await;

                if !resolution.success {
                    self.operations_rejected.fetch_add(1, Ordering::SeqCst);
                    return Ok(ApplyResult {
                        success: false,
                        new_version: None,
                        conflict: conflict_record,
                        message: resolution.message,
                    });
                }
            }
        }

        let new_content = apply_to_content(&doc.content, &operation)?;
        doc.content = new_content;
        doc.version += 1;
        let new_version = doc.version;
        doc.last_operation = Some(ConflictingOperation {
            id: operation.id.clone(),
            user_id: user_id.clone(),
            client_id: session.client_id.clone(),
            operation: operation_json(document_id, &operation),
            version: new_version,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        });

        self.storage.save(document_id, doc.content.as_bytes(), new_version, None).await?;
        self.snapshots.record_operation(document_id).await;

        let content_for_snapshot = doc.content.clone();
        drop(doc);

        self.operations_applied.fetch_add(1, Ordering::SeqCst);

        emit(
            &self.event_callbacks,
            CoordinatorEvent::OperationApplied {
                document_id: document_id.to_string(),
                user_id: user_id.clone(),
                operation_id: operation.id.clone(),
                new_version,
            },
        );

        let due_trigger = self
            .snapshots
            .documents_due_for_snapshot()
            .await
            .into_iter()
            .find(|(doc_id, _)| doc_id == document_id)
            .map(|(_, trigger)| trigger);

        if let Some(trigger) = due_trigger {
            if let Err(e) = self
                .snapshots
                .create_snapshot(document_id, &content_for_snapshot, new_version, trigger, None)
                .await
            {
                log::warn!("auto-snapshot failed for {document_id}: {e}");
            }
        }

        Ok(ApplyResult {
            success: true,
            new_version: Some(new_version),
            conflict: conflict_record,
            message: "applied".to_string(),
        })
    }

    pub async fn get_stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            operations_applied: self.operations_applied.load(Ordering::SeqCst),
            operations_rejected: self.operations_rejected.load(Ordering::SeqCst),
            tracked_documents: self.documents.len(),
            running: self.running.load(Ordering::SeqCst),
        }
    }
}

fn apply_to_content(content: &str, op: &Operation) -> Result<String> {
    let chars: Vec<char> = content.chars().collect();
    let pos = op.position.unwrap_or(0).max(0) as usize;
    let pos = pos.min(chars.len());

    match op.op_type.as_str() {
        "insert" => {
            let text = op.payload.get("text").and_then(|v| v.as_str()).unwrap_or("");
            let mut out: String = chars[..pos].iter().collect();
            out.push_str(text);
            out.extend(chars[pos..].iter());
            Ok(out)
        }
        "delete" => {
            let len = op.length.unwrap_or(0).max(0) as usize;
            let end = (pos + len).min(chars.len());
            let mut out: String = chars[..pos].iter().collect();
            out.extend(chars[end..].iter());
            Ok(out)
        }
        "replace" => {
            let len = op.length.unwrap_or(0).max(0) as usize;
            let end = (pos + len).min(chars.len());
            let text = op.payload.get("text").and_then(|v| v.as_str()).unwrap_or("");
            let mut out: String = chars[..pos].iter().collect();
            out.push_str(text);
            out.extend(chars[end..].iter());
            Ok(out)
        }
        "retain" => Ok(content.to_string()),
        other => Err(CoreError::InvalidInput(format!("unknown operation type: {other}"))),
    }
}

fn operation_json(document_id: &str, op: &Operation) -> serde_json::Value {
    let mut value = serde_json::json!({
        "document_id": document_id,
        "type": op.op_type,
        "position": op.position,
        "length": op.length,
    });
    if let Some(text) = op.payload.get("text") {
        value["text"] = text.clone();
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::PermissionChecker;
    use crate::config::RuntimeConfig;
    use crate::storage::InMemoryStorage;
    use std::time::Duration;

    async fn harness() -> (Arc<Coordinator>, Uuid, String) {
        let runtime = RuntimeConfig::default();
        let storage = Arc::new(StorageManager::new(
            Arc::new(InMemoryStorage::new(runtime.storage.clone())),
            None,
            runtime.storage.clone(),
        ));
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::new(InMemoryStorage::new(runtime.storage.clone())),
            runtime.snapshot.clone(),
        ));
        let access = Arc::new(AccessController::new(Arc::new(PermissionChecker::new())));
        let sessions = Arc::new(SessionManager::new(runtime.session.clone()));
        let locks = Arc::new(LockManager::new(runtime.lock.clone()));
        let conflicts = Arc::new(ConflictManager::new(runtime.conflict.clone()));

        let coordinator = Arc::new(Coordinator::new(
            runtime.coordinator.clone(),
            storage,
            snapshots,
            access,
            sessions.clone(),
            locks,
            conflicts,
        ));

        coordinator.create_document("doc1", "owner").await.unwrap();
        let session = sessions.create_session("owner", "client1", None).await;

        (coordinator, session.id, "doc1".to_string())
    }

    #[tokio::test]
    async fn apply_insert_updates_content_and_version() {
        let (coordinator, session_id, doc) = harness().await;

        let op = Operation {
            id: "op1".to_string(),
            op_type: "insert".to_string(),
            position: Some(0),
            length: None,
            field: None,
            payload: serde_json::json!({"text": "hello"}),
        };

        let result = coordinator.apply_operation(&doc, session_id, op, 0).await.unwrap();
        assert!(result.success);
        assert_eq!(result.new_version, Some(1));
        assert_eq!(coordinator.get_document_content(&doc).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn apply_rejects_unknown_session() {
        let (coordinator, _session_id, doc) = harness().await;

        let op = Operation {
            id: "op1".to_string(),
            op_type: "insert".to_string(),
            position: Some(0),
            length: None,
            field: None,
            payload: serde_json::json!({"text": "x"}),
        };

        let err = coordinator.apply_operation(&doc, Uuid::new_v4(), op, 0).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn stale_base_version_yields_conflict() {
        let (coordinator, session_id, doc) = harness().await;

        let op1 = Operation {
            id: "op1".to_string(),
            op_type: "insert".to_string(),
            position: Some(0),
            length: None,
            field: None,
            payload: serde_json::json!({"text": "hello"}),
        };
        coordinator.apply_operation(&doc, session_id, op1, 0).await.unwrap();

        let op2 = Operation {
            id: "op2".to_string(),
            op_type: "insert".to_string(),
            position: Some(0),
            length: None,
            field: None,
            payload: serde_json::json!({"text": "world"}),
        };
        let result = coordinator.apply_operation(&doc, session_id, op2, 0).await.unwrap();
        assert!(result.conflict.is_some());
    }

    #[tokio::test]
    async fn event_callback_fires_on_operation_applied() {
        let (coordinator, session_id, doc) = harness().await;
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);

        coordinator.on_event(Box::new(move |event| {
            if matches!(event, CoordinatorEvent::OperationApplied { .. }) {
                fired_clone.store(true, Ordering::SeqCst);
            }
        }));

        let op = Operation {
            id: "op1".to_string(),
            op_type: "insert".to_string(),
            position: Some(0),
            length: None,
            field: None,
            payload: serde_json::json!({"text": "hi"}),
        };
        coordinator.apply_operation(&doc, session_id, op, 0).await.unwrap();

        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn write_without_access_grant_is_denied() {
        let runtime = RuntimeConfig::default();
        let storage = Arc::new(StorageManager::new(
            Arc::new(InMemoryStorage::new(runtime.storage.clone())),
            None,
            runtime.storage.clone(),
        ));
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::new(InMemoryStorage::new(runtime.storage.clone())),
            runtime.snapshot.clone(),
        ));
        let access = Arc::new(AccessController::new(Arc::new(PermissionChecker::new())));
        let sessions = Arc::new(SessionManager::new(runtime.session.clone()));
        let locks = Arc::new(LockManager::new(runtime.lock.clone()));
        let conflicts = Arc::new(ConflictManager::new(runtime.conflict.clone()));

        let coordinator = Arc::new(Coordinator::new(
            runtime.coordinator.clone(),
            storage,
            snapshots,
            access,
            sessions.clone(),
            locks,
            conflicts,
        ));

        coordinator.create_document("doc1", "owner").await.unwrap();
        let session = sessions.create_session("intruder", "client2", None).await;

        let op = Operation {
            id: "op1".to_string(),
            op_type: "insert".to_string(),
            position: Some(0),
            length: None,
            field: None,
            payload: serde_json::json!({"text": "x"}),
        };

        let err = coordinator.apply_operation("doc1", session.id, op, 0).await.unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn terminating_session_releases_its_locks() {
        let runtime = RuntimeConfig::default();
        let storage = Arc::new(StorageManager::new(
            Arc::new(InMemoryStorage::new(runtime.storage.clone())),
            None,
            runtime.storage.clone(),
        ));
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::new(InMemoryStorage::new(runtime.storage.clone())),
            runtime.snapshot.clone(),
        ));
        let access = Arc::new(AccessController::new(Arc::new(PermissionChecker::new())));
        let sessions = Arc::new(SessionManager::new(runtime.session.clone()));
        let locks = Arc::new(LockManager::new(runtime.lock.clone()));
        let conflicts = Arc::new(ConflictManager::new(runtime.conflict.clone()));

        let coordinator = Arc::new(Coordinator::new(
            runtime.coordinator.clone(),
            storage,
            snapshots,
            access,
            sessions.clone(),
            locks.clone(),
            conflicts,
        ));

        let session = sessions.create_session("u1", "client1", None).await;

        let req1 = crate::lock::AcquireRequest::new("doc1", "u1", session.id.to_string());
        let req2 = crate::lock::AcquireRequest::new("doc2", "u1", session.id.to_string());
        assert!(locks.acquire(req1).await.success);
        assert!(locks.acquire(req2).await.success);

        sessions.terminate_session(session.id, Some("logout")).await;

        for _ in 0..20 {
            if locks.get_document_locks("doc1").await.is_empty() && locks.get_document_locks("doc2").await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(locks.get_document_locks("doc1").await.is_empty());
        assert!(locks.get_document_locks("doc2").await.is_empty());
    }
}
