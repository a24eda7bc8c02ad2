//! Document and section locking (C5).
//!
//! Locks are acquired through a single per-manager state guarded by a
//! [`tokio::sync::Mutex`], mirroring the way [`crate::storage::StorageManager`]
//! and [`crate::conflict::ConflictManager`] serialise their own bookkeeping.
//! Waiting requests are parked on a one-shot channel rather than polled.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::Result;

/// Types of locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Full write lock, blocks all other access.
    Exclusive,
    /// Read lock, allows other readers.
    Shared,
    /// Signals intent to acquire an exclusive lock.
    IntentExclusive,
    /// Signals intent to acquire a shared lock.
    IntentShared,
}

/// Scope of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    Document,
    Section,
    Field,
}

/// Lock lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Pending,
    Acquired,
    Released,
    Expired,
    Denied,
}

/// A byte range for section locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRange {
    pub start: i64,
    pub end: i64,
}

impl LockRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &LockRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, position: i64) -> bool {
        self.start <= position && position < self.end
    }
}

/// A document or section lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub id: Uuid,
    pub document_id: String,
    pub user_id: String,
    pub session_id: String,
    pub lock_type: LockType,
    pub scope: LockScope,
    pub state: LockState,
    pub acquired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub range: Option<LockRange>,
    pub field_name: Option<String>,
    pub metadata: Value,
}

impl Lock {
    pub fn is_active(&self) -> bool {
        self.state == LockState::Acquired
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => Utc::now() > exp,
            None => false,
        }
    }

    /// Whether this lock conflicts with `other`. Both locks are assumed to
    /// belong to the same document when scopes are compared.
    pub fn conflicts_with(&self, other: &Lock) -> bool {
        if self.document_id != other.document_id {
            return false;
        }

        if self.scope == LockScope::Document || other.scope == LockScope::Document {
            return self.type_conflicts(other.lock_type);
        }

        if self.scope == LockScope::Section && other.scope == LockScope::Section {
            if let (Some(a), Some(b)) = (&self.range, &other.range) {
                if !a.overlaps(b) {
                    return false;
                }
            }
            return self.type_conflicts(other.lock_type);
        }

        if self.scope == LockScope::Field && other.scope == LockScope::Field {
            if self.field_name != other.field_name {
                return false;
            }
            return self.type_conflicts(other.lock_type);
        }

        self.type_conflicts(other.lock_type)
    }

    fn type_conflicts(&self, other_type: LockType) -> bool {
        if self.lock_type == LockType::Shared && other_type == LockType::Shared {
            return false;
        }
        let intent = |t: LockType| matches!(t, LockType::IntentExclusive | LockType::IntentShared);
        if intent(self.lock_type) && intent(other_type) {
            return false;
        }
        true
    }
}

/// A queued request to acquire a lock.
#[derive(Debug, Clone)]
struct LockRequest {
    id: Uuid,
    document_id: String,
    created_at: DateTime<Utc>,
}

/// Result of a lock operation.
#[derive(Debug, Clone, Serialize)]
pub struct LockResult {
    pub success: bool,
    pub lock: Option<Lock>,
    pub message: String,
    pub wait_time_ms: f64,
    pub conflict_locks: Vec<Lock>,
}

impl LockResult {
    fn denied(message: impl Into<String>, conflict_locks: Vec<Lock>, wait_time_ms: f64) -> Self {
        Self {
            success: false,
            lock: None,
            message: message.into(),
            wait_time_ms,
            conflict_locks,
        }
    }
}

/// Parameters for [`LockManager::acquire`].
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub document_id: String,
    pub user_id: String,
    pub session_id: String,
    pub lock_type: LockType,
    pub scope: LockScope,
    pub range: Option<LockRange>,
    pub field_name: Option<String>,
    pub timeout: Option<Duration>,
    pub wait: bool,
    pub metadata: Value,
}

impl AcquireRequest {
    pub fn new(document_id: impl Into<String>, user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            lock_type: LockType::Exclusive,
            scope: LockScope::Document,
            range: None,
            field_name: None,
            timeout: None,
            wait: true,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_type(mut self, lock_type: LockType) -> Self {
        self.lock_type = lock_type;
        self
    }

    pub fn with_scope(mut self, scope: LockScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_range(mut self, range: LockRange) -> Self {
        self.scope = LockScope::Section;
        self.range = Some(range);
        self
    }

    pub fn with_field(mut self, field_name: impl Into<String>) -> Self {
        self.scope = LockScope::Field;
        self.field_name = Some(field_name.into());
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }
}

struct QueueEntry {
    request: LockRequest,
    notify: Option<oneshot::Sender<()>>,
}

/// Queue of pending lock requests, one deque per document.
struct LockQueue {
    queues: HashMap<String, VecDeque<QueueEntry>>,
    timeout: Duration,
}

impl LockQueue {
    fn new(timeout: Duration) -> Self {
        Self {
            queues: HashMap::new(),
            timeout,
        }
    }

    fn add(&mut self, id: Uuid, document_id: String) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let request = LockRequest {
            id,
            document_id: document_id.clone(),
            created_at: Utc::now(),
        };
        self.queues
            .entry(document_id)
            .or_default()
            .push_back(QueueEntry {
                request,
                notify: Some(tx),
            });
        rx
    }

    fn remove(&mut self, request_id: Uuid, document_id: &str) {
        if let Some(q) = self.queues.get_mut(document_id) {
            if let Some(pos) = q.iter().position(|e| e.request.id == request_id) {
                q.remove(pos);
            }
            if q.is_empty() {
                self.queues.remove(document_id);
            }
        }
    }

    fn next_id(&self, document_id: &str) -> Option<Uuid> {
        self.queues.get(document_id).and_then(|q| q.front()).map(|e| e.request.id)
    }

    fn notify(&mut self, request_id: Uuid, document_id: &str) {
        if let Some(q) = self.queues.get_mut(document_id) {
            if let Some(entry) = q.iter_mut().find(|e| e.request.id == request_id) {
                if let Some(tx) = entry.notify.take() {
                    let _ = tx.send(());
                }
            }
        }
    }

    fn length(&self, document_id: &str) -> usize {
        self.queues.get(document_id).map(|q| q.len()).unwrap_or(0)
    }

    fn cleanup_expired(&mut self) -> usize {
        let timeout = self.timeout;
        let now = Utc::now();
        let mut removed = 0;
        let mut empty = Vec::new();
        for (doc_id, q) in self.queues.iter_mut() {
            let before = q.len();
            q.retain(|e| {
                now.signed_duration_since(e.request.created_at)
                    .to_std()
                    .map(|d| d < timeout)
                    .unwrap_or(true)
            });
            removed += before - q.len();
            if q.is_empty() {
                empty.push(doc_id.clone());
            }
        }
        for d in empty {
            self.queues.remove(&d);
        }
        removed
    }
}

struct LockManagerState {
    locks: HashMap<Uuid, Lock>,
    document_locks: HashMap<String, HashSet<Uuid>>,
    user_locks: HashMap<String, HashSet<Uuid>>,
    session_locks: HashMap<String, HashSet<Uuid>>,
}

impl LockManagerState {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
            document_locks: HashMap::new(),
            user_locks: HashMap::new(),
            session_locks: HashMap::new(),
        }
    }
}

/// Statistics snapshot for a [`LockManager`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct LockStats {
    pub total_locks: usize,
    pub active_locks: usize,
    pub locks_acquired: u64,
    pub locks_released: u64,
    pub locks_expired: u64,
    pub locks_denied: u64,
    pub documents_with_locks: usize,
    pub users_with_locks: usize,
    pub running: bool,
}

/// Callback invoked (synchronously, outside any internal lock) on lock
/// lifecycle events.
pub type LockCallback = Box<dyn Fn(&Lock) + Send + Sync>;

/// Manages document and section locks.
pub struct LockManager {
    config: LockConfig,
    state: AsyncMutex<LockManagerState>,
    queue: SyncMutex<LockQueue>,
    running: AtomicBool,
    stop_notify: Notify,
    cleanup_handle: SyncMutex<Option<JoinHandle<()>>>,
    on_lock_acquired: SyncMutex<Option<LockCallback>>,
    on_lock_released: SyncMutex<Option<LockCallback>>,
    on_lock_expired: SyncMutex<Option<LockCallback>>,
    locks_acquired: AtomicU64,
    locks_released: AtomicU64,
    locks_expired: AtomicU64,
    locks_denied: AtomicU64,
}

impl LockManager {
    pub fn new(config: LockConfig) -> Self {
        let queue_timeout = config.queue_timeout;
        Self {
            config,
            state: AsyncMutex::new(LockManagerState::new()),
            queue: SyncMutex::new(LockQueue::new(queue_timeout)),
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
            cleanup_handle: SyncMutex::new(None),
            on_lock_acquired: SyncMutex::new(None),
            on_lock_released: SyncMutex::new(None),
            on_lock_expired: SyncMutex::new(None),
            locks_acquired: AtomicU64::new(0),
            locks_released: AtomicU64::new(0),
            locks_expired: AtomicU64::new(0),
            locks_denied: AtomicU64::new(0),
        }
    }

    pub fn on_lock_acquired(&self, cb: LockCallback) {
        *self.on_lock_acquired.lock() = Some(cb);
    }

    pub fn on_lock_released(&self, cb: LockCallback) {
        *self.on_lock_released.lock() = Some(cb);
    }

    pub fn on_lock_expired(&self, cb: LockCallback) {
        *self.on_lock_expired.lock() = Some(cb);
    }

    /// Spawns the periodic expiry/queue sweeper. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.heartbeat_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.cleanup_expired_locks().await;
                        this.queue.lock().cleanup_expired();
                    }
                    _ = this.stop_notify.notified() => break,
                }
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
            }
        });
        *self.cleanup_handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_notify.notify_waiters();
        let handle = self.cleanup_handle.lock().take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }

    async fn cleanup_expired_locks(&self) -> usize {
        let expired: Vec<Lock> = {
            let state = self.state.lock().await;
            state
                .locks
                .values()
                .filter(|l| l.is_active() && l.is_expired())
                .cloned()
                .collect()
        };
        let n = expired.len();
        for lock in expired {
            self.finish_release(lock, true).await;
        }
        n
    }

    async fn find_conflicts(&self, lock: &Lock) -> Vec<Lock> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        if let Some(ids) = state.document_locks.get(&lock.document_id) {
            for id in ids {
                if let Some(existing) = state.locks.get(id) {
                    if existing.is_active() && lock.conflicts_with(existing) {
                        out.push(existing.clone());
                    }
                }
            }
        }
        out
    }

    /// Acquires a lock, optionally waiting on the document's queue if it
    /// conflicts with an existing one.
    pub async fn acquire(&self, req: AcquireRequest) -> LockResult {
        let timeout = req.timeout.unwrap_or(self.config.default_timeout);

        {
            let state = self.state.lock().await;
            if state
                .user_locks
                .get(&req.user_id)
                .map(|s| s.len())
                .unwrap_or(0)
                >= self.config.max_locks_per_user
            {
                return LockResult::denied("max locks per user reached", vec![], 0.0);
            }
            if state
                .document_locks
                .get(&req.document_id)
                .map(|s| s.len())
                .unwrap_or(0)
                >= self.config.max_locks_per_document
            {
                return LockResult::denied("max locks per document reached", vec![], 0.0);
            }
            if self.queue.lock().length(&req.document_id) >= self.config.max_queue_length {
                return LockResult::denied("lock queue is full", vec![], 0.0);
            }
        }

        let lock_id = Uuid::new_v4();
        let mut lock = Lock {
            id: lock_id,
            document_id: req.document_id.clone(),
            user_id: req.user_id.clone(),
            session_id: req.session_id.clone(),
            lock_type: req.lock_type,
            scope: req.scope,
            state: LockState::Pending,
            acquired_at: None,
            expires_at: None,
            released_at: None,
            range: req.range,
            field_name: req.field_name.clone(),
            metadata: req.metadata.clone(),
        };

        let mut conflicts = self.find_conflicts(&lock).await;
        conflicts.retain(|c| c.user_id != req.user_id);

        let mut wait_time_ms = 0.0;

        if !conflicts.is_empty() {
            if !req.wait || !self.config.enable_queuing {
                self.locks_denied.fetch_add(1, Ordering::Relaxed);
                return LockResult::denied("lock conflicts with existing locks", conflicts, 0.0);
            }

            let rx = self.queue.lock().add(lock_id, req.document_id.clone());
            let start = std::time::Instant::now();

            let awaited = tokio::time::timeout(self.config.queue_timeout, rx).await;
            wait_time_ms = start.elapsed().as_secs_f64() * 1000.0;
            self.queue.lock().remove(lock_id, &req.document_id);

            match awaited {
                Ok(Ok(())) => {}
                _ => {
                    self.locks_denied.fetch_add(1, Ordering::Relaxed);
                    return LockResult::denied("lock acquisition timed out", conflicts, wait_time_ms);
                }
            }

            conflicts = self.find_conflicts(&lock).await;
            conflicts.retain(|c| c.user_id != req.user_id);

            if !conflicts.is_empty() {
                self.locks_denied.fetch_add(1, Ordering::Relaxed);
                return LockResult::denied("lock still conflicts after wait", conflicts, wait_time_ms);
            }
        }

        let now = Utc::now();
        let effective_timeout = timeout.min(self.config.max_lock_duration);
        lock.state = LockState::Acquired;
        lock.acquired_at = Some(now);
        lock.expires_at = Some(now + ChronoDuration::from_std(effective_timeout).unwrap_or_else(|_| ChronoDuration::zero()));

        {
            let mut state = self.state.lock().await;
            state
                .document_locks
                .entry(req.document_id.clone())
                .or_default()
                .insert(lock_id);
            state
                .user_locks
                .entry(req.user_id.clone())
                .or_default()
                .insert(lock_id);
            state
                .session_locks
                .entry(req.session_id.clone())
                .or_default()
                .insert(lock_id);
            state.locks.insert(lock_id, lock.clone());
        }
        self.locks_acquired.fetch_add(1, Ordering::Relaxed);

        if let Some(cb) = self.on_lock_acquired.lock().as_ref() {
            cb(&lock);
        }

        LockResult {
            success: true,
            lock: Some(lock),
            message: "lock acquired".to_string(),
            wait_time_ms,
            conflict_locks: vec![],
        }
    }

    pub async fn release(&self, lock_id: Uuid, user_id: Option<&str>) -> bool {
        let lock = {
            let state = self.state.lock().await;
            state.locks.get(&lock_id).cloned()
        };
        let lock = match lock {
            Some(l) => l,
            None => return false,
        };
        if let Some(uid) = user_id {
            if lock.user_id != uid {
                return false;
            }
        }
        self.finish_release(lock, false).await;
        true
    }

    async fn finish_release(&self, mut lock: Lock, expired: bool) {
        {
            let mut state = self.state.lock().await;
            lock.state = if expired { LockState::Expired } else { LockState::Released };
            lock.released_at = Some(Utc::now());
            state.locks.remove(&lock.id);
            if let Some(s) = state.document_locks.get_mut(&lock.document_id) {
                s.remove(&lock.id);
            }
            if let Some(s) = state.user_locks.get_mut(&lock.user_id) {
                s.remove(&lock.id);
            }
            if let Some(s) = state.session_locks.get_mut(&lock.session_id) {
                s.remove(&lock.id);
            }
        }

        if expired {
            self.locks_expired.fetch_add(1, Ordering::Relaxed);
        } else {
            self.locks_released.fetch_add(1, Ordering::Relaxed);
        }

        let next = self.queue.lock().next_id(&lock.document_id);
        if let Some(id) = next {
            self.queue.lock().notify(id, &lock.document_id);
        }

        let cb_slot = if expired {
            &self.on_lock_expired
        } else {
            &self.on_lock_released
        };
        if let Some(cb) = cb_slot.lock().as_ref() {
            cb(&lock);
        }
    }

    pub async fn release_session_locks(&self, session_id: &str) -> usize {
        let ids: Vec<Uuid> = {
            let state = self.state.lock().await;
            state
                .session_locks
                .get(session_id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        };
        let mut released = 0;
        for id in ids {
            if self.release(id, None).await {
                released += 1;
            }
        }
        released
    }

    pub async fn release_user_locks(&self, user_id: &str) -> usize {
        let ids: Vec<Uuid> = {
            let state = self.state.lock().await;
            state
                .user_locks
                .get(user_id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        };
        let mut released = 0;
        for id in ids {
            if self.release(id, Some(user_id)).await {
                released += 1;
            }
        }
        released
    }

    pub async fn extend(&self, lock_id: Uuid, user_id: &str, extension: Option<Duration>) -> bool {
        let mut state = self.state.lock().await;
        let lock = match state.locks.get_mut(&lock_id) {
            Some(l) => l,
            None => return false,
        };
        if lock.user_id != user_id || !lock.is_active() {
            return false;
        }
        let extension = extension.unwrap_or(self.config.default_timeout);
        let new_expiry = Utc::now() + ChronoDuration::from_std(extension).unwrap_or_else(|_| ChronoDuration::zero());
        let max_expiry = lock.acquired_at.unwrap_or_else(Utc::now)
            + ChronoDuration::from_std(self.config.max_lock_duration).unwrap_or_else(|_| ChronoDuration::zero());
        lock.expires_at = Some(new_expiry.min(max_expiry));
        true
    }

    pub async fn get_lock(&self, lock_id: Uuid) -> Option<Lock> {
        self.state.lock().await.locks.get(&lock_id).cloned()
    }

    pub async fn get_document_locks(&self, document_id: &str) -> Vec<Lock> {
        let state = self.state.lock().await;
        state
            .document_locks
            .get(document_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.locks.get(id))
                    .filter(|l| l.is_active())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_user_locks(&self, user_id: &str) -> Vec<Lock> {
        let state = self.state.lock().await;
        state
            .user_locks
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.locks.get(id))
                    .filter(|l| l.is_active())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn is_locked(&self, document_id: &str, position: Option<i64>, field_name: Option<&str>) -> bool {
        for lock in self.get_document_locks(document_id).await {
            if lock.scope == LockScope::Document {
                return true;
            }
            if let (Some(pos), LockScope::Section) = (position, lock.scope) {
                if lock.range.map(|r| r.contains(pos)).unwrap_or(false) {
                    return true;
                }
            }
            if let (Some(name), LockScope::Field) = (field_name, lock.scope) {
                if lock.field_name.as_deref() == Some(name) {
                    return true;
                }
            }
        }
        false
    }

    pub async fn can_edit(&self, document_id: &str, user_id: &str, position: Option<i64>, field_name: Option<&str>) -> bool {
        for lock in self.get_document_locks(document_id).await {
            if lock.user_id == user_id || lock.lock_type == LockType::Shared {
                continue;
            }
            if lock.scope == LockScope::Document {
                return false;
            }
            if let (Some(pos), LockScope::Section) = (position, lock.scope) {
                if lock.range.map(|r| r.contains(pos)).unwrap_or(false) {
                    return false;
                }
            }
            if let (Some(name), LockScope::Field) = (field_name, lock.scope) {
                if lock.field_name.as_deref() == Some(name) {
                    return false;
                }
            }
        }
        true
    }

    pub fn get_queue_length(&self, document_id: &str) -> usize {
        self.queue.lock().length(document_id)
    }

    pub async fn get_stats(&self) -> LockStats {
        let state = self.state.lock().await;
        let active = state.locks.values().filter(|l| l.is_active()).count();
        LockStats {
            total_locks: state.locks.len(),
            active_locks: active,
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
            locks_expired: self.locks_expired.load(Ordering::Relaxed),
            locks_denied: self.locks_denied.load(Ordering::Relaxed),
            documents_with_locks: state.document_locks.len(),
            users_with_locks: state.user_locks.len(),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

static GLOBAL_LOCK_MANAGER: OnceCell<Arc<LockManager>> = OnceCell::new();

/// Returns the process-wide lock manager, lazily constructing one with
/// default configuration on first use.
pub fn get_lock_manager() -> Arc<LockManager> {
    GLOBAL_LOCK_MANAGER
        .get_or_init(|| Arc::new(LockManager::new(LockConfig::default())))
        .clone()
}

/// Installs the process-wide lock manager. Fails if one is already set.
pub fn set_lock_manager(manager: Arc<LockManager>) -> Result<()> {
    GLOBAL_LOCK_MANAGER
        .set(manager)
        .map_err(|_| crate::error::CoreError::InvalidInput("lock manager already initialized".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_locks_conflict_without_wait() {
        let mgr = LockManager::new(LockConfig::default());
        let a = mgr
            .acquire(AcquireRequest::new("doc-1", "alice", "sess-a"))
            .await;
        assert!(a.success);

        let b = mgr
            .acquire(AcquireRequest::new("doc-1", "bob", "sess-b").no_wait())
            .await;
        assert!(!b.success);
        assert_eq!(b.conflict_locks.len(), 1);
    }

    #[tokio::test]
    async fn shared_locks_do_not_conflict() {
        let mgr = LockManager::new(LockConfig::default());
        let a = mgr
            .acquire(AcquireRequest::new("doc-1", "alice", "sess-a").with_type(LockType::Shared))
            .await;
        let b = mgr
            .acquire(AcquireRequest::new("doc-1", "bob", "sess-b").with_type(LockType::Shared))
            .await;
        assert!(a.success && b.success);
    }

    #[tokio::test]
    async fn non_overlapping_section_locks_do_not_conflict() {
        let mgr = LockManager::new(LockConfig::default());
        let a = mgr
            .acquire(AcquireRequest::new("doc-1", "alice", "sess-a").with_range(LockRange::new(0, 10)))
            .await;
        let b = mgr
            .acquire(AcquireRequest::new("doc-1", "bob", "sess-b").with_range(LockRange::new(20, 30)))
            .await;
        assert!(a.success && b.success);
    }

    #[tokio::test]
    async fn overlapping_section_locks_conflict() {
        let mgr = LockManager::new(LockConfig::default());
        let a = mgr
            .acquire(AcquireRequest::new("doc-1", "alice", "sess-a").with_range(LockRange::new(0, 10)))
            .await;
        assert!(a.success);
        let b = mgr
            .acquire(AcquireRequest::new("doc-1", "bob", "sess-b").with_range(LockRange::new(5, 15)).no_wait())
            .await;
        assert!(!b.success);
    }

    #[tokio::test]
    async fn queued_acquire_succeeds_after_release() {
        let mgr = Arc::new(LockManager::new(LockConfig::default()));
        let first = mgr
            .acquire(AcquireRequest::new("doc-1", "alice", "sess-a"))
            .await;
        assert!(first.success);
        let lock_id = first.lock.unwrap().id;

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire(AcquireRequest::new("doc-1", "bob", "sess-b")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mgr.release(lock_id, Some("alice")).await);

        let result = waiter.await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn extend_is_capped_at_max_duration() {
        let mut config = LockConfig::default();
        config.max_lock_duration = Duration::from_secs(60);
        config.default_timeout = Duration::from_secs(10);
        let mgr = LockManager::new(config);
        let result = mgr
            .acquire(AcquireRequest::new("doc-1", "alice", "sess-a"))
            .await;
        let lock_id = result.lock.unwrap().id;

        assert!(mgr.extend(lock_id, "alice", Some(Duration::from_secs(3600))).await);
        let lock = mgr.get_lock(lock_id).await.unwrap();
        let acquired = lock.acquired_at.unwrap();
        let expires = lock.expires_at.unwrap();
        assert!(expires - acquired <= ChronoDuration::seconds(61));
    }

    #[tokio::test]
    async fn can_edit_respects_other_users_exclusive_lock() {
        let mgr = LockManager::new(LockConfig::default());
        mgr.acquire(AcquireRequest::new("doc-1", "alice", "sess-a")).await;
        assert!(!mgr.can_edit("doc-1", "bob", None, None).await);
        assert!(mgr.can_edit("doc-1", "alice", None, None).await);
    }

    #[tokio::test]
    async fn stats_reflect_acquired_and_released_counts() {
        let mgr = LockManager::new(LockConfig::default());
        let result = mgr.acquire(AcquireRequest::new("doc-1", "alice", "sess-a")).await;
        let lock_id = result.lock.unwrap().id;
        mgr.release(lock_id, Some("alice")).await;
        let stats = mgr.get_stats().await;
        assert_eq!(stats.locks_acquired, 1);
        assert_eq!(stats.locks_released, 1);
        assert_eq!(stats.total_locks, 0);
    }
}
