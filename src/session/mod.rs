//! Session management (C4).
//!
//! Tracks per-client collaboration sessions: their document membership,
//! ephemeral per-document view state, and the active/idle/disconnected
//! lifecycle. Two background sweepers mirror the cadence of
//! [`crate::lock::LockManager`]'s expiry sweeper.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Idle,
    Disconnected,
    Expired,
    Terminated,
}

/// Transient per-document state carried by a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    pub cursor_positions: HashMap<String, Value>,
    pub pending_operations: HashMap<String, Value>,
    pub view_state: HashMap<String, Value>,
    pub custom: HashMap<String, HashMap<String, Value>>,
}

/// A collaboration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub client_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub documents: HashSet<String>,
    pub data: SessionData,
    pub device_info: Option<Value>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_idle(&self, idle_timeout: std::time::Duration) -> bool {
        let idle_timeout = ChronoDuration::from_std(idle_timeout).unwrap_or_else(|_| ChronoDuration::zero());
        Utc::now() - self.last_activity > idle_timeout
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn join_document(&mut self, document_id: &str) {
        self.documents.insert(document_id.to_string());
    }

    pub fn leave_document(&mut self, document_id: &str) {
        self.documents.remove(document_id);
        self.data.cursor_positions.remove(document_id);
        self.data.pending_operations.remove(document_id);
        self.data.view_state.remove(document_id);
        self.data.custom.remove(document_id);
    }
}

/// Lightweight view of a [`Session`] for listing endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub user_id: String,
    pub client_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub document_count: usize,
}

impl SessionInfo {
    pub fn from_session(session: &Session) -> Self {
        Self {
            id: session.id,
            user_id: session.user_id.clone(),
            client_id: session.client_id.clone(),
            state: session.state,
            created_at: session.created_at,
            last_activity: session.last_activity,
            document_count: session.documents.len(),
        }
    }
}

/// Statistics snapshot for a [`SessionManager`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub sessions_created: u64,
    pub sessions_terminated: u64,
    pub sessions_expired: u64,
    pub running: bool,
}

/// Callback invoked (synchronously) on session lifecycle events.
pub type SessionCallback = Box<dyn Fn(&Session) + Send + Sync>;

struct SessionManagerState {
    sessions: HashMap<Uuid, Session>,
    by_client: HashMap<String, Uuid>,
    by_user: HashMap<String, Vec<Uuid>>,
    by_document: HashMap<String, HashSet<Uuid>>,
}

impl SessionManagerState {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            by_client: HashMap::new(),
            by_user: HashMap::new(),
            by_document: HashMap::new(),
        }
    }

    fn unindex(&mut self, session: &Session) {
        self.sessions.remove(&session.id);
        self.by_client.remove(&session.client_id);
        if let Some(ids) = self.by_user.get_mut(&session.user_id) {
            ids.retain(|id| *id != session.id);
        }
        for doc in &session.documents {
            if let Some(ids) = self.by_document.get_mut(doc) {
                ids.remove(&session.id);
            }
        }
    }
}

/// Manages collaboration sessions.
pub struct SessionManager {
    config: SessionConfig,
    state: AsyncMutex<SessionManagerState>,
    running: AtomicBool,
    stop_notify: Notify,
    sweeper_handle: SyncMutex<Option<JoinHandle<()>>>,
    on_session_created: SyncMutex<Option<SessionCallback>>,
    on_session_terminated: SyncMutex<Option<SessionCallback>>,
    sessions_created: AtomicU64,
    sessions_terminated: AtomicU64,
    sessions_expired: AtomicU64,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: AsyncMutex::new(SessionManagerState::new()),
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
            sweeper_handle: SyncMutex::new(None),
            on_session_created: SyncMutex::new(None),
            on_session_terminated: SyncMutex::new(None),
            sessions_created: AtomicU64::new(0),
            sessions_terminated: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
        }
    }

    pub fn on_session_created(&self, cb: SessionCallback) {
        *self.on_session_created.lock() = Some(cb);
    }

    pub fn on_session_terminated(&self, cb: SessionCallback) {
        *self.on_session_terminated.lock() = Some(cb);
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut idle_ticker = tokio::time::interval(this.config.idle_sweep_interval);
            let mut expiry_ticker = tokio::time::interval(this.config.expiry_sweep_interval);
            idle_ticker.tick().await;
            expiry_ticker.tick().await;
            loop {
                tokio::select! {
                    _ = idle_ticker.tick() => { this.cleanup_idle().await; }
                    _ = expiry_ticker.tick() => { this.cleanup_expired().await; }
                    _ = this.stop_notify.notified() => break,
                }
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
            }
        });
        *self.sweeper_handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_notify.notify_waiters();
        let handle = self.sweeper_handle.lock().take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub async fn create_session(&self, user_id: &str, client_id: &str, device_info: Option<Value>) -> Session {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
            state: SessionState::Active,
            created_at: now,
            last_activity: now,
            expires_at: now + ChronoDuration::from_std(self.config.session_timeout).unwrap_or_else(|_| ChronoDuration::zero()),
            documents: HashSet::new(),
            data: SessionData::default(),
            device_info,
        };

        let oldest_to_evict = {
            let mut state = self.state.lock().await;
            state.sessions.insert(session.id, session.clone());
            state.by_client.insert(session.client_id.clone(), session.id);
            let ids = state.by_user.entry(user_id.to_string()).or_default();
            ids.push(session.id);

            if ids.len() > self.config.max_sessions_per_user {
                let ids = ids.clone();
                ids.iter()
                    .filter_map(|id| state.sessions.get(id))
                    .min_by_key(|s| s.created_at)
                    .map(|s| s.id)
            } else {
                None
            }
        };

        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        if let Some(cb) = self.on_session_created.lock().as_ref() {
            cb(&session);
        }

        if let Some(evict_id) = oldest_to_evict {
            if evict_id != session.id {
                self.terminate_session(evict_id, Some("max sessions per user exceeded")).await;
            }
        }

        session
    }

    pub async fn get_session(&self, id: Uuid) -> Option<Session> {
        self.state.lock().await.sessions.get(&id).cloned()
    }

    pub async fn get_session_by_client(&self, client_id: &str) -> Option<Session> {
        let state = self.state.lock().await;
        let id = state.by_client.get(client_id)?;
        state.sessions.get(id).cloned()
    }

    pub async fn get_user_sessions(&self, user_id: &str) -> Vec<Session> {
        let state = self.state.lock().await;
        state
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| state.sessions.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn update_activity(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(&id) {
            Some(session) => {
                session.touch();
                if session.state == SessionState::Idle {
                    session.state = SessionState::Active;
                }
                true
            }
            None => false,
        }
    }

    pub async fn join_document(&self, id: Uuid, document_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let session = match state.sessions.get(&id) {
            Some(s) => s,
            None => return false,
        };
        if session.documents.len() >= self.config.max_documents_per_session && !session.documents.contains(document_id) {
            return false;
        }
        state.sessions.get_mut(&id).unwrap().join_document(document_id);
        state.by_document.entry(document_id.to_string()).or_default().insert(id);
        true
    }

    pub async fn leave_document(&self, id: Uuid, document_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(&id) {
            Some(session) => {
                session.leave_document(document_id);
                if let Some(ids) = state.by_document.get_mut(document_id) {
                    ids.remove(&id);
                }
                true
            }
            None => false,
        }
    }

    pub async fn get_document_sessions(&self, document_id: &str) -> Vec<Session> {
        let state = self.state.lock().await;
        state
            .by_document
            .get(document_id)
            .map(|ids| ids.iter().filter_map(|id| state.sessions.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn disconnect_session(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(&id) {
            Some(session) => {
                session.state = SessionState::Disconnected;
                true
            }
            None => false,
        }
    }

    pub async fn reconnect_session(&self, id: Uuid, new_client_id: &str) -> Option<Session> {
        let mut state = self.state.lock().await;
        let session = state.sessions.get(&id)?;
        if session.state != SessionState::Disconnected || session.is_expired() {
            return None;
        }
        let old_client_id = session.client_id.clone();

        let session = state.sessions.get_mut(&id).unwrap();
        session.client_id = new_client_id.to_string();
        session.state = SessionState::Active;
        session.touch();
        let updated = session.clone();

        state.by_client.remove(&old_client_id);
        state.by_client.insert(new_client_id.to_string(), id);

        Some(updated)
    }

    pub async fn terminate_session(&self, id: Uuid, _reason: Option<&str>) -> bool {
        let session = {
            let mut state = self.state.lock().await;
            match state.sessions.get(&id).cloned() {
                Some(s) => {
                    state.unindex(&s);
                    s
                }
                None => return false,
            }
        };

        self.sessions_terminated.fetch_add(1, Ordering::Relaxed);
        if let Some(cb) = self.on_session_terminated.lock().as_ref() {
            cb(&session);
        }
        true
    }

    pub async fn terminate_user_sessions(&self, user_id: &str, reason: Option<&str>) -> usize {
        let ids: Vec<Uuid> = {
            let state = self.state.lock().await;
            state.by_user.get(user_id).cloned().unwrap_or_default()
        };
        let mut count = 0;
        for id in ids {
            if self.terminate_session(id, reason).await {
                count += 1;
            }
        }
        count
    }

    pub async fn save_session_data(&self, id: Uuid, document_id: &str, key: &str, value: Value) -> bool {
        let mut state = self.state.lock().await;
        let session = match state.sessions.get_mut(&id) {
            Some(s) => s,
            None => return false,
        };
        match key {
            "cursor" => {
                session.data.cursor_positions.insert(document_id.to_string(), value);
            }
            "pending_ops" => {
                session.data.pending_operations.insert(document_id.to_string(), value);
            }
            other => {
                session
                    .data
                    .custom
                    .entry(document_id.to_string())
                    .or_default()
                    .insert(other.to_string(), value);
            }
        }
        true
    }

    pub async fn get_session_data(&self, id: Uuid, document_id: &str, key: &str) -> Option<Value> {
        let state = self.state.lock().await;
        let session = state.sessions.get(&id)?;
        match key {
            "cursor" => session.data.cursor_positions.get(document_id).cloned(),
            "pending_ops" => session.data.pending_operations.get(document_id).cloned(),
            other => session.data.custom.get(document_id)?.get(other).cloned(),
        }
    }

    pub async fn cleanup_expired(&self) -> usize {
        let expired: Vec<Session> = {
            let state = self.state.lock().await;
            state.sessions.values().filter(|s| s.is_expired()).cloned().collect()
        };
        let n = expired.len();
        for session in expired {
            let mut state = self.state.lock().await;
            state.unindex(&session);
            drop(state);
            self.sessions_expired.fetch_add(1, Ordering::Relaxed);
            if let Some(cb) = self.on_session_terminated.lock().as_ref() {
                cb(&session);
            }
        }
        n
    }

    pub async fn cleanup_idle(&self) -> usize {
        let mut state = self.state.lock().await;
        let idle_timeout = self.config.idle_timeout;
        let mut count = 0;
        for session in state.sessions.values_mut() {
            if session.is_active() && session.is_idle(idle_timeout) {
                session.state = SessionState::Idle;
                count += 1;
            }
        }
        count
    }

    pub async fn get_stats(&self) -> SessionStats {
        let state = self.state.lock().await;
        let active = state.sessions.values().filter(|s| s.is_active()).count();
        SessionStats {
            total_sessions: state.sessions.len(),
            active_sessions: active,
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_terminated: self.sessions_terminated.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

static GLOBAL_SESSION_MANAGER: OnceCell<Arc<SessionManager>> = OnceCell::new();

/// Returns the process-wide session manager, lazily constructing one with
/// default configuration on first use.
pub fn get_session_manager() -> Arc<SessionManager> {
    GLOBAL_SESSION_MANAGER
        .get_or_init(|| Arc::new(SessionManager::new(SessionConfig::default())))
        .clone()
}

/// Installs the process-wide session manager. Fails if one is already set.
pub fn set_session_manager(manager: Arc<SessionManager>) -> crate::error::Result<()> {
    GLOBAL_SESSION_MANAGER
        .set(manager)
        .map_err(|_| crate::error::CoreError::InvalidInput("session manager already initialized".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_session_starts_active() {
        let mgr = SessionManager::new(SessionConfig::default());
        let session = mgr.create_session("alice", "client-1", None).await;
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(mgr.get_session(session.id).await.unwrap().id, session.id);
    }

    #[tokio::test]
    async fn update_activity_reactivates_idle_session() {
        let mgr = SessionManager::new(SessionConfig::default());
        let session = mgr.create_session("alice", "client-1", None).await;
        {
            let mut state = mgr.state.lock().await;
            state.sessions.get_mut(&session.id).unwrap().state = SessionState::Idle;
        }
        assert!(mgr.update_activity(session.id).await);
        assert_eq!(mgr.get_session(session.id).await.unwrap().state, SessionState::Active);
    }

    #[tokio::test]
    async fn join_document_respects_cap() {
        let mut config = SessionConfig::default();
        config.max_documents_per_session = 2;
        let mgr = SessionManager::new(config);
        let session = mgr.create_session("alice", "client-1", None).await;

        assert!(mgr.join_document(session.id, "doc1").await);
        assert!(mgr.join_document(session.id, "doc2").await);
        assert!(!mgr.join_document(session.id, "doc3").await);
        assert_eq!(mgr.get_session(session.id).await.unwrap().documents.len(), 2);
    }

    #[tokio::test]
    async fn leave_document_drops_cursor() {
        let mgr = SessionManager::new(SessionConfig::default());
        let session = mgr.create_session("alice", "client-1", None).await;
        mgr.join_document(session.id, "doc1").await;
        mgr.save_session_data(session.id, "doc1", "cursor", serde_json::json!({"line": 10})).await;

        assert!(mgr.leave_document(session.id, "doc1").await);
        let updated = mgr.get_session(session.id).await.unwrap();
        assert!(!updated.documents.contains("doc1"));
        assert!(!updated.data.cursor_positions.contains_key("doc1"));
    }

    #[tokio::test]
    async fn reconnect_rebinds_client_id() {
        let mgr = SessionManager::new(SessionConfig::default());
        let session = mgr.create_session("alice", "client-1", None).await;
        mgr.disconnect_session(session.id).await;

        let reconnected = mgr.reconnect_session(session.id, "client-2").await.unwrap();
        assert_eq!(reconnected.state, SessionState::Active);
        assert_eq!(reconnected.client_id, "client-2");
        assert!(mgr.get_session_by_client("client-2").await.is_some());
    }

    #[tokio::test]
    async fn cannot_reconnect_active_session() {
        let mgr = SessionManager::new(SessionConfig::default());
        let session = mgr.create_session("alice", "client-1", None).await;
        assert!(mgr.reconnect_session(session.id, "client-2").await.is_none());
    }

    #[tokio::test]
    async fn max_sessions_per_user_evicts_oldest() {
        let mut config = SessionConfig::default();
        config.max_sessions_per_user = 2;
        let mgr = SessionManager::new(config);

        let s1 = mgr.create_session("alice", "client-1", None).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        mgr.create_session("alice", "client-2", None).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let s3 = mgr.create_session("alice", "client-3", None).await;

        let sessions = mgr.get_user_sessions("alice").await;
        let ids: Vec<Uuid> = sessions.iter().map(|s| s.id).collect();
        assert_eq!(sessions.len(), 2);
        assert!(!ids.contains(&s1.id));
        assert!(ids.contains(&s3.id));
    }

    #[tokio::test]
    async fn cleanup_expired_removes_session() {
        let mgr = SessionManager::new(SessionConfig::default());
        let session = mgr.create_session("alice", "client-1", None).await;
        {
            let mut state = mgr.state.lock().await;
            state.sessions.get_mut(&session.id).unwrap().expires_at = Utc::now() - ChronoDuration::hours(1);
        }

        assert_eq!(mgr.cleanup_expired().await, 1);
        assert!(mgr.get_session(session.id).await.is_none());
    }

    #[tokio::test]
    async fn cleanup_idle_marks_session_idle() {
        let mut config = SessionConfig::default();
        config.idle_timeout = std::time::Duration::from_secs(0);
        let mgr = SessionManager::new(config);
        let session = mgr.create_session("alice", "client-1", None).await;
        {
            let mut state = mgr.state.lock().await;
            state.sessions.get_mut(&session.id).unwrap().last_activity = Utc::now() - ChronoDuration::minutes(1);
        }

        assert_eq!(mgr.cleanup_idle().await, 1);
        assert_eq!(mgr.get_session(session.id).await.unwrap().state, SessionState::Idle);
    }
}
