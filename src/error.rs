//! Crate-level error type for the collaboration runtime.
//!
//! All public methods across the storage, snapshot, access, session, lock,
//! conflict and coordinator modules return [`Result<T>`], never panic on
//! caller-reachable input, and never raise through a registered callback.

use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Flat error enum covering every failure kind in the runtime's taxonomy.
///
/// Kept as a single enum (rather than one per component) so the Coordinator
/// can propagate a failure from any component without an extra wrapping
/// layer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("lock not found: {0}")]
    LockNotFound(Uuid),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("invitation not found: {0}")]
    InvitationNotFound(Uuid),

    #[error("share link not found")]
    ShareLinkNotFound,

    #[error("permission denied: user {user} lacks {required:?} on {document_id}")]
    PermissionDenied {
        user: String,
        document_id: String,
        required: u32,
    },

    #[error("lock violation on {document_id}: held by another user")]
    LockViolation { document_id: String },

    #[error("version mismatch on {document_id}: expected {expected}, got {actual}")]
    VersionMismatch {
        document_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("storage corruption for {document_id}: checksum mismatch")]
    Corruption { document_id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// True for errors that represent "not found" outcomes rather than
    /// exceptional failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::DocumentNotFound(_)
                | CoreError::SessionNotFound(_)
                | CoreError::LockNotFound(_)
                | CoreError::ConflictNotFound(_)
                | CoreError::SnapshotNotFound(_)
                | CoreError::InvitationNotFound(_)
                | CoreError::ShareLinkNotFound
        )
    }
}
