//! # Collaboration runtime
//!
//! A real-time document collaboration core: pluggable storage with
//! versioned snapshots, access control with share links and invitations,
//! session tracking, range/field locking, conflict detection and
//! resolution, and a coordinator that ties them into a single
//! `ApplyOperation` entry point.
//!
//! ## Architecture
//!
//! - [`error`]: shared error taxonomy (`CoreError`) and `Result` alias
//! - [`config`]: per-component configuration structs and crate-wide defaults
//! - [`storage`]: durable document storage (in-memory and file-backed)
//! - [`snapshot`]: versioned full/delta snapshots with retention and restore
//! - [`access`]: permissions, share links, invitations
//! - [`session`]: connected-client session tracking
//! - [`lock`]: range/field/document locking for concurrent editors
//! - [`conflict`]: conflict detection and resolution strategies
//! - [`coordinator`]: the per-document serialisation point wiring everything
//!   above into `ApplyOperation`

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Shared error taxonomy and result alias.
pub mod error;

/// Per-component configuration structs.
pub mod config;

/// Pluggable document storage backends.
pub mod storage;

/// Versioned snapshotting and restore.
pub mod snapshot;

/// Permissions, share links, and invitations.
pub mod access;

/// Connected-client session tracking.
pub mod session;

/// Range/field/document locking.
pub mod lock;

/// Conflict detection and resolution.
pub mod conflict;

/// The per-document serialisation point.
pub mod coordinator;

pub use config::RuntimeConfig;
pub use coordinator::{ApplyResult, Coordinator, CoordinatorEvent, CoordinatorEventCallback, Operation};
pub use error::{CoreError, Result};

/// Crate version, taken from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, taken from `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
