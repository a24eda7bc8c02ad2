//! Collaboration runtime demonstration binary.
//!
//! Wires the default `RuntimeConfig` into a `Coordinator`, creates a
//! document and a session, applies a couple of operations, and prints a
//! summary before shutting everything down.

use collab_core::access::{AccessController, Permission, PermissionChecker};
use collab_core::conflict::ConflictManager;
use collab_core::config::RuntimeConfig;
use collab_core::lock::LockManager;
use collab_core::session::SessionManager;
use collab_core::snapshot::SnapshotManager;
use collab_core::storage::{InMemoryStorage, StorageManager};
use collab_core::{Coordinator, Operation};
use std::panic;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("collaboration runtime fatal error:");
        eprintln!("{}", panic_info);

        if let Some(location) = panic_info.location() {
            eprintln!("location: {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  collaboration runtime v{}", collab_core::VERSION);
    log::info!("═══════════════════════════════════════════════════════════");

    let config = RuntimeConfig::default();

    let storage = Arc::new(StorageManager::new(
        Arc::new(InMemoryStorage::new(config.storage.clone())),
        None,
        config.storage.clone(),
    ));
    let snapshots = Arc::new(SnapshotManager::new(
        Arc::new(InMemoryStorage::new(config.storage.clone())),
        config.snapshot.clone(),
    ));
    let access = Arc::new(AccessController::new(Arc::new(PermissionChecker::new())));
    let sessions = Arc::new(SessionManager::new(config.session.clone()));
    let locks = Arc::new(LockManager::new(config.lock.clone()));
    let conflicts = Arc::new(ConflictManager::new(config.conflict.clone()));

    let coordinator = Arc::new(Coordinator::new(
        config.coordinator.clone(),
        storage,
        snapshots,
        access,
        sessions.clone(),
        locks,
        conflicts,
    ));

    coordinator.on_event(Box::new(|event| {
        log::info!("event: {:?}", event);
    }));

    coordinator.start();

    let document_id = "demo-doc";
    coordinator.create_document(document_id, "alice").await?;
    let session = sessions.create_session("alice", "alice-desktop", None).await;

    let insert = Operation {
        id: "op-1".to_string(),
        op_type: "insert".to_string(),
        position: Some(0),
        length: None,
        field: None,
        payload: serde_json::json!({"text": "hello, collaborators"}),
    };
    let result = coordinator.apply_operation(document_id, session.id, insert, 0).await?;
    log::info!("applied op-1: success={} new_version={:?}", result.success, result.new_version);

    let content = coordinator.get_document_content(document_id).await?;
    log::info!("document content: {:?}", content);

    let stats = coordinator.get_stats().await;
    log::info!("coordinator stats: {:?}", stats);

    coordinator.stop().await;
    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  shutdown complete");
    log::info!("═══════════════════════════════════════════════════════════");

    Ok(())
}
