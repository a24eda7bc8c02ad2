//! Byte-level document persistence (C1).
//!
//! Two concrete backends — [`InMemoryStorage`] and [`FileStorage`] — sit
//! behind the [`StorageBackend`] trait. [`StorageManager`] composes a
//! primary and an optional secondary backend: writes go to both (secondary
//! best-effort), reads prefer the primary and fall back to the secondary,
//! repairing the primary on a fallback hit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::StorageConfig;
use crate::error::{CoreError, Result};

/// Metadata recorded alongside every stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMetadata {
    pub document_id: String,
    pub version: u64,
    pub content_hash: String,
    pub size: u64,
    pub compressed: bool,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content_type: String,
    pub custom: serde_json::Value,
}

/// A document retrieved from storage.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub content: Vec<u8>,
    pub metadata: StorageMetadata,
}

/// Abstract storage backend. Implementors need only guarantee that `save`
/// followed by `load` round-trips the exact bytes given to `save`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn save(
        &self,
        document_id: &str,
        content: &[u8],
        version: u64,
        custom: Option<serde_json::Value>,
    ) -> Result<StorageMetadata>;

    async fn load(&self, document_id: &str) -> Result<StoredDocument>;

    async fn delete(&self, document_id: &str) -> Result<bool>;

    async fn exists(&self, document_id: &str) -> Result<bool>;

    async fn list_documents(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<String>>;

    async fn get_metadata(&self, document_id: &str) -> Result<StorageMetadata>;

    async fn get_stats(&self) -> Result<StorageStats>;

    /// Remove documents whose `updated_at` is older than `max_age`. Backends
    /// that do not support background cleanup may return `Ok(0)`.
    async fn cleanup(&self, _max_age: std::time::Duration) -> Result<usize> {
        Ok(0)
    }
}

/// Per-backend statistics returned by `get_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub backend: &'static str,
    pub document_count: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub utilization: f64,
}

fn compress(content: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    Ok(encoder.finish()?)
}

fn decompress(content: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(content);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn prepare_bytes(content: &[u8], config: &StorageConfig) -> Result<(Vec<u8>, bool, String)> {
    if content.len() as u64 > config.max_document_size {
        return Err(CoreError::InvalidInput(format!(
            "document exceeds max size: {} > {}",
            content.len(),
            config.max_document_size
        )));
    }

    let (stored, compressed) =
        if config.compression_enabled && content.len() as u64 > config.compression_threshold {
            (compress(content)?, true)
        } else {
            (content.to_vec(), false)
        };

    let hash = if config.checksum_enabled {
        checksum(&stored)
    } else {
        String::new()
    };

    Ok((stored, compressed, hash))
}

fn verify_and_decompress(bytes: Vec<u8>, meta: &StorageMetadata, config: &StorageConfig) -> Result<Vec<u8>> {
    if config.checksum_enabled && !meta.content_hash.is_empty() {
        let actual = checksum(&bytes);
        if actual != meta.content_hash {
            return Err(CoreError::Corruption {
                document_id: meta.document_id.clone(),
            });
        }
    }

    if meta.compressed {
        decompress(&bytes)
    } else {
        Ok(bytes)
    }
}

/// In-memory storage backend: fast, non-persistent.
pub struct InMemoryStorage {
    config: StorageConfig,
    documents: AsyncMutex<std::collections::HashMap<String, (Vec<u8>, StorageMetadata)>>,
    total_size: AtomicU64,
}

impl InMemoryStorage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            documents: AsyncMutex::new(std::collections::HashMap::new()),
            total_size: AtomicU64::new(0),
        }
    }

    /// Remove every stored document. Useful for tests.
    pub async fn clear(&self) -> usize {
        let mut docs = self.documents.lock().await;
        let count = docs.len();
        docs.clear();
        self.total_size.store(0, Ordering::SeqCst);
        count
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn save(
        &self,
        document_id: &str,
        content: &[u8],
        version: u64,
        custom: Option<serde_json::Value>,
    ) -> Result<StorageMetadata> {
        let (stored, compressed, hash) = prepare_bytes(content, &self.config)?;
        let now = Utc::now();

        let mut docs = self.documents.lock().await;
        let old_size = docs.get(document_id).map(|(c, _)| c.len() as u64).unwrap_or(0);
        let new_total = self.total_size.load(Ordering::SeqCst) - old_size + stored.len() as u64;

        if new_total > self.config.max_total_size {
            return Err(CoreError::CapacityExceeded(format!(
                "storage full: {} > {}",
                new_total, self.config.max_total_size
            )));
        }

        let created_at = docs.get(document_id).map(|(_, m)| m.created_at).unwrap_or(now);

        let meta = StorageMetadata {
            document_id: document_id.to_string(),
            version,
            content_hash: hash,
            size: stored.len() as u64,
            compressed,
            encrypted: false,
            created_at,
            updated_at: now,
            content_type: "text/plain".to_string(),
            custom: custom.unwrap_or(serde_json::Value::Null),
        };

        docs.insert(document_id.to_string(), (stored, meta.clone()));
        self.total_size.store(new_total, Ordering::SeqCst);

        Ok(meta)
    }

    async fn load(&self, document_id: &str) -> Result<StoredDocument> {
        let (bytes, meta) = {
            let docs = self.documents.lock().await;
            docs.get(document_id)
                .cloned()
                .ok_or_else(|| CoreError::DocumentNotFound(document_id.to_string()))?
        };

        let content = verify_and_decompress(bytes, &meta, &self.config)?;
        Ok(StoredDocument { content, metadata: meta })
    }

    async fn delete(&self, document_id: &str) -> Result<bool> {
        let mut docs = self.documents.lock().await;
        match docs.remove(document_id) {
            Some((bytes, _)) => {
                self.total_size.fetch_sub(bytes.len() as u64, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, document_id: &str) -> Result<bool> {
        Ok(self.documents.lock().await.contains_key(document_id))
    }

    async fn list_documents(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let docs = self.documents.lock().await;
        let mut ids: Vec<String> = docs
            .keys()
            .filter(|id| prefix.map(|p| id.starts_with(p)).unwrap_or(true))
            .cloned()
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn get_metadata(&self, document_id: &str) -> Result<StorageMetadata> {
        self.documents
            .lock()
            .await
            .get(document_id)
            .map(|(_, m)| m.clone())
            .ok_or_else(|| CoreError::DocumentNotFound(document_id.to_string()))
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let docs = self.documents.lock().await;
        let total = self.total_size.load(Ordering::SeqCst);
        Ok(StorageStats {
            backend: "memory",
            document_count: docs.len(),
            total_size: total,
            max_size: self.config.max_total_size,
            utilization: if self.config.max_total_size > 0 {
                total as f64 / self.config.max_total_size as f64
            } else {
                0.0
            },
        })
    }
}

/// File-based persistent storage backend: one content file plus one JSON
/// metadata sidecar per document, under `base_path`.
pub struct FileStorage {
    base_path: PathBuf,
    config: StorageConfig,
    lock: AsyncMutex<()>,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>, config: StorageConfig) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(base_path.join("documents"))?;
        std::fs::create_dir_all(base_path.join("metadata"))?;
        Ok(Self {
            base_path,
            config,
            lock: AsyncMutex::new(()),
        })
    }

    fn safe_id(document_id: &str) -> String {
        document_id.replace('/', "_").replace('\\', "_")
    }

    fn doc_path(&self, document_id: &str) -> PathBuf {
        self.base_path.join("documents").join(format!("{}.dat", Self::safe_id(document_id)))
    }

    fn meta_path(&self, document_id: &str) -> PathBuf {
        self.base_path.join("metadata").join(format!("{}.json", Self::safe_id(document_id)))
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn save(
        &self,
        document_id: &str,
        content: &[u8],
        version: u64,
        custom: Option<serde_json::Value>,
    ) -> Result<StorageMetadata> {
        let (stored, compressed, hash) = prepare_bytes(content, &self.config)?;
        let now = Utc::now();

        let meta_path = self.meta_path(document_id);
        let created_at = if meta_path.exists() {
            std::fs::read_to_string(&meta_path)
                .ok()
                .and_then(|text| serde_json::from_str::<StorageMetadata>(&text).ok())
                .map(|m| m.created_at)
                .unwrap_or(now)
        } else {
            now
        };

        let meta = StorageMetadata {
            document_id: document_id.to_string(),
            version,
            content_hash: hash,
            size: stored.len() as u64,
            compressed,
            encrypted: false,
            created_at,
            updated_at: now,
            content_type: "text/plain".to_string(),
            custom: custom.unwrap_or(serde_json::Value::Null),
        };

        let _guard = self.lock.lock().await;
        std::fs::write(self.doc_path(document_id), &stored)?;
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;

        Ok(meta)
    }

    async fn load(&self, document_id: &str) -> Result<StoredDocument> {
        let doc_path = self.doc_path(document_id);
        let meta_path = self.meta_path(document_id);

        if !doc_path.exists() {
            return Err(CoreError::DocumentNotFound(document_id.to_string()));
        }

        let meta: StorageMetadata = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
        let bytes = std::fs::read(&doc_path)?;
        let content = verify_and_decompress(bytes, &meta, &self.config)?;

        Ok(StoredDocument { content, metadata: meta })
    }

    async fn delete(&self, document_id: &str) -> Result<bool> {
        let doc_path = self.doc_path(document_id);
        if !doc_path.exists() {
            return Ok(false);
        }

        let _guard = self.lock.lock().await;
        let _ = std::fs::remove_file(&doc_path);
        let _ = std::fs::remove_file(self.meta_path(document_id));
        Ok(true)
    }

    async fn exists(&self, document_id: &str) -> Result<bool> {
        Ok(self.doc_path(document_id).exists())
    }

    async fn list_documents(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let docs_dir = self.base_path.join("documents");
        let mut ids = Vec::new();

        for entry in std::fs::read_dir(&docs_dir)? {
            let entry = entry?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                let doc_id = stem.replace('_', "/");
                if prefix.map(|p| doc_id.starts_with(p)).unwrap_or(true) {
                    ids.push(doc_id);
                }
            }
        }

        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn get_metadata(&self, document_id: &str) -> Result<StorageMetadata> {
        let meta_path = self.meta_path(document_id);
        if !meta_path.exists() {
            return Err(CoreError::DocumentNotFound(document_id.to_string()));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?)
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let docs_dir = self.base_path.join("documents");
        let mut total_size = 0u64;
        let mut count = 0usize;

        for entry in std::fs::read_dir(&docs_dir)? {
            let entry = entry?;
            total_size += entry.metadata()?.len();
            count += 1;
        }

        Ok(StorageStats {
            backend: "file",
            document_count: count,
            total_size,
            max_size: self.config.max_total_size,
            utilization: if self.config.max_total_size > 0 {
                total_size as f64 / self.config.max_total_size as f64
            } else {
                0.0
            },
        })
    }

    async fn cleanup(&self, max_age: std::time::Duration) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let meta_dir = self.base_path.join("metadata");
        let mut removed = 0usize;

        let _guard = self.lock.lock().await;
        for entry in std::fs::read_dir(&meta_dir)? {
            let entry = entry?;
            let path = entry.path();
            let text = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(_) => continue,
            };
            let meta: StorageMetadata = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(_) => continue,
            };

            if meta.updated_at < cutoff {
                let _ = std::fs::remove_file(self.doc_path(&meta.document_id));
                let _ = std::fs::remove_file(&path);
                removed += 1;
            }
        }

        Ok(removed)
    }
}

/// Running totals tracked by [`StorageManager`].
#[derive(Debug, Default, Serialize)]
pub struct StorageManagerStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub fallback_reads: u64,
    pub errors: u64,
    pub running: bool,
}

/// Composes a primary and optional secondary [`StorageBackend`].
pub struct StorageManager {
    primary: Arc<dyn StorageBackend>,
    secondary: Option<Arc<dyn StorageBackend>>,
    config: StorageConfig,
    running: std::sync::atomic::AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    fallback_reads: AtomicU64,
    errors: AtomicU64,
    cleanup_stop: Arc<tokio::sync::Notify>,
}

impl StorageManager {
    pub fn new(
        primary: Arc<dyn StorageBackend>,
        secondary: Option<Arc<dyn StorageBackend>>,
        config: StorageConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            config,
            running: std::sync::atomic::AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            fallback_reads: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cleanup_stop: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Spawn the retention sweeper, if `auto_cleanup` is enabled.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);

        if !self.config.auto_cleanup {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(max_age) = this.config.max_age {
                            if let Err(e) = this.primary.cleanup(max_age).await {
                                log::error!("storage cleanup error: {e}");
                            }
                            if let Some(secondary) = &this.secondary {
                                if let Err(e) = secondary.cleanup(max_age).await {
                                    log::error!("secondary storage cleanup error: {e}");
                                }
                            }
                        }
                    }
                    _ = this.cleanup_stop.notified() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cleanup_stop.notify_waiters();
    }

    pub async fn save(
        &self,
        document_id: &str,
        content: &[u8],
        version: u64,
        custom: Option<serde_json::Value>,
    ) -> Result<StorageMetadata> {
        self.writes.fetch_add(1, Ordering::SeqCst);

        let result = self.primary.save(document_id, content, version, custom.clone()).await;

        if result.is_err() {
            self.errors.fetch_add(1, Ordering::SeqCst);
            return result;
        }

        if let Some(secondary) = &self.secondary {
            if let Err(e) = secondary.save(document_id, content, version, custom).await {
                log::warn!("secondary save failed for {document_id}: {e}");
            }
        }

        result
    }

    pub async fn load(&self, document_id: &str) -> Result<StoredDocument> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        match self.primary.load(document_id).await {
            Ok(doc) => Ok(doc),
            Err(CoreError::DocumentNotFound(_)) => self.load_from_secondary(document_id).await,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::SeqCst);
                if let Some(secondary) = &self.secondary {
                    self.fallback_reads.fetch_add(1, Ordering::SeqCst);
                    if let Ok(doc) = secondary.load(document_id).await {
                        return Ok(doc);
                    }
                }
                Err(e)
            }
        }
    }

    async fn load_from_secondary(&self, document_id: &str) -> Result<StoredDocument> {
        let secondary = match &self.secondary {
            Some(s) => s,
            None => return Err(CoreError::DocumentNotFound(document_id.to_string())),
        };

        self.fallback_reads.fetch_add(1, Ordering::SeqCst);
        let doc = secondary.load(document_id).await?;

        // Repair the primary with the recovered content.
        let _ = self
            .primary
            .save(document_id, &doc.content, doc.metadata.version, Some(doc.metadata.custom.clone()))
            .await;

        Ok(doc)
    }

    pub async fn delete(&self, document_id: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let primary_deleted = self.primary.delete(document_id).await?;

        if let Some(secondary) = &self.secondary {
            if let Err(e) = secondary.delete(document_id).await {
                log::warn!("secondary delete failed for {document_id}: {e}");
            }
        }

        Ok(primary_deleted)
    }

    pub async fn exists(&self, document_id: &str) -> Result<bool> {
        if self.primary.exists(document_id).await? {
            return Ok(true);
        }
        if let Some(secondary) = &self.secondary {
            return secondary.exists(document_id).await;
        }
        Ok(false)
    }

    pub async fn list_documents(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<String>> {
        self.primary.list_documents(prefix, limit).await
    }

    pub async fn get_metadata(&self, document_id: &str) -> Result<StorageMetadata> {
        match self.primary.get_metadata(document_id).await {
            Err(CoreError::DocumentNotFound(_)) if self.secondary.is_some() => {
                self.secondary.as_ref().unwrap().get_metadata(document_id).await
            }
            other => other,
        }
    }

    pub fn get_stats(&self) -> StorageManagerStats {
        StorageManagerStats {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
            fallback_reads: self.fallback_reads.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
        }
    }
}

static GLOBAL_STORAGE: once_cell::sync::OnceCell<Arc<StorageManager>> = once_cell::sync::OnceCell::new();

/// Returns the process-wide storage manager, lazily constructing one backed
/// by in-memory storage with default configuration on first use.
pub fn get_storage() -> Arc<StorageManager> {
    GLOBAL_STORAGE
        .get_or_init(|| Arc::new(StorageManager::new(Arc::new(InMemoryStorage::new(StorageConfig::default())), None, StorageConfig::default())))
        .clone()
}

/// Installs the process-wide storage manager. Fails if one is already set.
pub fn set_storage(manager: Arc<StorageManager>) -> Result<()> {
    GLOBAL_STORAGE
        .set(manager)
        .map_err(|_| crate::error::CoreError::InvalidInput("storage manager already initialized".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig {
            compression_threshold: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn round_trip_uncompressed() {
        let storage = InMemoryStorage::new(StorageConfig::default());
        storage.save("doc1", b"hi", 1, None).await.unwrap();
        let loaded = storage.load("doc1").await.unwrap();
        assert_eq!(loaded.content, b"hi");
        assert!(!loaded.metadata.compressed);
    }

    #[tokio::test]
    async fn round_trip_compressed() {
        let storage = InMemoryStorage::new(config());
        let content = b"a long enough payload to exceed the threshold";
        storage.save("doc1", content, 1, None).await.unwrap();
        let loaded = storage.load("doc1").await.unwrap();
        assert_eq!(loaded.content, content);
        assert!(loaded.metadata.compressed);
    }

    #[tokio::test]
    async fn created_at_preserved_on_overwrite() {
        let storage = InMemoryStorage::new(StorageConfig::default());
        let first = storage.save("doc1", b"v1", 1, None).await.unwrap();
        let second = storage.save("doc1", b"v2", 2, None).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn corruption_detected() {
        let storage = InMemoryStorage::new(StorageConfig::default());
        storage.save("doc1", b"hi", 1, None).await.unwrap();
        {
            let mut docs = storage.documents.lock().await;
            docs.get_mut("doc1").unwrap().0 = b"tampered".to_vec();
        }
        let err = storage.load("doc1").await.unwrap_err();
        assert!(matches!(err, CoreError::Corruption { .. }));
    }

    #[tokio::test]
    async fn manager_falls_back_and_repairs_primary() {
        let primary = Arc::new(InMemoryStorage::new(StorageConfig::default()));
        let secondary = Arc::new(InMemoryStorage::new(StorageConfig::default()));
        secondary.save("doc1", b"from secondary", 1, None).await.unwrap();

        let manager = StorageManager::new(primary.clone(), Some(secondary), StorageConfig::default());
        let loaded = manager.load("doc1").await.unwrap();
        assert_eq!(loaded.content, b"from secondary");

        // Primary should now have been repaired.
        assert!(primary.exists("doc1").await.unwrap());
        assert_eq!(manager.get_stats().fallback_reads, 1);
    }

    #[tokio::test]
    async fn manager_delete_hits_both_backends() {
        let primary = Arc::new(InMemoryStorage::new(StorageConfig::default()));
        let secondary = Arc::new(InMemoryStorage::new(StorageConfig::default()));
        let manager = StorageManager::new(primary.clone(), Some(secondary.clone()), StorageConfig::default());

        manager.save("doc1", b"hi", 1, None).await.unwrap();
        assert!(manager.delete("doc1").await.unwrap());
        assert!(!primary.exists("doc1").await.unwrap());
        assert!(!secondary.exists("doc1").await.unwrap());
    }

    #[tokio::test]
    async fn file_storage_round_trip() {
        let dir = std::env::temp_dir().join(format!("collab-core-test-{}", uuid::Uuid::new_v4()));
        let storage = FileStorage::new(&dir, StorageConfig::default()).unwrap();
        storage.save("doc1", b"on disk", 1, None).await.unwrap();
        let loaded = storage.load("doc1").await.unwrap();
        assert_eq!(loaded.content, b"on disk");
        std::fs::remove_dir_all(&dir).ok();
    }
}
