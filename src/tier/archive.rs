//! Archive tier: adapter over an external object store.
//!
//! Entries are packed (codec + zstd) into opaque blobs. Each object carries
//! its expiry deadline next to the blob so the store can be scanned without
//! downloading payloads. Every store call runs under a concurrency cap and a
//! timeout; failures surface as [`BackendError::Unavailable`].

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache::compressor::Compressor;
use crate::cache::entry::{unix_millis, CacheEntry, CacheKey, Tier};
use crate::config::ArchiveConfig;
use crate::tier::{BackendError, TierBackend};

const WRITE_STRIPES: usize = 16;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Object store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed object sidecar: {0}")]
    Sidecar(#[from] serde_json::Error),

    #[error("Object store rejected request: {0}")]
    Rejected(String),
}

/// A blob together with its expiry deadline (unix ms, 0 = never).
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub blob: Bytes,
    pub expires_at: u64,
}

/// Minimal object-store surface the archive tier needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, name: &str, blob: Bytes, expires_at: u64) -> Result<(), ObjectStoreError>;

    async fn get_object(&self, name: &str) -> Result<Option<StoredObject>, ObjectStoreError>;

    async fn delete_object(&self, name: &str) -> Result<bool, ObjectStoreError>;

    /// Names of objects whose deadline is at or before `horizon_ms`.
    async fn list_expiring(&self, horizon_ms: u64) -> Result<Vec<String>, ObjectStoreError>;
}

// ─── In-memory store ───────────────────────────────────────────────────────

/// Object store held in process memory.
///
/// Used when no external store is configured and in tests; `fail_next_puts`
/// injects transient upload failures.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    puts: AtomicU64,
    failing_puts: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful uploads so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Make the next `n` uploads fail.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, name: &str, blob: Bytes, expires_at: u64) -> Result<(), ObjectStoreError> {
        let injected = self
            .failing_puts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ObjectStoreError::Rejected("injected failure".to_string()));
        }
        self.objects
            .lock()
            .insert(name.to_string(), StoredObject { blob, expires_at });
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get_object(&self, name: &str) -> Result<Option<StoredObject>, ObjectStoreError> {
        Ok(self.objects.lock().get(name).cloned())
    }

    async fn delete_object(&self, name: &str) -> Result<bool, ObjectStoreError> {
        Ok(self.objects.lock().remove(name).is_some())
    }

    async fn list_expiring(&self, horizon_ms: u64) -> Result<Vec<String>, ObjectStoreError> {
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|(_, o)| o.expires_at <= horizon_ms)
            .map(|(name, _)| name.clone())
            .collect())
    }
}

// ─── Local filesystem store ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    name: String,
    expires_at: u64,
    size: u64,
}

/// Object store backed by a local directory: `<name>.blob` plus a
/// `<name>.json` sidecar holding the expiry.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ObjectStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.blob"))
    }

    fn sidecar_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ObjectStoreError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_sidecar(&self, name: &str) -> Result<Option<Sidecar>, ObjectStoreError> {
        match fs::read(self.sidecar_path(name)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(&self, name: &str, blob: Bytes, expires_at: u64) -> Result<(), ObjectStoreError> {
        let sidecar = Sidecar {
            name: name.to_string(),
            expires_at,
            size: blob.len() as u64,
        };
        // Blob first: a sidecar never points at a missing blob.
        Self::write_atomic(&self.blob_path(name), &blob).await?;
        Self::write_atomic(&self.sidecar_path(name), &serde_json::to_vec(&sidecar)?).await?;
        Ok(())
    }

    async fn get_object(&self, name: &str) -> Result<Option<StoredObject>, ObjectStoreError> {
        let Some(sidecar) = self.read_sidecar(name).await? else {
            return Ok(None);
        };
        match fs::read(self.blob_path(name)).await {
            Ok(blob) => Ok(Some(StoredObject {
                blob: Bytes::from(blob),
                expires_at: sidecar.expires_at,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, name: &str) -> Result<bool, ObjectStoreError> {
        let existed = match fs::remove_file(self.sidecar_path(name)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(self.blob_path(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_expiring(&self, horizon_ms: u64) -> Result<Vec<String>, ObjectStoreError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read(&path).await?;
            match serde_json::from_slice::<Sidecar>(&raw) {
                Ok(sidecar) if sidecar.expires_at <= horizon_ms => names.push(sidecar.name),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), "Skipping malformed sidecar: {e}"),
            }
        }
        Ok(names)
    }
}

// ─── Tier adapter ──────────────────────────────────────────────────────────

pub struct ArchiveTier {
    store: Arc<dyn ObjectStore>,
    compressor: Compressor,
    permits: Semaphore,
    timeout: Duration,
    write_locks: Vec<tokio::sync::Mutex<()>>,
}

impl ArchiveTier {
    pub fn new(store: Arc<dyn ObjectStore>, config: &ArchiveConfig) -> Self {
        Self {
            store,
            compressor: Compressor::new(config.zstd_level),
            permits: Semaphore::new(config.max_concurrency.max(1)),
            timeout: config.op_timeout(),
            write_locks: (0..WRITE_STRIPES).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    /// Archive tier over the local directory store configured in `config`.
    pub async fn open_local(config: &ArchiveConfig) -> Result<Self, BackendError> {
        let store = LocalObjectStore::open(&config.local_root)
            .await
            .map_err(|e| BackendError::unavailable(Tier::Archive, e))?;
        Ok(Self::new(Arc::new(store), config))
    }

    fn stripe(&self, key: &CacheKey) -> &tokio::sync::Mutex<()> {
        let slot = u8::from_str_radix(key.shard(), 16).unwrap_or(0) as usize;
        &self.write_locks[slot % WRITE_STRIPES]
    }

    /// Run one store call under the concurrency cap and timeout.
    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, ObjectStoreError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| BackendError::unavailable(Tier::Archive, e))?;
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(op, "Archive store call failed: {e}");
                Err(BackendError::unavailable(Tier::Archive, e))
            }
            Err(_) => {
                warn!(op, timeout_ms = self.timeout.as_millis() as u64, "Archive store call timed out");
                Err(BackendError::unavailable(
                    Tier::Archive,
                    format!("{op} timed out after {:?}", self.timeout),
                ))
            }
        }
    }

    async fn fetch(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
        let Some(object) = self.call("get", self.store.get_object(key.as_str())).await? else {
            return Ok(None);
        };
        if object.expires_at != 0 && unix_millis() >= object.expires_at {
            return Ok(None);
        }
        let entry = self
            .compressor
            .unpack(&object.blob)
            .map_err(|e| BackendError::corruption(Tier::Archive, key, e))?;
        Ok(Some(entry))
    }

    async fn upload(&self, key: &CacheKey, stored: &CacheEntry) -> Result<(), BackendError> {
        let blob = self
            .compressor
            .pack(stored)
            .map_err(|e| BackendError::corruption(Tier::Archive, key, e))?;
        let size = blob.len();
        self.call(
            "put",
            self.store
                .put_object(key.as_str(), blob, stored.metadata.expires_at),
        )
        .await?;
        debug!(key = %key, size, "Uploaded archive object");
        Ok(())
    }
}

#[async_trait]
impl TierBackend for ArchiveTier {
    fn tier(&self) -> Tier {
        Tier::Archive
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
        self.fetch(key).await
    }

    async fn set(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<CacheEntry, BackendError> {
        let _guard = self.stripe(key).lock().await;
        let stored = entry.stored_copy(Tier::Archive, ttl, unix_millis());
        self.upload(key, &stored).await?;
        Ok(stored)
    }

    async fn replace_if(
        &self,
        key: &CacheKey,
        expected_revision: u64,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<Option<CacheEntry>, BackendError> {
        let _guard = self.stripe(key).lock().await;
        let current = match self.fetch(key).await? {
            Some(current) if current.metadata.revision == expected_revision => current,
            _ => return Ok(None),
        };
        debug!(key = %key, revision = current.metadata.revision, "Replacing archive object");
        let stored = entry.stored_copy(Tier::Archive, ttl, unix_millis());
        self.upload(key, &stored).await?;
        Ok(Some(stored))
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError> {
        let _guard = self.stripe(key).lock().await;
        self.call("delete", self.store.delete_object(key.as_str())).await
    }

    async fn list_expiring(&self, window: Duration) -> Result<Vec<CacheKey>, BackendError> {
        let horizon = unix_millis().saturating_add(window.as_millis() as u64);
        let names = self.call("list", self.store.list_expiring(horizon)).await?;
        Ok(names
            .into_iter()
            .filter(|n| CacheKey::is_normalized(n))
            .map(|n| CacheKey::from_raw(&n))
            .collect())
    }
}
