//! Warm tier: persistent local store.
//!
//! One file per key, laid out as `<root>/<shard>/<key>.entry` where the shard
//! is the first two hex characters of the key. Files hold the versioned codec
//! envelope and are replaced atomically (temp file + rename), so entries survive
//! restarts. An in-memory expiry index is rebuilt from disk on [`WarmTier::open`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::codec;
use crate::cache::entry::{unix_millis, CacheEntry, CacheKey, Tier};
use crate::tier::{BackendError, TierBackend};

const ENTRY_EXT: &str = "entry";
const TMP_EXT: &str = "tmp";
const WRITE_STRIPES: usize = 64;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    expires_at: u64,
    revision: u64,
}

pub struct WarmTier {
    root: PathBuf,
    index: RwLock<HashMap<CacheKey, IndexEntry>>,
    /// Writers of the same key serialize on one stripe.
    write_locks: Vec<Mutex<()>>,
}

fn unavailable(e: impl std::fmt::Display) -> BackendError {
    BackendError::unavailable(Tier::Warm, e)
}

impl WarmTier {
    /// Open (or create) a warm store rooted at `root` and rebuild its index.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(unavailable)?;

        let tier = Self {
            root,
            index: RwLock::new(HashMap::new()),
            write_locks: (0..WRITE_STRIPES).map(|_| Mutex::new(())).collect(),
        };
        let loaded = tier.rebuild_index().await?;
        info!(root = %tier.root.display(), entries = loaded, "Warm tier opened");
        Ok(tier)
    }

    async fn rebuild_index(&self) -> Result<usize, BackendError> {
        let mut index = HashMap::new();
        let mut shards = fs::read_dir(&self.root).await.map_err(unavailable)?;
        while let Some(shard) = shards.next_entry().await.map_err(unavailable)? {
            if !shard.file_type().await.map_err(unavailable)?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await.map_err(unavailable)?;
            while let Some(file) = files.next_entry().await.map_err(unavailable)? {
                let path = file.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some(ENTRY_EXT) => {}
                    Some(TMP_EXT) => {
                        // Interrupted write; the previous file (if any) is intact.
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    _ => continue,
                }
                match Self::read_file(&path).await {
                    Ok(entry) => {
                        index.insert(
                            entry.key.clone(),
                            IndexEntry {
                                expires_at: entry.metadata.expires_at,
                                revision: entry.metadata.revision,
                            },
                        );
                    }
                    Err(e) => warn!(path = %path.display(), "Skipping unreadable warm entry: {e}"),
                }
            }
        }
        let count = index.len();
        *self.index.write() = index;
        Ok(count)
    }

    async fn read_file(path: &Path) -> Result<CacheEntry, String> {
        let data = fs::read(path).await.map_err(|e| e.to_string())?;
        codec::decode(Bytes::from(data)).map_err(|e| e.to_string())
    }

    /// Generate the file path for a key.
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(key.shard())
            .join(format!("{}.{ENTRY_EXT}", key.as_str()))
    }

    fn stripe(&self, key: &CacheKey) -> &Mutex<()> {
        let slot = u8::from_str_radix(key.shard(), 16).unwrap_or(0) as usize;
        &self.write_locks[slot % WRITE_STRIPES]
    }

    /// Write a stored copy to disk. Callers hold the key's stripe lock.
    async fn write_entry(&self, key: &CacheKey, stored: &CacheEntry) -> Result<(), BackendError> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(unavailable)?;
        }

        let data = codec::encode(stored).map_err(|e| BackendError::corruption(Tier::Warm, key, e))?;
        let tmp = path.with_extension(TMP_EXT);
        fs::write(&tmp, &data).await.map_err(unavailable)?;
        fs::rename(&tmp, &path).await.map_err(unavailable)?;

        self.index.write().insert(
            key.clone(),
            IndexEntry {
                expires_at: stored.metadata.expires_at,
                revision: stored.metadata.revision,
            },
        );

        debug!(key = %key, path = %path.display(), size = data.len(), "Wrote warm entry");
        Ok(())
    }

    async fn remove_entry(&self, key: &CacheKey) -> Result<bool, BackendError> {
        let existed = self.index.write().remove(key).is_some();
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(unavailable(e)),
        }
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TierBackend for WarmTier {
    fn tier(&self) -> Tier {
        Tier::Warm
    }

    async fn sweep_expired(&self) -> Result<usize, BackendError> {
        let now = unix_millis();
        let expired: Vec<CacheKey> = self
            .index
            .read()
            .iter()
            .filter(|(_, e)| e.expires_at != 0 && now >= e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            let _guard = self.stripe(&key).lock().await;
            // Re-check under the lock: a writer may have refreshed it.
            let still_expired = self
                .index
                .read()
                .get(&key)
                .map(|e| e.expires_at != 0 && now >= e.expires_at)
                .unwrap_or(false);
            if still_expired && self.remove_entry(&key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Swept expired warm entries");
        }
        Ok(removed)
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
        let indexed = self.index.read().get(key).copied();
        let Some(indexed) = indexed else {
            return Ok(None);
        };

        let now = unix_millis();
        if indexed.expires_at != 0 && now >= indexed.expires_at {
            let _guard = self.stripe(key).lock().await;
            self.remove_entry(key).await?;
            return Ok(None);
        }

        let path = self.entry_path(key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.index.write().remove(key);
                return Ok(None);
            }
            Err(e) => return Err(unavailable(e)),
        };

        match codec::decode(Bytes::from(data)) {
            Ok(entry) if entry.metadata.is_expired(now) => Ok(None),
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                let _guard = self.stripe(key).lock().await;
                self.remove_entry(key).await?;
                Err(BackendError::corruption(Tier::Warm, key, e))
            }
        }
    }

    async fn set(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<CacheEntry, BackendError> {
        let _guard = self.stripe(key).lock().await;
        let stored = entry.stored_copy(Tier::Warm, ttl, unix_millis());
        self.write_entry(key, &stored).await?;
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
        let now = unix_millis();
        let matches = self
            .index
            .read()
            .get(key)
            .map(|e| e.revision == expected_revision && !(e.expires_at != 0 && now >= e.expires_at))
            .unwrap_or(false);
        if !matches {
            return Ok(None);
        }
        let stored = entry.stored_copy(Tier::Warm, ttl, now);
        self.write_entry(key, &stored).await?;
        Ok(Some(stored))
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError> {
        let _guard = self.stripe(key).lock().await;
        let removed = self.remove_entry(key).await?;
        if removed {
            debug!(key = %key, "Deleted warm entry");
        }
        Ok(removed)
    }

    async fn list_expiring(&self, window: Duration) -> Result<Vec<CacheKey>, BackendError> {
        let horizon = unix_millis().saturating_add(window.as_millis() as u64);
        let mut keys: Vec<(u64, CacheKey)> = self
            .index
            .read()
            .iter()
            .filter(|(_, e)| e.expires_at <= horizon)
            .map(|(k, e)| (e.expires_at, k.clone()))
            .collect();
        keys.sort();
        Ok(keys.into_iter().map(|(_, k)| k).collect())
    }
}
