//! Hot tier: bounded in-process LRU map.
//!
//! Expiry is checked lazily on `get` and swept periodically. Capacity pressure
//! evicts the least recently used entry regardless of its TTL; live victims are
//! parked in a spill buffer so the controller can demote them.

use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::entry::{unix_millis, CacheEntry, CacheKey, Tier};
use crate::tier::{BackendError, TierBackend};

pub struct HotTier {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    spilled: Mutex<Vec<CacheEntry>>,
    capacity: usize,
}

impl HotTier {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            spilled: Mutex::new(Vec::new()),
            capacity: cap.get(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = unix_millis();
        let mut entries = self.entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, e)| e.metadata.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Swept expired hot entries");
        }
        expired.len()
    }

    /// Take the live entries evicted by capacity pressure since the last call.
    pub fn take_spilled(&self) -> Vec<CacheEntry> {
        std::mem::take(&mut *self.spilled.lock())
    }

    fn insert(&self, key: &CacheKey, stored: CacheEntry) {
        let evicted = self.entries.lock().push(key.clone(), stored);
        if let Some((victim_key, victim)) = evicted {
            if &victim_key != key && !victim.metadata.is_expired(unix_millis()) {
                debug!(key = %victim_key, "Hot tier full, evicting LRU entry");
                self.spilled.lock().push(victim);
            }
        }
    }
}

#[async_trait]
impl TierBackend for HotTier {
    fn tier(&self) -> Tier {
        Tier::Hot
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
        let now = unix_millis();
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) => entry.metadata.is_expired(now),
            None => return Ok(None),
        };
        if expired {
            entries.pop(key);
            return Ok(None);
        }
        Ok(entries.peek(key).cloned())
    }

    async fn set(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<CacheEntry, BackendError> {
        let stored = entry.stored_copy(Tier::Hot, ttl, unix_millis());
        self.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace_if(
        &self,
        key: &CacheKey,
        expected_revision: u64,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<Option<CacheEntry>, BackendError> {
        let now = unix_millis();
        let mut entries = self.entries.lock();
        let matches = entries
            .peek(key)
            .map(|current| {
                current.metadata.revision == expected_revision && !current.metadata.is_expired(now)
            })
            .unwrap_or(false);
        if !matches {
            return Ok(None);
        }
        let stored = entry.stored_copy(Tier::Hot, ttl, now);
        entries.put(key.clone(), stored.clone());
        Ok(Some(stored))
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError> {
        Ok(self.entries.lock().pop(key).is_some())
    }

    async fn list_expiring(&self, window: Duration) -> Result<Vec<CacheKey>, BackendError> {
        let horizon = unix_millis().saturating_add(window.as_millis() as u64);
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.metadata.expires_at <= horizon)
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn sweep_expired(&self) -> Result<usize, BackendError> {
        Ok(HotTier::sweep_expired(self))
    }
}
