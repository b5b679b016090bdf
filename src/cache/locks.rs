//! Per-key read/write locks.
//!
//! Lookups hold the read side while reading the tiers and recording their hit;
//! a migration takes the write side only to check and delete its source copy.
//! A reader therefore never observes the window between a copy landing and the
//! source disappearing. Each key gets its own lock, created on first use and
//! dropped with its last guard, so unrelated keys never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::cache::entry::CacheKey;

#[derive(Default)]
pub struct KeyLocks {
    table: Mutex<HashMap<CacheKey, Arc<RwLock<()>>>>,
}

/// Held lock on one key. Releasing the last guard of a key frees its slot.
pub struct KeyGuard<'a, G> {
    locks: &'a KeyLocks,
    key: CacheKey,
    guard: Option<G>,
}

pub type ReadGuard<'a> = KeyGuard<'a, OwnedRwLockReadGuard<()>>;
pub type WriteGuard<'a> = KeyGuard<'a, OwnedRwLockWriteGuard<()>>;

impl<G> Drop for KeyGuard<'_, G> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release(&self.key);
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys with a live lock.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &CacheKey) -> Arc<RwLock<()>> {
        self.table
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn release(&self, key: &CacheKey) {
        let mut table = self.table.lock();
        // Clones are only taken under the table lock, so a count of one means
        // nobody holds or awaits this key.
        if table.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            table.remove(key);
        }
    }

    pub async fn read(&self, key: &CacheKey) -> ReadGuard<'_> {
        let guard = self.slot(key).read_owned().await;
        KeyGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    pub async fn write(&self, key: &CacheKey) -> WriteGuard<'_> {
        let guard = self.slot(key).write_owned().await;
        KeyGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }
}
