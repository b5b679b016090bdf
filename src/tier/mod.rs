//! Storage tiers.
//!
//! - [`hot`]: in-process LRU map with lazy expiry
//! - [`warm`]: persistent local store, one file per key
//! - [`archive`]: adapter over an external object store
//!
//! All three implement [`TierBackend`]; the controller selects one by [`Tier`].

pub mod archive;
pub mod hot;
pub mod warm;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::entry::{CacheEntry, CacheKey, Tier};

/// Typed failure of a tier backend. The controller maps every variant to a miss.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{tier} tier unavailable: {reason}")]
    Unavailable { tier: Tier, reason: String },

    #[error("{tier} entry {key} is corrupt: {reason}")]
    Corruption {
        tier: Tier,
        key: CacheKey,
        reason: String,
    },
}

impl BackendError {
    pub fn unavailable(tier: Tier, reason: impl std::fmt::Display) -> Self {
        BackendError::Unavailable {
            tier,
            reason: reason.to_string(),
        }
    }

    pub fn corruption(tier: Tier, key: &CacheKey, reason: impl std::fmt::Display) -> Self {
        BackendError::Corruption {
            tier,
            key: key.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Capability set shared by every tier.
#[async_trait]
pub trait TierBackend: Send + Sync {
    /// Which tier this backend implements.
    fn tier(&self) -> Tier;

    /// Fetch a live entry. Expired or missing entries are `Ok(None)`.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError>;

    /// Store `entry` under `key` for `ttl`, returning the stored copy.
    async fn set(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<CacheEntry, BackendError>;

    /// Store `entry` only if the live copy still has `expected_revision`.
    ///
    /// Returns `None` when the entry changed or disappeared in the meantime.
    async fn replace_if(
        &self,
        key: &CacheKey,
        expected_revision: u64,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<Option<CacheEntry>, BackendError>;

    /// Remove an entry. Returns whether anything was removed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError>;

    /// Keys whose expiry falls within `window` from now (already expired included).
    async fn list_expiring(&self, window: Duration) -> Result<Vec<CacheKey>, BackendError>;

    /// Eagerly drop entries past their deadline. Returns how many were removed.
    ///
    /// Backends whose store expires objects on its own keep the default.
    async fn sweep_expired(&self) -> Result<usize, BackendError> {
        Ok(0)
    }
}
