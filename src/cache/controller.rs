//! Cache controller: orchestrates entries across the hot, warm and archive tiers.
//!
//! The controller is the central coordinator. It:
//! - Reads tiers hottest-first on lookup, falling back to an archive hydrate
//! - Places new entries where the heuristics say, with no intermediate hop
//! - Moves entries between tiers (copy, then delete the source)
//! - Collapses concurrent misses on one key into a single upstream call
//!
//! Backend failures never reach the caller of `lookup`: they are turned into
//! misses in [`CacheController::degrade`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::entry::{unix_millis, CacheEntry, CacheKey, EntryMetadata, RequestFeatures, Tier};
use crate::cache::heuristics::{Decision, HeuristicsEngine};
use crate::cache::locks::KeyLocks;
use crate::cache::metrics::{CacheMetrics, MetricsSnapshot};
use crate::cache::singleflight::SingleFlight;
use crate::config::{ArchiveConfig, Config, ControllerConfig, TtlMode};
use crate::tier::hot::HotTier;
use crate::tier::{BackendError, TierBackend};
use crate::upstream::UpstreamError;
use crate::worker::ArchivalWorker;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{0} tier is not configured")]
    TierNotConfigured(Tier),
}

/// The backends a controller drives.
pub struct Tiers {
    pub hot: Arc<HotTier>,
    pub warm: Arc<dyn TierBackend>,
    pub archive: Option<Arc<dyn TierBackend>>,
}

/// Result of [`CacheController::lookup`].
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub found: bool,
    pub payload: Option<Bytes>,
    /// Tier the entry was found in.
    pub tier: Option<Tier>,
    /// Metadata after the hit was recorded.
    pub metadata: Option<EntryMetadata>,
}

impl LookupResult {
    fn miss() -> Self {
        Self {
            found: false,
            payload: None,
            tier: None,
            metadata: None,
        }
    }

    fn hit(entry: CacheEntry, tier: Tier) -> Self {
        Self {
            found: true,
            payload: Some(entry.payload),
            tier: Some(tier),
            metadata: Some(entry.metadata),
        }
    }
}

/// Result of [`CacheController::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PutResult {
    pub tier: Tier,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Migrated { from: Tier, to: Tier },
    AlreadyInTier,
    NotFound,
    /// Another migration of the same key is running.
    InProgress,
    /// Offload is disabled; the decision was logged only.
    Skipped,
    /// The source kept changing under the copy; it stays where it was.
    Contended,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Migrated { .. } => "migrated",
            MigrationStatus::AlreadyInTier => "already_in_tier",
            MigrationStatus::NotFound => "not_found",
            MigrationStatus::InProgress => "in_progress",
            MigrationStatus::Skipped => "skipped",
            MigrationStatus::Contended => "contended",
        }
    }
}

/// Where a key currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Absent,
    Stable(Tier),
    Migrating { from: Tier, to: Tier },
}

/// Result of [`CacheController::get_or_compute`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub payload: Bytes,
    pub tier: Option<Tier>,
    /// Served from cache rather than computed by this call's flight.
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStats {
    pub hot_entries: usize,
    pub hot_capacity: usize,
    pub archive_configured: bool,
    pub offload_disabled: bool,
    pub in_flight: usize,
    pub migrating: usize,
    pub metrics: MetricsSnapshot,
}

/// Source tier (once located) and destination of a running migration.
type Migrations = Mutex<HashMap<CacheKey, (Option<Tier>, Tier)>>;

/// Unregisters a migration however it ends.
struct MigrationGuard<'a> {
    migrating: &'a Migrations,
    key: CacheKey,
}

impl MigrationGuard<'_> {
    fn located(&self, from: Tier) {
        if let Some(slot) = self.migrating.lock().get_mut(&self.key) {
            slot.0 = Some(from);
        }
    }
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.migrating.lock().remove(&self.key);
    }
}

pub struct CacheController {
    heuristics: HeuristicsEngine,
    config: ControllerConfig,
    archive_config: ArchiveConfig,
    hot: Arc<HotTier>,
    warm: Arc<dyn TierBackend>,
    archive: Option<Arc<dyn TierBackend>>,
    worker: Option<Arc<ArchivalWorker>>,
    locks: KeyLocks,
    flights: SingleFlight<Resolved, UpstreamError>,
    migrating: Migrations,
    offload_disabled: Arc<AtomicBool>,
    metrics: Arc<CacheMetrics>,
}

/// Thread-safe shared controller.
pub type SharedController = Arc<CacheController>;

impl CacheController {
    pub fn new(config: &Config, tiers: Tiers, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            heuristics: HeuristicsEngine::new(config.heuristics.clone()),
            config: config.controller.clone(),
            archive_config: config.archive.clone(),
            hot: tiers.hot,
            warm: tiers.warm,
            archive: tiers.archive,
            worker: None,
            locks: KeyLocks::new(),
            flights: SingleFlight::new(),
            migrating: Mutex::new(HashMap::new()),
            offload_disabled: Arc::new(AtomicBool::new(config.controller.disable_offload)),
            metrics,
        }
    }

    /// Route deep misses through `worker` and share its offload switch.
    pub fn with_worker(mut self, worker: Arc<ArchivalWorker>) -> Self {
        let flag = worker.offload_flag();
        flag.store(self.offload_disabled(), Ordering::Relaxed);
        self.offload_disabled = flag;
        self.worker = Some(worker);
        self
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn offload_disabled(&self) -> bool {
        self.offload_disabled.load(Ordering::Relaxed)
    }

    /// Runtime toggle: while disabled, decisions are logged but entries stay put.
    pub fn set_offload_disabled(&self, disabled: bool) {
        let was = self.offload_disabled.swap(disabled, Ordering::Relaxed);
        if was != disabled {
            info!(disabled, "Offload toggled");
        }
    }

    fn backend(&self, tier: Tier) -> Option<&dyn TierBackend> {
        match tier {
            Tier::Hot => Some(&*self.hot as &dyn TierBackend),
            Tier::Warm => Some(&*self.warm),
            Tier::Archive => self.archive.as_deref(),
        }
    }

    /// Turn a backend failure into a miss.
    fn degrade(&self, tier: Tier, key: &CacheKey, err: &BackendError) {
        self.metrics.record_backend_error(tier);
        match err {
            BackendError::Corruption { .. } => {
                error!(key = %key, tier = %tier, "Corrupt entry treated as miss: {err}")
            }
            BackendError::Unavailable { .. } => {
                warn!(key = %key, tier = %tier, "Tier unavailable, treating as miss: {err}")
            }
        }
    }

    async fn read_tier(&self, tier: Tier, key: &CacheKey) -> Option<CacheEntry> {
        let backend = self.backend(tier)?;
        match backend.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                self.degrade(tier, key, &e);
                None
            }
        }
    }

    /// Hot, then warm, then (if `deep`) an archive hydrate through the worker.
    async fn read_through(&self, key: &CacheKey, deep: bool) -> Option<(CacheEntry, Tier)> {
        for tier in [Tier::Hot, Tier::Warm] {
            if let Some(entry) = self.read_tier(tier, key).await {
                return Some((entry, tier));
            }
        }
        if !(deep && self.config.deep_miss) {
            return None;
        }
        let worker = self.worker.as_ref()?;
        match worker.hydrate(key).await {
            Ok(Some(entry)) => Some((entry, Tier::Archive)),
            Ok(None) => None,
            Err(e) => {
                self.degrade(Tier::Archive, key, &e);
                None
            }
        }
    }

    /// First tier holding the key, archive included.
    async fn locate(&self, key: &CacheKey) -> Option<(CacheEntry, Tier)> {
        for tier in [Tier::Hot, Tier::Warm, Tier::Archive] {
            if let Some(entry) = self.read_tier(tier, key).await {
                return Some((entry, tier));
            }
        }
        None
    }

    #[instrument(skip(self), fields(key = %key))]
    pub async fn lookup(&self, key: &CacheKey) -> LookupResult {
        let timer = self.metrics.lookup_latency.start_timer();
        // The read and its hit update form one critical section, so a
        // migration never deletes a source between the two.
        let (result, promotion) = {
            let _read = self.locks.read(key).await;
            match self.read_through(key, true).await {
                None => {
                    self.metrics.misses.inc();
                    debug!("Cache miss");
                    (LookupResult::miss(), None)
                }
                Some((entry, tier)) => {
                    self.metrics.record_hit(tier);
                    debug!(tier = %tier, "Cache hit");
                    let (entry, promotion) = self.on_hit(key, entry, tier).await;
                    (LookupResult::hit(entry, tier), promotion)
                }
            }
        };

        if let Some(to) = promotion {
            match self.migrate(key, to).await {
                Ok(status) => debug!(status = status.as_str(), "Promotion after hit"),
                Err(e) => warn!(key = %key, "Promotion after hit failed: {e}"),
            }
        }
        timer.observe_duration();
        result
    }

    /// Record a hit. Returns the updated entry and the tier it should be
    /// promoted to, if any. Callers hold the key's read lock.
    async fn on_hit(&self, key: &CacheKey, entry: CacheEntry, tier: Tier) -> (CacheEntry, Option<Tier>) {
        let now = unix_millis();
        if tier == Tier::Archive {
            return (self.reinsert_hydrated(key, entry, now).await, None);
        }

        let (updated, decision) = self.update_on_hit(key, entry, tier, now).await;
        if !(self.config.promote_on_hit && decision.tier.is_hotter_than(tier)) {
            return (updated, None);
        }
        if self.offload_disabled() {
            info!(key = %key, from = %tier, to = %decision.tier, "Offload disabled, not promoting");
            return (updated, None);
        }
        (updated, Some(decision.tier))
    }

    /// Hit bookkeeping for `current`: one more access, fresh score and TTL.
    fn refresh(&self, current: &CacheEntry, now: u64) -> (CacheEntry, Duration, Decision) {
        let mut next = current.clone();
        next.metadata.touch(now);
        let decision = self.heuristics.decide(&next.metadata, now);
        next.metadata.score = decision.score;
        let ttl = match self.heuristics.config().ttl_mode {
            TtlMode::Sliding => {
                next.metadata.ttl_seconds = decision.ttl_seconds;
                Duration::from_secs(decision.ttl_seconds)
            }
            TtlMode::Fixed => current.metadata.remaining_ttl(now),
        };
        (next, ttl, decision)
    }

    /// Compare-and-set the hit update, re-reading on conflict.
    ///
    /// After `max_update_attempts` conflicts the update is written anyway.
    /// An entry that vanished in the meantime is left gone.
    async fn update_on_hit(
        &self,
        key: &CacheKey,
        mut current: CacheEntry,
        tier: Tier,
        now: u64,
    ) -> (CacheEntry, Decision) {
        let (mut next, mut ttl, mut decision) = self.refresh(&current, now);
        let Some(backend) = self.backend(tier) else {
            return (next, decision);
        };

        let attempts = self.config.max_update_attempts.max(1);
        for attempt in 1..=attempts {
            match backend
                .replace_if(key, current.metadata.revision, &next, ttl)
                .await
            {
                Ok(Some(stored)) => return (stored, decision),
                Ok(None) => {
                    self.metrics.update_conflicts.inc();
                    debug!(key = %key, attempt, "Concurrent metadata update, re-reading");
                    match backend.get(key).await {
                        Ok(Some(fresh)) => {
                            current = fresh;
                            (next, ttl, decision) = self.refresh(&current, now);
                        }
                        Ok(None) => {
                            debug!(key = %key, "Entry left {tier} during hit update");
                            return (next, decision);
                        }
                        Err(e) => {
                            self.degrade(tier, key, &e);
                            return (next, decision);
                        }
                    }
                }
                Err(e) => {
                    self.degrade(tier, key, &e);
                    return (next, decision);
                }
            }
        }

        warn!(key = %key, attempts, "Metadata update kept conflicting, last writer wins");
        match backend.set(key, &next, ttl).await {
            Ok(stored) => (stored, decision),
            Err(e) => {
                self.degrade(tier, key, &e);
                (next, decision)
            }
        }
    }

    /// Put a hydrated archive entry back into the hot tier with a fresh TTL.
    /// The archive copy stays under its own retention.
    async fn reinsert_hydrated(&self, key: &CacheKey, entry: CacheEntry, now: u64) -> CacheEntry {
        let mut next = entry;
        next.metadata.touch(now);
        let decision = self.heuristics.decide(&next.metadata, now);
        next.metadata.ttl_seconds = decision.ttl_seconds;
        next.metadata.score = decision.score;

        if self.offload_disabled() {
            info!(key = %key, heuristic_tier = %decision.tier, "Offload disabled, serving archive hit in place");
            return next;
        }

        match self
            .hot
            .set(key, &next, Duration::from_secs(decision.ttl_seconds))
            .await
        {
            Ok(stored) => {
                self.demote_spilled().await;
                debug!(key = %key, ttl_seconds = decision.ttl_seconds, "Reinserted hydrated entry into hot tier");
                stored
            }
            Err(e) => {
                self.degrade(Tier::Hot, key, &e);
                next
            }
        }
    }

    /// Move entries the hot tier evicted under capacity pressure down to warm.
    async fn demote_spilled(&self) {
        let spilled = self.hot.take_spilled();
        let now = unix_millis();
        for entry in spilled {
            if self.offload_disabled() {
                debug!(key = %entry.key, "Offload disabled, dropping evicted hot entry");
                continue;
            }
            let ttl = entry.metadata.remaining_ttl(now);
            if ttl.is_zero() {
                continue;
            }
            match self.warm.set(&entry.key, &entry, ttl).await {
                Ok(_) => {
                    self.metrics.record_migration("evicted");
                    debug!(key = %entry.key, "Demoted evicted hot entry to warm");
                }
                Err(e) => self.degrade(Tier::Warm, &entry.key, &e),
            }
        }
        self.metrics.hot_entries.set(self.hot.len() as i64);
    }

    /// Store a freshly computed response where the heuristics place it.
    #[instrument(skip(self, payload, features), fields(key = %key))]
    pub async fn put(&self, key: &CacheKey, payload: Bytes, features: RequestFeatures) -> PutResult {
        let now = unix_millis();
        let mut meta = EntryMetadata::new(features, now);
        let decision = self.heuristics.decide(&meta, now);
        meta.ttl_seconds = decision.ttl_seconds;
        meta.score = decision.score;

        let mut tier = decision.tier;
        if tier != Tier::Hot && self.offload_disabled() {
            info!(heuristic_tier = %decision.tier, "Offload disabled, storing in hot tier");
            tier = Tier::Hot;
        }
        if tier == Tier::Archive && self.archive.is_none() {
            debug!("No archive configured, storing in warm tier");
            tier = Tier::Warm;
        }

        let entry = CacheEntry::new(key.clone(), payload, meta);
        let ttl = if tier == Tier::Archive {
            Duration::from_secs(self.archive_config.retention_for(decision.ttl_seconds))
        } else {
            Duration::from_secs(decision.ttl_seconds)
        };

        let mut stored_in = tier;
        let written = match self.backend(tier) {
            Some(backend) => backend.set(key, &entry, ttl).await.map(|_| ()),
            None => Err(BackendError::unavailable(tier, "not configured")),
        };
        if let Err(e) = written {
            self.degrade(tier, key, &e);
            if tier != Tier::Hot {
                warn!(key = %key, "Falling back to hot tier");
                let ttl = Duration::from_secs(decision.ttl_seconds);
                if let Err(e) = self.hot.set(key, &entry, ttl).await {
                    self.degrade(Tier::Hot, key, &e);
                }
                stored_in = Tier::Hot;
            }
        }

        // Drop copies left in other local tiers by an earlier put.
        for other in [Tier::Hot, Tier::Warm] {
            if other == stored_in {
                continue;
            }
            if let Some(backend) = self.backend(other) {
                if let Err(e) = backend.delete(key).await {
                    self.degrade(other, key, &e);
                }
            }
        }

        // Same for an archived copy.
        if stored_in != Tier::Archive {
            if let Some(archive) = &self.archive {
                if let Err(e) = archive.delete(key).await {
                    self.degrade(Tier::Archive, key, &e);
                }
            }
        }

        if stored_in == Tier::Hot {
            self.demote_spilled().await;
        }
        self.metrics.record_put(stored_in);
        info!(
            tier = %stored_in,
            ttl_seconds = decision.ttl_seconds,
            score = decision.score,
            "Stored entry"
        );
        PutResult {
            tier: stored_in,
            ttl_seconds: decision.ttl_seconds,
        }
    }

    fn begin_migration(&self, key: &CacheKey, to: Tier) -> Option<MigrationGuard<'_>> {
        let mut migrating = self.migrating.lock();
        if migrating.contains_key(key) {
            return None;
        }
        migrating.insert(key.clone(), (None, to));
        Some(MigrationGuard {
            migrating: &self.migrating,
            key: key.clone(),
        })
    }

    fn migration_ttl(&self, entry: &CacheEntry, from: Tier, to: Tier) -> Duration {
        match (from, to) {
            (_, Tier::Archive) => {
                Duration::from_secs(self.archive_config.retention_for(entry.metadata.ttl_seconds))
            }
            (Tier::Archive, _) => Duration::from_secs(
                entry
                    .metadata
                    .ttl_seconds
                    .max(self.heuristics.config().min_ttl),
            ),
            _ => entry.metadata.remaining_ttl(unix_millis()),
        }
    }

    /// Move `key` into `to`: copy first, then delete the source under the
    /// key's write lock.
    ///
    /// The source is deleted only if it still holds the revision that was
    /// copied; a hit recorded during the copy sends the fresh entry across
    /// again. Retrying after a failed delete is safe and clears the leftover.
    /// A migration out of the archive leaves the archive copy in place.
    #[instrument(skip(self), fields(key = %key, to = %to))]
    pub async fn migrate(&self, key: &CacheKey, to: Tier) -> Result<MigrationStatus, ControllerError> {
        if self.offload_disabled() {
            info!("Offload disabled, migration skipped");
            self.metrics.record_migration(MigrationStatus::Skipped.as_str());
            return Ok(MigrationStatus::Skipped);
        }
        let Some(dest) = self.backend(to) else {
            return Err(ControllerError::TierNotConfigured(to));
        };

        // Registered before the source is located, so two migrations of one
        // key never act on the same snapshot.
        let Some(guard) = self.begin_migration(key, to) else {
            self.metrics.record_migration(MigrationStatus::InProgress.as_str());
            return Ok(MigrationStatus::InProgress);
        };
        let Some((mut entry, from)) = self.locate(key).await else {
            self.metrics.record_migration(MigrationStatus::NotFound.as_str());
            return Ok(MigrationStatus::NotFound);
        };
        if from == to {
            if let Err(e) = self.drop_leftover(key, &entry, to).await {
                self.metrics.record_migration("failed");
                return Err(e);
            }
            self.metrics.record_migration(MigrationStatus::AlreadyInTier.as_str());
            return Ok(MigrationStatus::AlreadyInTier);
        }
        guard.located(from);

        let attempts = self.config.max_update_attempts.max(1);
        let mut moved = false;
        for attempt in 1..=attempts {
            let ttl = self.migration_ttl(&entry, from, to);
            let copied = match dest.set(key, &entry, ttl).await {
                Ok(copied) => copied,
                Err(e) => {
                    self.metrics.record_migration("failed");
                    return Err(e.into());
                }
            };
            if from == Tier::Archive {
                moved = true;
                break;
            }

            let write = self.locks.write(key).await;
            let Some(source) = self.backend(from) else {
                break;
            };
            match source.get(key).await {
                Ok(Some(current)) if current.metadata.revision != entry.metadata.revision => {
                    debug!(key = %key, attempt, "Source changed during copy, copying again");
                    drop(write);
                    entry = current;
                    continue;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    drop(write);
                    info!(from = %from, "Source vanished during copy, undoing it");
                    self.undo_copy(key, dest, &copied).await;
                    self.metrics.record_migration(MigrationStatus::NotFound.as_str());
                    return Ok(MigrationStatus::NotFound);
                }
                Err(e) => {
                    self.metrics.record_migration("failed");
                    return Err(e.into());
                }
            }
            if let Err(e) = source.delete(key).await {
                self.metrics.record_migration("failed");
                return Err(e.into());
            }
            moved = true;
            break;
        }
        if !moved {
            warn!(from = %from, attempts, "Source kept changing, leaving it in place");
            self.metrics.record_migration(MigrationStatus::Contended.as_str());
            return Ok(MigrationStatus::Contended);
        }

        if to == Tier::Hot {
            self.demote_spilled().await;
        } else {
            self.metrics.hot_entries.set(self.hot.len() as i64);
        }

        info!(from = %from, "Migrated entry");
        let status = MigrationStatus::Migrated { from, to };
        self.metrics.record_migration(status.as_str());
        Ok(status)
    }

    /// Remove a warm copy left behind by a promotion whose delete failed.
    ///
    /// Only copies older than the hot one go; a newer warm copy belongs to a
    /// put that has not yet cleared the hot tier.
    async fn drop_leftover(&self, key: &CacheKey, kept: &CacheEntry, tier: Tier) -> Result<(), ControllerError> {
        if tier != Tier::Hot {
            return Ok(());
        }
        let _write = self.locks.write(key).await;
        match self.warm.get(key).await {
            Ok(Some(stale)) if stale.metadata.revision < kept.metadata.revision => {
                self.warm.delete(key).await?;
                info!(key = %key, "Removed leftover warm copy");
            }
            Ok(_) => {}
            Err(BackendError::Corruption { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Take back a copy whose source was deleted or replaced mid-migration,
    /// unless something newer has landed over it since.
    async fn undo_copy(&self, key: &CacheKey, dest: &dyn TierBackend, copied: &CacheEntry) {
        let tier = dest.tier();
        match dest.get(key).await {
            Ok(Some(current)) if current.metadata.revision == copied.metadata.revision => {
                if let Err(e) = dest.delete(key).await {
                    self.degrade(tier, key, &e);
                }
            }
            Ok(_) => {}
            Err(e) => self.degrade(tier, key, &e),
        }
    }

    /// Lookup, and on a miss compute the payload once for all concurrent callers.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        features: RequestFeatures,
        compute: F,
    ) -> Result<Resolved, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, UpstreamError>>,
    {
        let hit = self.lookup(key).await;
        if let (true, Some(payload)) = (hit.found, hit.payload) {
            return Ok(Resolved {
                payload,
                tier: hit.tier,
                cached: true,
            });
        }

        let wait = self.config.singleflight_timeout();
        let (result, role) = self
            .flights
            .run(key, wait, move || async move {
                // A flight that finished just before this one may have stored it.
                let stored = {
                    let _read = self.locks.read(key).await;
                    match self.read_through(key, true).await {
                        Some((entry, Tier::Archive)) => {
                            let entry = self.reinsert_hydrated(key, entry, unix_millis()).await;
                            Some((entry, Tier::Archive))
                        }
                        found => found,
                    }
                };
                if let Some((entry, tier)) = stored {
                    return Ok(Resolved {
                        payload: entry.payload,
                        tier: Some(tier),
                        cached: true,
                    });
                }

                self.metrics.upstream_calls.inc();
                let payload = match compute().await {
                    Ok(payload) => payload,
                    Err(e) => return Err(e),
                };
                let put = self.put(key, payload.clone(), features).await;
                Ok::<_, UpstreamError>(Resolved {
                    payload,
                    tier: Some(put.tier),
                    cached: false,
                })
            })
            .await;
        debug!(key = %key, ?role, ok = result.is_ok(), "Miss resolved");
        result
    }

    /// Remove `key` from every tier, archive included.
    ///
    /// The archive goes first and outside the key lock; a hydrate racing it
    /// lands in hot and is removed with the local copies.
    pub async fn delete(&self, key: &CacheKey) -> Result<bool, ControllerError> {
        let mut removed = false;
        let mut first_err = None;
        let mut record = |tier: Tier, outcome: Result<bool, BackendError>| match outcome {
            Ok(r) => removed |= r,
            Err(e) => {
                warn!(key = %key, tier = %tier, "Delete failed: {e}");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        if let Some(archive) = &self.archive {
            record(Tier::Archive, archive.delete(key).await);
        }
        {
            let _write = self.locks.write(key).await;
            record(Tier::Hot, self.hot.delete(key).await);
            record(Tier::Warm, self.warm.delete(key).await);
        }
        self.metrics.hot_entries.set(self.hot.len() as i64);
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }

    pub async fn state(&self, key: &CacheKey) -> KeyState {
        let migrating = self.migrating.lock().get(key).copied();
        if let Some((Some(from), to)) = migrating {
            return KeyState::Migrating { from, to };
        }
        match self.locate(key).await {
            Some((_, tier)) => KeyState::Stable(tier),
            None => KeyState::Absent,
        }
    }

    /// Drop expired hot and warm entries and demote anything capacity
    /// pressure evicted. Returns how many entries were removed.
    pub async fn sweep(&self) -> usize {
        let mut removed = self.hot.sweep_expired();
        match self.warm.sweep_expired().await {
            Ok(n) => removed += n,
            Err(e) => {
                self.metrics.record_backend_error(Tier::Warm);
                warn!("Warm sweep failed: {e}");
            }
        }
        self.demote_spilled().await;
        removed
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            hot_entries: self.hot.len(),
            hot_capacity: self.hot.capacity(),
            archive_configured: self.archive.is_some(),
            offload_disabled: self.offload_disabled(),
            in_flight: self.flights.in_flight(),
            migrating: self.migrating.lock().len(),
            metrics: self.metrics.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::archive::{ArchiveTier, MemoryObjectStore};

    fn controller() -> (CacheController, Arc<HotTier>, Arc<HotTier>) {
        let config = Config::default();
        let hot = Arc::new(HotTier::new(16));
        // An in-memory stand-in keeps these tests off the filesystem.
        let warm = Arc::new(HotTier::new(64));
        let archive: Arc<dyn TierBackend> = Arc::new(ArchiveTier::new(
            Arc::new(MemoryObjectStore::new()),
            &config.archive,
        ));
        let metrics = Arc::new(CacheMetrics::new().unwrap());
        let worker = Arc::new(ArchivalWorker::new(
            &config,
            warm.clone(),
            archive.clone(),
            metrics.clone(),
        ));
        let controller = CacheController::new(
            &config,
            Tiers {
                hot: hot.clone(),
                warm: warm.clone(),
                archive: Some(archive),
            },
            metrics,
        )
        .with_worker(worker);
        (controller, hot, warm)
    }

    fn key(prompt: &str) -> CacheKey {
        CacheKey::for_request("m", prompt)
    }

    #[tokio::test]
    async fn test_put_then_lookup_counts_one_access() {
        let (c, _, _) = controller();
        let k = key("hello");
        let put = c.put(&k, Bytes::from("world"), RequestFeatures::default()).await;
        assert_eq!(put.tier, Tier::Hot);
        assert_eq!(put.ttl_seconds, 3600);

        let hit = c.lookup(&k).await;
        assert!(hit.found);
        assert_eq!(hit.payload.unwrap(), Bytes::from("world"));
        assert_eq!(hit.metadata.unwrap().access_count, 1);
    }

    #[tokio::test]
    async fn test_high_perplexity_goes_straight_to_archive() {
        let (c, hot, warm) = controller();
        let k = key("weird");
        let features = RequestFeatures {
            perplexity: Some(80.0),
            ..Default::default()
        };
        let put = c.put(&k, Bytes::from("x"), features).await;
        assert_eq!(put.tier, Tier::Archive);
        assert!(hot.is_empty());
        assert!(warm.is_empty());
        assert_eq!(c.state(&k).await, KeyState::Stable(Tier::Archive));
    }

    #[tokio::test]
    async fn test_migrate_statuses() {
        let (c, _, _) = controller();
        let k = key("move me");
        assert_eq!(c.migrate(&k, Tier::Warm).await.unwrap(), MigrationStatus::NotFound);

        c.put(&k, Bytes::from("v"), RequestFeatures::default()).await;
        assert_eq!(
            c.migrate(&k, Tier::Warm).await.unwrap(),
            MigrationStatus::Migrated {
                from: Tier::Hot,
                to: Tier::Warm
            }
        );
        assert_eq!(c.migrate(&k, Tier::Warm).await.unwrap(), MigrationStatus::AlreadyInTier);
        assert_eq!(c.state(&k).await, KeyState::Stable(Tier::Warm));
    }

    #[tokio::test]
    async fn test_warm_hit_promotes_to_hot() {
        let (c, hot, warm) = controller();
        let k = key("promote");
        c.put(&k, Bytes::from("v"), RequestFeatures::default()).await;
        c.migrate(&k, Tier::Warm).await.unwrap();
        assert!(hot.is_empty());

        let hit = c.lookup(&k).await;
        assert_eq!(hit.tier, Some(Tier::Warm));
        assert_eq!(c.state(&k).await, KeyState::Stable(Tier::Hot));
        assert!(warm.is_empty());
    }

    #[tokio::test]
    async fn test_deep_miss_rehydrates_into_hot() {
        let (c, hot, _) = controller();
        let k = key("cold");
        c.put(&k, Bytes::from("v"), RequestFeatures::default()).await;
        c.migrate(&k, Tier::Archive).await.unwrap();
        assert!(hot.is_empty());

        let hit = c.lookup(&k).await;
        assert_eq!(hit.tier, Some(Tier::Archive));
        assert_eq!(hit.payload.unwrap(), Bytes::from("v"));
        assert_eq!(hot.len(), 1);
        assert_eq!(c.metrics().hydrations.get(), 1);
    }

    #[tokio::test]
    async fn test_offload_disabled_keeps_everything_hot() {
        let (c, hot, _) = controller();
        c.set_offload_disabled(true);
        let k = key("stay");
        let features = RequestFeatures {
            perplexity: Some(90.0),
            ..Default::default()
        };
        assert_eq!(c.put(&k, Bytes::from("v"), features).await.tier, Tier::Hot);
        assert_eq!(c.migrate(&k, Tier::Warm).await.unwrap(), MigrationStatus::Skipped);
        assert_eq!(hot.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_reaches_every_tier() {
        let (c, _, _) = controller();
        let k = key("gone");
        c.put(&k, Bytes::from("v"), RequestFeatures::default()).await;
        c.migrate(&k, Tier::Archive).await.unwrap();
        assert!(c.delete(&k).await.unwrap());
        assert_eq!(c.state(&k).await, KeyState::Absent);
        assert!(!c.lookup(&k).await.found);
    }

    #[tokio::test]
    async fn test_capacity_eviction_demotes_to_warm() {
        let (c, hot, warm) = controller();
        for i in 0..20 {
            c.put(&key(&format!("p{i}")), Bytes::from("v"), RequestFeatures::default())
                .await;
        }
        assert_eq!(hot.len(), 16);
        assert_eq!(warm.len(), 4);
        assert!(c.lookup(&key("p0")).await.found);
    }
}
