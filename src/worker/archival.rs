//! Archival worker.
//!
//! On every tick the worker asks the warm tier for entries within
//! `archive_horizon_secs` of expiry, uploads each to the archive with a longer
//! retention, and only then deletes the warm copy. A failed upload is retried
//! with exponential backoff; if it never succeeds the warm copy is left alone
//! to expire normally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cache::entry::{unix_millis, CacheEntry, CacheKey};
use crate::cache::heuristics::HeuristicsEngine;
use crate::cache::metrics::CacheMetrics;
use crate::config::{ArchiveConfig, Config, WorkerConfig};
use crate::tier::{BackendError, TierBackend};

/// Counts from one archival pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub scanned: usize,
    pub archived: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Archived,
    Failed,
    Skipped,
}

pub struct ArchivalWorker {
    warm: Arc<dyn TierBackend>,
    archive: Arc<dyn TierBackend>,
    heuristics: HeuristicsEngine,
    config: WorkerConfig,
    archive_config: ArchiveConfig,
    metrics: Arc<CacheMetrics>,
    offload_disabled: Arc<AtomicBool>,
}

/// Handle to a running worker task.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker and wait for its current pass to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Archival worker task ended abnormally: {e}");
        }
    }
}

impl ArchivalWorker {
    pub fn new(
        config: &Config,
        warm: Arc<dyn TierBackend>,
        archive: Arc<dyn TierBackend>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            warm,
            archive,
            heuristics: HeuristicsEngine::new(config.heuristics.clone()),
            config: config.worker.clone(),
            archive_config: config.archive.clone(),
            metrics,
            offload_disabled: Arc::new(AtomicBool::new(config.controller.disable_offload)),
        }
    }

    /// Shared offload switch; the controller flips it at runtime.
    pub fn offload_flag(&self) -> Arc<AtomicBool> {
        self.offload_disabled.clone()
    }

    /// Spawn the periodic loop.
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let interval = self.config.interval();
        let task = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Archival worker started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_once().await;
                        if report.scanned > 0 {
                            info!(
                                scanned = report.scanned,
                                archived = report.archived,
                                failed = report.failed,
                                skipped = report.skipped,
                                "Archival pass complete"
                            );
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Archival worker stopped");
        });
        WorkerHandle { shutdown, task }
    }

    /// One scan of the warm tier.
    pub async fn run_once(&self) -> ArchiveReport {
        let keys = match self.warm.list_expiring(self.config.horizon()).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Archival scan failed: {e}");
                return ArchiveReport::default();
            }
        };

        let mut report = ArchiveReport {
            scanned: keys.len(),
            ..Default::default()
        };
        let outcomes: Vec<Outcome> = stream::iter(keys)
            .map(|key| async move { self.archive_key(&key).await })
            .buffer_unordered(self.archive_config.max_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Archived => report.archived += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Skipped => report.skipped += 1,
            }
        }
        report
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn archive_key(&self, key: &CacheKey) -> Outcome {
        let entry = match self.warm.get(key).await {
            Ok(Some(entry)) => entry,
            // Expired (and now removed) or deleted since the scan.
            Ok(None) => return Outcome::Skipped,
            Err(e) => {
                warn!("Skipping archival, warm read failed: {e}");
                return Outcome::Skipped;
            }
        };

        let retention = self.archive_config.retention_for(entry.metadata.ttl_seconds);
        if self.offload_disabled.load(Ordering::Relaxed) {
            let decision = self.heuristics.decide(&entry.metadata, unix_millis());
            info!(
                heuristic_tier = %decision.tier,
                retention_secs = retention,
                "Offload disabled, not archiving"
            );
            return Outcome::Skipped;
        }

        if let Err(e) = self
            .upload_with_retry(key, &entry, Duration::from_secs(retention))
            .await
        {
            warn!(attempts = self.config.max_retries, "Archival upload gave up, keeping warm copy: {e}");
            self.metrics.archive_failures.inc();
            return Outcome::Failed;
        }
        self.metrics.archive_uploads.inc();

        // Leave the warm copy if a hit refreshed it mid-upload.
        match self.warm.get(key).await {
            Ok(Some(current)) if current.metadata.revision == entry.metadata.revision => {
                if let Err(e) = self.warm.delete(key).await {
                    warn!("Archived but failed to drop warm copy: {e}");
                }
            }
            Ok(Some(_)) => debug!("Warm copy changed during upload, keeping it"),
            Ok(None) => {}
            Err(e) => warn!("Archived but could not re-read warm copy: {e}"),
        }
        debug!(retention_secs = retention, "Archived warm entry");
        Outcome::Archived
    }

    async fn upload_with_retry(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<CacheEntry, BackendError> {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.archive.set(key, entry, ttl).await {
                Ok(stored) => return Ok(stored),
                Err(e) if attempt < attempts => {
                    let delay = self.config.backoff(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Archive upload failed, retrying: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch and decode an archived entry for a deep miss.
    pub async fn hydrate(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
        let entry = self.archive.get(key).await?;
        if entry.is_some() {
            self.metrics.hydrations.inc();
            debug!(key = %key, "Hydrated entry from archive");
        }
        Ok(entry)
    }
}
