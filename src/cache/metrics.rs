//! Prometheus metrics for one cache controller.
//!
//! Each controller owns its own [`Registry`] so several can coexist in one
//! process (tests do this constantly).

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;

use crate::cache::entry::Tier;

const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

pub struct CacheMetrics {
    registry: Registry,
    pub hits: IntCounterVec,
    pub misses: IntCounter,
    pub upstream_calls: IntCounter,
    pub puts: IntCounterVec,
    pub migrations: IntCounterVec,
    pub update_conflicts: IntCounter,
    pub archive_uploads: IntCounter,
    pub archive_failures: IntCounter,
    pub hydrations: IntCounter,
    pub backend_errors: IntCounterVec,
    pub lookup_latency: Histogram,
    pub hot_entries: IntGauge,
}

/// Point-in-time copy of the counters, for JSON stats.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits_hot: u64,
    pub hits_warm: u64,
    pub hits_archive: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub upstream_calls: u64,
    pub update_conflicts: u64,
    pub archive_uploads: u64,
    pub archive_failures: u64,
    pub hydrations: u64,
    pub hot_entries: i64,
}

impl CacheMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("llm_cache".to_string()), None)?;

        let hits = IntCounterVec::new(Opts::new("hits_total", "Lookups served, by tier"), &["tier"])?;
        let misses = IntCounter::new("misses_total", "Lookups that found nothing")?;
        let upstream_calls = IntCounter::new("upstream_calls_total", "Responses computed upstream")?;
        let puts = IntCounterVec::new(Opts::new("puts_total", "Entries stored, by tier"), &["tier"])?;
        let migrations = IntCounterVec::new(
            Opts::new("migrations_total", "Migration requests, by outcome"),
            &["outcome"],
        )?;
        let update_conflicts = IntCounter::new(
            "update_conflicts_total",
            "Hit updates that lost a revision race",
        )?;
        let archive_uploads = IntCounter::new("archive_uploads_total", "Entries uploaded by the archival worker")?;
        let archive_failures = IntCounter::new("archive_failures_total", "Archival uploads that exhausted retries")?;
        let hydrations = IntCounter::new("hydrations_total", "Entries restored from the archive")?;
        let backend_errors = IntCounterVec::new(
            Opts::new("backend_errors_total", "Tier backend failures, by tier"),
            &["tier"],
        )?;
        let lookup_latency = Histogram::with_opts(
            HistogramOpts::new("lookup_duration_seconds", "Lookup latency").buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let hot_entries = IntGauge::new("hot_entries", "Entries resident in the hot tier")?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(upstream_calls.clone()))?;
        registry.register(Box::new(puts.clone()))?;
        registry.register(Box::new(migrations.clone()))?;
        registry.register(Box::new(update_conflicts.clone()))?;
        registry.register(Box::new(archive_uploads.clone()))?;
        registry.register(Box::new(archive_failures.clone()))?;
        registry.register(Box::new(hydrations.clone()))?;
        registry.register(Box::new(backend_errors.clone()))?;
        registry.register(Box::new(lookup_latency.clone()))?;
        registry.register(Box::new(hot_entries.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            upstream_calls,
            puts,
            migrations,
            update_conflicts,
            archive_uploads,
            archive_failures,
            hydrations,
            backend_errors,
            lookup_latency,
            hot_entries,
        })
    }

    pub fn record_hit(&self, tier: Tier) {
        self.hits.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn record_put(&self, tier: Tier) {
        self.puts.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn record_migration(&self, outcome: &str) {
        self.migrations.with_label_values(&[outcome]).inc();
    }

    pub fn record_backend_error(&self, tier: Tier) {
        self.backend_errors.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn hits_for(&self, tier: Tier) -> u64 {
        self.hits.with_label_values(&[tier.as_str()]).get()
    }

    pub fn total_hits(&self) -> u64 {
        [Tier::Hot, Tier::Warm, Tier::Archive]
            .into_iter()
            .map(|t| self.hits_for(t))
            .sum()
    }

    /// Hits over lookups, 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.total_hits();
        let total = hits + self.misses.get();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits_hot: self.hits_for(Tier::Hot),
            hits_warm: self.hits_for(Tier::Warm),
            hits_archive: self.hits_for(Tier::Archive),
            misses: self.misses.get(),
            hit_rate: self.hit_rate(),
            upstream_calls: self.upstream_calls.get(),
            update_conflicts: self.update_conflicts.get(),
            archive_uploads: self.archive_uploads.get(),
            archive_failures: self.archive_failures.get(),
            hydrations: self.hydrations.get(),
            hot_entries: self.hot_entries.get(),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
