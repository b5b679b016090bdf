//! Cache entry types: tiers, normalized keys and per-entry metadata.
//!
//! An entry is the unit of movement between tiers. It carries its payload plus
//! the metadata the heuristics read and the controller mutates on every hit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies which storage tier an entry currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Tier 0: in-process memory (hot).
    Hot,
    /// Tier 1: local persistent store (warm).
    Warm,
    /// Tier 2: external object store (archive).
    Archive,
}

impl Tier {
    /// Returns the numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            Tier::Hot => 0,
            Tier::Warm => 1,
            Tier::Archive => 2,
        }
    }

    /// Whether `self` is a faster tier than `other`.
    pub fn is_hotter_than(&self, other: Tier) -> bool {
        self.level() < other.level()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Archive => "archive",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hot" => Ok(Tier::Hot),
            "warm" => Ok(Tier::Warm),
            "archive" | "remote" | "cold" => Ok(Tier::Archive),
            other => Err(format!("unknown tier {other:?}")),
        }
    }
}

/// Normalized cache key: lower-hex SHA-256 of the model and the
/// whitespace-normalized prompt, so repeated requests collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a model request.
    pub fn for_request(model: &str, prompt: &str) -> Self {
        let normalized = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut hasher = Sha256::new();
        hasher.update(model.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(normalized.as_bytes());
        CacheKey(format!("{:x}", hasher.finalize()))
    }

    /// Accept an already-normalized key; anything else is hashed as a bare prompt.
    pub fn from_raw(raw: &str) -> Self {
        if Self::is_normalized(raw) {
            CacheKey(raw.to_string())
        } else {
            Self::for_request("", raw)
        }
    }

    /// Whether `raw` has the shape of a normalized key.
    pub fn is_normalized(raw: &str) -> bool {
        raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character prefix used to shard on-disk layouts.
    pub fn shard(&self) -> &str {
        self.0.get(..2).unwrap_or("00")
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request-level features used only as heuristic inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestFeatures {
    /// Perplexity of the generated response.
    pub perplexity: Option<f64>,

    /// Volatility of the answer over time, in [0, 1].
    pub time_variance: Option<f64>,

    /// Upstream cost of regenerating the entry.
    pub cost_tokens: Option<u64>,
}

/// Metadata stored alongside every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryMetadata {
    /// Unix milliseconds at creation.
    pub inserted_at: u64,

    /// Unix milliseconds of the most recent hit (or creation).
    pub last_accessed: u64,

    /// Number of hits since creation.
    pub access_count: u64,

    /// Current TTL, clamped to the configured window.
    pub ttl_seconds: u64,

    /// Unix milliseconds after which the hot/warm copy is dead.
    pub expires_at: u64,

    /// Derived priority, informational only.
    pub score: f64,

    /// Tier the entry was last written to.
    pub current_tier: Tier,

    /// Unique per stored copy; drives compare-and-set on hits.
    pub revision: u64,

    /// Heuristic inputs captured at write time.
    pub features: RequestFeatures,
}

impl Default for EntryMetadata {
    fn default() -> Self {
        Self {
            inserted_at: 0,
            last_accessed: 0,
            access_count: 0,
            ttl_seconds: 0,
            expires_at: 0,
            score: 0.0,
            current_tier: Tier::Hot,
            revision: 0,
            features: RequestFeatures::default(),
        }
    }
}

impl EntryMetadata {
    /// Fresh metadata for an entry created at `now_ms`.
    pub fn new(features: RequestFeatures, now_ms: u64) -> Self {
        Self {
            inserted_at: now_ms,
            last_accessed: now_ms,
            features,
            ..Default::default()
        }
    }

    /// Record a hit.
    pub fn touch(&mut self, now_ms: u64) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = self.last_accessed.max(now_ms);
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at != 0 && now_ms >= self.expires_at
    }

    /// Time left before expiry (zero once expired).
    pub fn remaining_ttl(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_ms))
    }

    /// Seconds since the last hit.
    pub fn idle_secs(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_accessed) / 1000
    }
}

/// A cached response and its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Bytes,
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: impl Into<Bytes>, metadata: EntryMetadata) -> Self {
        Self {
            key,
            payload: payload.into(),
            metadata,
        }
    }

    /// Copy of this entry as stored in `tier` with the given TTL.
    ///
    /// Every stored copy gets a fresh revision and an expiry deadline.
    pub fn stored_copy(&self, tier: Tier, ttl: Duration, now_ms: u64) -> CacheEntry {
        let mut copy = self.clone();
        copy.metadata.current_tier = tier;
        copy.metadata.revision = next_revision();
        copy.metadata.expires_at = now_ms.saturating_add(ttl.as_millis() as u64);
        copy
    }
}

static LAST_REVISION: AtomicU64 = AtomicU64::new(0);

/// Next process-wide revision.
///
/// Strictly increasing and never reused, so two independent writes of the
/// same key can never share a revision. Seeded from the clock so copies
/// persisted by an earlier run stay behind.
pub fn next_revision() -> u64 {
    let floor = unix_millis().saturating_mul(1_000);
    let mut current = LAST_REVISION.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_add(1).max(floor);
        match LAST_REVISION.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
