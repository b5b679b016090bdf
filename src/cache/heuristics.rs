//! Heuristics: map entry metadata to a TTL and a target tier.
//!
//! Everything here is pure. Bad inputs degrade to neutral values and a warning;
//! they never surface as errors, so a broken heuristic only makes caching less
//! effective.

use serde_json::{Map, Value};
use tracing::warn;

use crate::cache::entry::{EntryMetadata, RequestFeatures, Tier};
use crate::config::HeuristicsConfig;

/// Perplexity at which the TTL boost starts.
const PERPLEXITY_FLOOR: f64 = 10.0;

/// Heuristic inputs, already extracted from an entry or a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeuristicInput {
    /// Hit count. Negative or non-finite values are rejected.
    pub access_count: f64,
    pub perplexity: Option<f64>,
    pub time_variance: Option<f64>,
    /// Seconds since the last access; `None` means "just now".
    pub idle_secs: Option<u64>,
}

impl Default for HeuristicInput {
    fn default() -> Self {
        Self {
            access_count: 0.0,
            perplexity: None,
            time_variance: None,
            idle_secs: None,
        }
    }
}

impl HeuristicInput {
    pub fn from_metadata(meta: &EntryMetadata, now_ms: u64) -> Self {
        Self {
            access_count: meta.access_count as f64,
            perplexity: meta.features.perplexity,
            time_variance: meta.features.time_variance,
            idle_secs: Some(meta.idle_secs(now_ms)),
        }
    }
}

/// Thresholds for [`select_backend`].
#[derive(Debug, Clone, Copy)]
pub struct TierThresholds {
    pub hot_threshold: f64,
    pub archive_threshold: f64,
    pub variance_threshold: f64,
}

impl From<&HeuristicsConfig> for TierThresholds {
    fn from(cfg: &HeuristicsConfig) -> Self {
        Self {
            hot_threshold: cfg.hot_threshold,
            archive_threshold: cfg.archive_threshold,
            variance_threshold: cfg.variance_threshold,
        }
    }
}

fn clamp_ttl(ttl: f64, min_ttl: u64, max_ttl: u64) -> u64 {
    if !ttl.is_finite() {
        return max_ttl.max(min_ttl);
    }
    (ttl.max(0.0) as u64).clamp(min_ttl, max_ttl.max(min_ttl))
}

fn valid_perplexity(value: Option<f64>) -> Option<f64> {
    match value {
        Some(p) if p.is_finite() && p >= 0.0 => Some(p),
        Some(p) => {
            warn!(perplexity = p, "Malformed perplexity, using neutral default");
            None
        }
        None => None,
    }
}

fn valid_variance(value: Option<f64>) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() => Some(v.clamp(0.0, 1.0)),
        Some(v) => {
            warn!(time_variance = v, "Malformed time_variance, using neutral default");
            None
        }
        None => None,
    }
}

/// Compute a TTL in seconds.
///
/// ```text
/// ttl = base_ttl × (1 + α·ln(1 + access_count))
///                × (1 + max(0, perplexity − 10) / 100)
///                × (1 − γ·time_variance)
/// ```
///
/// clamped to `[min_ttl, max_ttl]`. A rejected `access_count` falls back to
/// `base_ttl` clamped.
pub fn compute_ttl(
    input: &HeuristicInput,
    base_ttl: u64,
    min_ttl: u64,
    max_ttl: u64,
    alpha: f64,
    gamma: f64,
) -> u64 {
    let access_count = input.access_count;
    if !access_count.is_finite() || access_count < 0.0 {
        warn!(access_count, "Malformed access_count, falling back to base TTL");
        return clamp_ttl(base_ttl as f64, min_ttl, max_ttl);
    }

    let access_influence = 1.0 + alpha * access_count.ln_1p();

    let perplexity_factor = valid_perplexity(input.perplexity)
        .map(|p| (p - PERPLEXITY_FLOOR).max(0.0) / 100.0)
        .unwrap_or(0.0);

    let variance_penalty = 1.0 - gamma * valid_variance(input.time_variance).unwrap_or(0.0);

    let ttl = base_ttl as f64 * access_influence * (1.0 + perplexity_factor) * variance_penalty;
    clamp_ttl(ttl, min_ttl, max_ttl)
}

/// Pick the tier an entry should live in.
///
/// Precedence, with ties resolving to the less aggressive tier:
/// 1. perplexity ≥ archive_threshold → archive
/// 2. time_variance ≥ variance_threshold → warm
/// 3. perplexity < hot_threshold and idle < recent_seconds → hot
/// 4. otherwise → warm
pub fn select_backend(input: &HeuristicInput, thresholds: TierThresholds, recent_seconds: u64) -> Tier {
    let perplexity = valid_perplexity(input.perplexity).unwrap_or(0.0);
    let variance = valid_variance(input.time_variance).unwrap_or(0.0);
    let idle = input.idle_secs.unwrap_or(0);

    if perplexity >= thresholds.archive_threshold {
        return Tier::Archive;
    }
    if variance >= thresholds.variance_threshold {
        return Tier::Warm;
    }
    if perplexity < thresholds.hot_threshold && idle < recent_seconds {
        return Tier::Hot;
    }
    Tier::Warm
}

/// Informational priority: frequent, unsurprising entries score highest.
pub fn score(input: &HeuristicInput) -> f64 {
    let access = if input.access_count.is_finite() && input.access_count > 0.0 {
        input.access_count.ln_1p()
    } else {
        0.0
    };
    let perplexity_factor = valid_perplexity(input.perplexity)
        .map(|p| (p - PERPLEXITY_FLOOR).max(0.0) / 100.0)
        .unwrap_or(0.0);
    access / (1.0 + perplexity_factor)
}

fn numeric_field(map: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, ()> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or(()),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| ()),
        Some(_) => Err(()),
    }
}

/// Extract request features from a loosely-typed metadata map.
///
/// Non-numeric fields are replaced with neutral defaults and logged.
pub fn features_from_map(map: &Map<String, Value>) -> RequestFeatures {
    let mut features = RequestFeatures::default();

    match numeric_field(map, "perplexity") {
        Ok(value) => features.perplexity = value,
        Err(()) => warn!(value = ?map.get("perplexity"), "Malformed perplexity, using neutral default"),
    }
    match numeric_field(map, "time_variance") {
        Ok(value) => features.time_variance = value,
        Err(()) => warn!(value = ?map.get("time_variance"), "Malformed time_variance, using neutral default"),
    }
    match numeric_field(map, "cost_tokens") {
        Ok(Some(value)) if value.is_finite() && value >= 0.0 => {
            features.cost_tokens = Some(value as u64)
        }
        Ok(None) => {}
        _ => warn!(value = ?map.get("cost_tokens"), "Malformed cost_tokens, ignoring"),
    }

    features
}

/// Outcome of evaluating an entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub ttl_seconds: u64,
    pub tier: Tier,
    pub score: f64,
}

/// The heuristics engine, bound to a configuration.
#[derive(Debug, Clone)]
pub struct HeuristicsEngine {
    config: HeuristicsConfig,
}

impl HeuristicsEngine {
    pub fn new(config: HeuristicsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HeuristicsConfig {
        &self.config
    }

    pub fn ttl_for(&self, input: &HeuristicInput) -> u64 {
        compute_ttl(
            input,
            self.config.base_ttl,
            self.config.min_ttl,
            self.config.max_ttl,
            self.config.alpha,
            self.config.gamma,
        )
    }

    pub fn tier_for(&self, input: &HeuristicInput) -> Tier {
        select_backend(input, (&self.config).into(), self.config.recent_seconds)
    }

    /// TTL, tier and score for an entry as of `now_ms`.
    pub fn decide(&self, meta: &EntryMetadata, now_ms: u64) -> Decision {
        let input = HeuristicInput::from_metadata(meta, now_ms);
        Decision {
            ttl_seconds: self.ttl_for(&input),
            tier: self.tier_for(&input),
            score: score(&input),
        }
    }
}
