//! Runtime configuration for llm-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All tier-related knobs (TTL window, placement thresholds, capacities, archival
//! cadence) live here. Every section falls back to its defaults for missing fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment switch that forces offload off, matching the LMCache convention.
pub const DISABLE_OFFLOAD_ENV: &str = "LMCACHE_DISABLE_OFFLOAD";

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llm-cache-tier", about = "Tiered LLM response cache server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Compute placement decisions but never move entries between tiers.
    #[arg(long)]
    pub disable_offload: bool,
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Invalid configuration. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("min_ttl ({min}) must not exceed max_ttl ({max})")]
    TtlWindow { min: u64, max: u64 },

    #[error("base_ttl ({base}) must lie within [{min}, {max}]")]
    BaseTtlOutOfWindow { base: u64, min: u64, max: u64 },

    #[error("{name} must be a finite, non-negative number (got {value})")]
    InvalidWeight { name: &'static str, value: f64 },

    #[error("archive_threshold ({archive}) must be greater than hot_threshold ({hot})")]
    ThresholdOrder { hot: f64, archive: f64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// TTL and placement heuristics.
    pub heuristics: HeuristicsConfig,

    /// Hot/warm tier configuration.
    pub tiers: TierConfig,

    /// Archive adapter settings.
    pub archive: ArchiveConfig,

    /// Archival worker cadence and retry policy.
    pub worker: WorkerConfig,

    /// Controller behavior.
    pub controller: ControllerConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Model name used when a request does not carry one.
    pub default_model: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            default_model: "gemma-3-270m".to_string(),
        }
    }
}

/// Whether a hit refreshes the expiry deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlMode {
    /// Recompute TTL from refreshed metadata on every hit and reset the deadline.
    #[default]
    Sliding,
    /// Keep the deadline chosen at insertion.
    Fixed,
}

/// Inputs to the TTL formula and the tier selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicsConfig {
    /// TTL in seconds for an entry with no history.
    pub base_ttl: u64,

    /// Lower clamp for every computed TTL.
    pub min_ttl: u64,

    /// Upper clamp for every computed TTL.
    pub max_ttl: u64,

    /// Access-count sensitivity.
    pub alpha: f64,

    /// Time-variance penalty weight.
    pub gamma: f64,

    /// Perplexity below which a recent entry is placed hot.
    pub hot_threshold: f64,

    /// Perplexity at or above which an entry is placed in the archive.
    pub archive_threshold: f64,

    /// Time variance at or above which an entry is kept out of the hot tier.
    pub variance_threshold: f64,

    /// Recency window for hot placement, in seconds.
    pub recent_seconds: u64,

    /// Sliding or fixed expiry.
    pub ttl_mode: TtlMode,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            base_ttl: 3600,
            min_ttl: 30,
            max_ttl: 7 * 24 * 3600,
            alpha: 0.25,
            gamma: 0.8,
            hot_threshold: 20.0,
            archive_threshold: 60.0,
            variance_threshold: 0.5,
            recent_seconds: 3600,
            ttl_mode: TtlMode::Sliding,
        }
    }
}

/// Hot and warm tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Maximum number of entries held in the hot tier.
    pub hot_capacity: usize,

    /// How often expired hot and warm entries are swept, in seconds.
    pub hot_sweep_interval_secs: u64,

    /// Directory for the warm tier.
    pub warm_path: PathBuf,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 10_000,
            hot_sweep_interval_secs: 30,
            warm_path: PathBuf::from("/tmp/llm-cache/warm"),
        }
    }
}

/// Archive adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Whether an archive tier is attached at all.
    pub enabled: bool,

    /// Root directory of the local object store.
    pub local_root: PathBuf,

    /// Maximum concurrent adapter calls.
    pub max_concurrency: usize,

    /// Timeout for a single adapter call, in seconds.
    pub op_timeout_secs: u64,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Archive TTL as a multiple of the entry's hot/warm TTL.
    pub retention_multiplier: u64,

    /// Lower bound for archive retention, in seconds.
    pub archive_min_ttl_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_root: PathBuf::from("/tmp/llm-cache/archive"),
            max_concurrency: 4,
            op_timeout_secs: 5,
            zstd_level: 3,
            retention_multiplier: 24,
            archive_min_ttl_secs: 24 * 3600,
        }
    }
}

impl ArchiveConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    /// Archive retention for an entry whose hot/warm TTL is `ttl_seconds`.
    pub fn retention_for(&self, ttl_seconds: u64) -> u64 {
        ttl_seconds
            .saturating_mul(self.retention_multiplier)
            .max(self.archive_min_ttl_secs)
    }
}

/// Archival worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Seconds between scans of the warm tier.
    pub interval_secs: u64,

    /// Entries expiring within this many seconds are archived.
    pub archive_horizon_secs: u64,

    /// Upload attempts before an entry is left in warm.
    pub max_retries: u32,

    /// First retry delay; doubles on each attempt.
    pub backoff_base_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            archive_horizon_secs: 300,
            max_retries: 3,
            backoff_base_ms: 200,
        }
    }
}

impl WorkerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn horizon(&self) -> Duration {
        Duration::from_secs(self.archive_horizon_secs)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Controller behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Log placement decisions without moving entries.
    pub disable_offload: bool,

    /// Ask the archive on a miss in both hot and warm.
    pub deep_miss: bool,

    /// Promote an entry inline when a hit makes it eligible for a hotter tier.
    pub promote_on_hit: bool,

    /// How long a caller waits on another caller's upstream computation.
    pub singleflight_timeout_secs: u64,

    /// Compare-and-set attempts for a hit's metadata update.
    pub max_update_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            disable_offload: false,
            deep_miss: true,
            promote_on_hit: true,
            singleflight_timeout_secs: 30,
            max_update_attempts: 3,
        }
    }
}

impl ControllerConfig {
    pub fn singleflight_timeout(&self) -> Duration {
        Duration::from_secs(self.singleflight_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply `LMCACHE_DISABLE_OFFLOAD` from the environment, if set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(DISABLE_OFFLOAD_ENV) {
            match parse_flag(&raw) {
                Some(disabled) => self.controller.disable_offload = disabled,
                None => tracing::warn!(
                    value = %raw,
                    "Ignoring unrecognized {DISABLE_OFFLOAD_ENV} value"
                ),
            }
        }
    }

    /// Reject threshold bounds the heuristics cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.heuristics;
        if h.min_ttl > h.max_ttl {
            return Err(ConfigError::TtlWindow {
                min: h.min_ttl,
                max: h.max_ttl,
            });
        }
        if h.base_ttl < h.min_ttl || h.base_ttl > h.max_ttl {
            return Err(ConfigError::BaseTtlOutOfWindow {
                base: h.base_ttl,
                min: h.min_ttl,
                max: h.max_ttl,
            });
        }
        for (name, value) in [
            ("alpha", h.alpha),
            ("gamma", h.gamma),
            ("hot_threshold", h.hot_threshold),
            ("archive_threshold", h.archive_threshold),
            ("variance_threshold", h.variance_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidWeight { name, value });
            }
        }
        if h.archive_threshold <= h.hot_threshold {
            return Err(ConfigError::ThresholdOrder {
                hot: h.hot_threshold,
                archive: h.archive_threshold,
            });
        }
        if self.tiers.hot_capacity == 0 {
            return Err(ConfigError::Zero("tiers.hot_capacity"));
        }
        if self.archive.max_concurrency == 0 {
            return Err(ConfigError::Zero("archive.max_concurrency"));
        }
        if self.worker.interval_secs == 0 {
            return Err(ConfigError::Zero("worker.interval_secs"));
        }
        Ok(())
    }
}
