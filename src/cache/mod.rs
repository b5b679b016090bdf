//! Tiered response cache.
//!
//! - [`entry`]: CacheEntry, CacheKey, Tier definitions
//! - [`heuristics`]: TTL and tier placement
//! - [`codec`]: versioned on-disk entry format
//! - [`compressor`]: zstd packing for archive blobs
//! - [`controller`]: tier orchestration, migration and single-flight misses
//! - [`singleflight`]: request coalescing
//! - [`locks`]: per-key read/write locks
//! - [`metrics`]: per-controller Prometheus registry

pub mod codec;
pub mod compressor;
pub mod controller;
pub mod entry;
pub mod heuristics;
pub mod locks;
pub mod metrics;
pub mod singleflight;

pub use controller::{CacheController, SharedController};
pub use entry::{CacheEntry, CacheKey, Tier};
