//! llm-cache-tier: tiered cache for language-model responses.
//!
//! Decides for each cached response how long it lives and where it resides:
//!   in-process memory (hot) → local disk (warm) → object store (archive)
//!
//! Exposes the cache over HTTP alongside a completion endpoint that consults
//! it before calling the model.

pub mod cache;
pub mod config;
pub mod server;
pub mod tier;
pub mod upstream;
pub mod worker;
