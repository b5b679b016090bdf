//! Direct cache operations.
//!
//! - POST /v1/cache/lookup
//! - POST /v1/cache/put
//! - POST /v1/cache/migrate
//! - POST /v1/cache/offload
//! - GET /v1/cache/stats
//! - DELETE /v1/cache/{key}
//!
//! Requests name an entry either by `prompt` (plus optional `model`) or by an
//! already-normalized `key`.
//!
//! Payloads are opaque bytes. UTF-8 payloads travel as the `payload` string;
//! anything else travels as `payload_bytes`, a JSON array of byte values.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::cache::controller::{ControllerStats, MigrationStatus};
use crate::cache::entry::{CacheKey, Tier};
use crate::cache::heuristics::features_from_map;
use crate::server::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct LookupRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LookupResponse {
    pub key: String,
    pub found: bool,
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_bytes: Option<Vec<u8>>,
    pub tier: Option<Tier>,
    pub access_count: Option<u64>,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PutRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub payload_bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PutRequest {
    fn take_payload(&mut self) -> Result<Bytes, ApiError> {
        match (self.payload.take(), self.payload_bytes.take()) {
            (Some(text), None) => Ok(Bytes::from(text)),
            (None, Some(raw)) => Ok(Bytes::from(raw)),
            _ => Err(ApiError::BadRequest(
                "exactly one of `payload` or `payload_bytes` is required".to_string(),
            )),
        }
    }
}

/// Split a payload into its text form, or its raw bytes when not UTF-8.
fn encode_payload(payload: Bytes) -> (Option<String>, Option<Vec<u8>>) {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => (Some(text), None),
        Err(e) => (None, Some(e.into_bytes())),
    }
}

#[derive(Debug, Serialize)]
pub struct PutResponse {
    pub key: String,
    pub tier: Tier,
    pub ttl_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub key: String,
    pub to_tier: String,
}

#[derive(Debug, Serialize)]
pub struct MigrateResponse {
    pub status: &'static str,
    pub from: Option<Tier>,
    pub to: Option<Tier>,
}

#[derive(Debug, Deserialize)]
pub struct OffloadRequest {
    pub disabled: bool,
}

#[derive(Debug, Serialize)]
pub struct OffloadResponse {
    pub offload_disabled: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub key: String,
    pub deleted: bool,
}

fn resolve_key(
    state: &AppState,
    key: Option<&str>,
    prompt: Option<&str>,
    model: Option<&str>,
) -> Result<CacheKey, ApiError> {
    match (key, prompt) {
        (Some(key), _) => Ok(CacheKey::from_raw(key)),
        (None, Some(prompt)) => Ok(CacheKey::for_request(
            model.unwrap_or(&state.config.server.default_model),
            prompt,
        )),
        (None, None) => Err(ApiError::BadRequest(
            "either `key` or `prompt` is required".to_string(),
        )),
    }
}

pub async fn lookup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LookupRequest>,
) -> Result<Json<LookupResponse>, ApiError> {
    let key = resolve_key(
        &state,
        req.key.as_deref(),
        req.prompt.as_deref(),
        req.model.as_deref(),
    )?;
    let result = state.controller.lookup(&key).await;
    let (payload, payload_bytes) = match result.payload {
        Some(p) => encode_payload(p),
        None => (None, None),
    };

    Ok(Json(LookupResponse {
        key: key.to_string(),
        found: result.found,
        payload,
        payload_bytes,
        tier: result.tier,
        access_count: result.metadata.as_ref().map(|m| m.access_count),
        ttl_seconds: result.metadata.as_ref().map(|m| m.ttl_seconds),
    }))
}

pub async fn put(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<PutRequest>,
) -> Result<Json<PutResponse>, ApiError> {
    let key = resolve_key(
        &state,
        req.key.as_deref(),
        req.prompt.as_deref(),
        req.model.as_deref(),
    )?;
    let payload = req.take_payload()?;
    let features = features_from_map(&req.metadata);
    let result = state.controller.put(&key, payload, features).await;

    Ok(Json(PutResponse {
        key: key.to_string(),
        tier: result.tier,
        ttl_seconds: result.ttl_seconds,
    }))
}

pub async fn migrate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MigrateRequest>,
) -> Result<Json<MigrateResponse>, ApiError> {
    let to: Tier = req.to_tier.parse().map_err(ApiError::BadRequest)?;
    let key = CacheKey::from_raw(&req.key);
    let status = state.controller.migrate(&key, to).await?;

    let (from, to) = match status {
        MigrationStatus::Migrated { from, to } => (Some(from), Some(to)),
        _ => (None, Some(to)),
    };
    Ok(Json(MigrateResponse {
        status: status.as_str(),
        from,
        to,
    }))
}

pub async fn set_offload(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OffloadRequest>,
) -> Json<OffloadResponse> {
    state.controller.set_offload_disabled(req.disabled);
    info!(disabled = req.disabled, "Offload toggled over HTTP");
    Json(OffloadResponse {
        offload_disabled: state.controller.offload_disabled(),
    })
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<ControllerStats> {
    Json(state.controller.stats())
}

pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let key = CacheKey::from_raw(&key);
    let deleted = state.controller.delete(&key).await?;
    Ok(Json(DeleteResponse {
        key: key.to_string(),
        deleted,
    }))
}
