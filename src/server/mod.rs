//! HTTP server.
//!
//! - [`cache_api`]: direct cache operations (lookup, put, migrate, delete)
//! - [`openai_api`]: OpenAI-style completions answered through the cache
//! - [`error`]: error-to-response mapping

pub mod cache_api;
pub mod error;
pub mod openai_api;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cache::controller::{ControllerStats, SharedController};
use crate::config::Config;
use crate::upstream::Upstream;

/// Application state shared across handlers.
pub struct AppState {
    pub controller: SharedController,
    pub upstream: Arc<dyn Upstream>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/completions", post(openai_api::completions))
        .route("/v1/cache/lookup", post(cache_api::lookup))
        .route("/v1/cache/put", post(cache_api::put))
        .route("/v1/cache/migrate", post(cache_api::migrate))
        .route("/v1/cache/offload", post(cache_api::set_offload))
        .route("/v1/cache/stats", get(cache_api::stats))
        .route("/v1/cache/{key}", delete(cache_api::delete_key))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub cache: ControllerStats,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache: state.controller.stats(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.controller.metrics().encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                String::new(),
            )
        }
    }
}
