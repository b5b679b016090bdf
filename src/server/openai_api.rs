//! OpenAI-style completion endpoint answered through the cache.
//!
//! POST /v1/completions looks the prompt up first; on a miss the upstream
//! model is called once no matter how many identical requests are waiting.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::cache::entry::{unix_millis, CacheKey, Tier};
use crate::cache::heuristics::features_from_map;
use crate::server::error::ApiError;
use crate::server::AppState;
use crate::upstream::{estimate_tokens, GenerationRequest};

/// Completion request (non-chat).
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Heuristic inputs such as `perplexity` and `time_variance`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_max_tokens() -> usize {
    2048
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
    pub cached: bool,
    pub tier: Option<Tier>,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

pub async fn completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let model = req
        .model
        .clone()
        .unwrap_or_else(|| state.config.server.default_model.clone());
    let key = CacheKey::for_request(&model, &req.prompt);

    info!(
        request_id = request_id,
        model = model,
        key = %key,
        "Completion request"
    );

    let generation = GenerationRequest {
        request_id: request_id.clone(),
        model: model.clone(),
        prompt: req.prompt.clone(),
        max_tokens: req.max_tokens,
    };
    let upstream = state.upstream.clone();
    let resolved = state
        .controller
        .get_or_compute(&key, features_from_map(&req.metadata), move || async move {
            upstream
                .generate(&generation)
                .await
                .map(|completion| Bytes::from(completion.text))
        })
        .await?;

    let text = String::from_utf8_lossy(&resolved.payload).into_owned();
    let prompt_tokens = estimate_tokens(&req.prompt);
    let completion_tokens = estimate_tokens(&text);

    Ok(Json(CompletionResponse {
        id: format!("cmpl-{request_id}"),
        object: "text_completion".to_string(),
        created: unix_millis() / 1000,
        model,
        choices: vec![CompletionChoice {
            index: 0,
            text,
            finish_reason: "stop".to_string(),
        }],
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
        cached: resolved.cached,
        tier: resolved.tier,
    }))
}
