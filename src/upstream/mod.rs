//! Upstream model access.
//!
//! The cache never generates text itself; on a miss it asks an [`Upstream`].
//! - [`echo`]: development stub that answers deterministically

pub mod echo;

use async_trait::async_trait;
use thiserror::Error;

pub use echo::EchoUpstream;

/// Failure reported by the upstream model.
///
/// Cloneable so a single failed computation can be shared with every caller
/// that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("Upstream model unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream rejected request: {0}")]
    Rejected(String),

    #[error("Upstream timed out after {0} ms")]
    Timeout(u64),
}

/// A generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub request_id: String,
    pub model: String,
    pub prompt: String,
    pub max_tokens: usize,
}

/// A finished generation.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Completion, UpstreamError>;
}

/// Stub tokenization: ~1 token per 4 chars.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}
