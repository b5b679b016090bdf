use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{estimate_tokens, Completion, GenerationRequest, Upstream, UpstreamError};

/// Answers every prompt with `LLM response to: <prompt>`.
#[derive(Debug, Default)]
pub struct EchoUpstream {
    latency: Duration,
    calls: AtomicU64,
}

impl EchoUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate model latency.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of generations served.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Upstream for EchoUpstream {
    async fn generate(&self, request: &GenerationRequest) -> Result<Completion, UpstreamError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let text = format!("LLM response to: {}", request.prompt);
        debug!(
            request_id = %request.request_id,
            model = %request.model,
            "Echo upstream generated response"
        );
        Ok(Completion {
            prompt_tokens: estimate_tokens(&request.prompt),
            completion_tokens: estimate_tokens(&text),
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_format() {
        let upstream = EchoUpstream::new();
        let completion = upstream
            .generate(&GenerationRequest {
                request_id: "r1".into(),
                model: "gemma-3-270m".into(),
                prompt: "hello".into(),
                max_tokens: 16,
            })
            .await
            .unwrap();
        assert_eq!(completion.text, "LLM response to: hello");
        assert_eq!(upstream.calls(), 1);
    }
}
