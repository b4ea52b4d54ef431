//! LLM client primitive with jittered retry.
//!
//! [`ChatProvider`] is the seam to the outside world: one blocking-free
//! chat completion per call. [`LLMClient`] wraps a provider with the
//! resolved per-persona settings, the shared concurrency controller, and
//! the retry policy. Vendor protocol work stays behind the trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::concurrency::ConcurrencyController;
use crate::config::ResolvedLlm;
use crate::error::{MagiError, MagiResult};

/// Retry backoff base.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Backoff cap and attempt ceiling for provider rate limiting.
const RATE_LIMIT_CAP: Duration = Duration::from_secs(60);
const RATE_LIMIT_MAX_RETRIES: u32 = 6;
/// Backoff cap for other transient errors.
const TRANSIENT_CAP: Duration = Duration::from_secs(10);

/// One chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    pub usage: ChatUsage,
    pub model: String,
}

/// The provider seam: one completion per call, classified errors.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stable provider name for logs.
    fn name(&self) -> &str;

    /// Run one chat completion.
    async fn complete(&self, request: &ChatRequest) -> MagiResult<LLMResponse>;
}

/// Per-persona chat client: provider + resolved settings + retry policy.
#[derive(Clone)]
pub struct LLMClient {
    provider: Arc<dyn ChatProvider>,
    resolved: ResolvedLlm,
    controller: Arc<ConcurrencyController>,
}

impl std::fmt::Debug for LLMClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LLMClient")
            .field("provider", &self.provider.name())
            .field("model", &self.resolved.model)
            .finish()
    }
}

impl LLMClient {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        resolved: ResolvedLlm,
        controller: Arc<ConcurrencyController>,
    ) -> Self {
        Self {
            provider,
            resolved,
            controller,
        }
    }

    pub fn resolved(&self) -> &ResolvedLlm {
        &self.resolved
    }

    /// Send a request, retrying transient failures with full-jitter
    /// exponential backoff. Each attempt holds a concurrency permit only
    /// for the call itself, never across backoff sleeps.
    pub async fn send(&self, request: &ChatRequest) -> MagiResult<LLMResponse> {
        let mut transient_attempts = 0u32;
        let mut rate_limit_attempts = 0u32;

        loop {
            let attempt_result = {
                let _permit = self.controller.acquire(None).await?;
                tokio::time::timeout(self.resolved.timeout, self.provider.complete(request)).await
            };

            let error = match attempt_result {
                Ok(Ok(response)) => {
                    tracing::debug!(
                        provider = self.provider.name(),
                        model = response.model,
                        tokens = response.usage.total_tokens,
                        "chat completion succeeded"
                    );
                    return Ok(response);
                }
                Ok(Err(err)) => err,
                Err(_elapsed) => MagiError::LlmTimeout {
                    seconds: self.resolved.timeout.as_secs(),
                },
            };

            let (attempts, max_retries, cap) = match &error {
                MagiError::RateLimited(_) => {
                    self.controller.note_rate_limit();
                    rate_limit_attempts += 1;
                    (rate_limit_attempts, RATE_LIMIT_MAX_RETRIES, RATE_LIMIT_CAP)
                }
                err if err.is_retryable() => {
                    transient_attempts += 1;
                    (transient_attempts, self.resolved.retry_count, TRANSIENT_CAP)
                }
                _ => {
                    tracing::warn!(
                        provider = self.provider.name(),
                        error = %error,
                        "chat completion failed, not retryable"
                    );
                    return Err(error);
                }
            };

            if attempts > max_retries {
                tracing::warn!(
                    provider = self.provider.name(),
                    attempts,
                    error = %error,
                    "chat completion retries exhausted"
                );
                return Err(error);
            }

            let wait = full_jitter(attempts - 1, cap);
            tracing::debug!(
                provider = self.provider.name(),
                attempt = attempts,
                wait_ms = wait.as_millis() as u64,
                error = %error,
                "retrying chat completion"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

/// `wait = random(0, min(cap, base * 2^attempt))`.
fn full_jitter(attempt: u32, cap: Duration) -> Duration {
    let exp = BACKOFF_BASE
        .as_millis()
        .saturating_mul(1u128 << attempt.min(20));
    let ceiling = exp.min(cap.as_millis()).max(1) as u64;
    Duration::from_millis(rand::rng().random_range(0..=ceiling))
}
