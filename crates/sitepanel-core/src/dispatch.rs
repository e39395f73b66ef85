//! The seam to the external opinion collaborator.
//!
//! The core never talks to a language model. It hands a [`DispatchRequest`] to an
//! [`OpinionDispatcher`] and gets back an opinion string or a typed
//! [`DispatchError`]. Retry policy belongs here, in the collaborator layer, via
//! the [`RetryingDispatcher`] decorator.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::render::RenderedPrompt;

/// Failure reported by an opinion collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("refused: {reason}")]
    Refused { reason: String },

    #[error("transport error: {detail}")]
    Transport { detail: String },
}

impl DispatchError {
    /// Timeouts and transport faults may succeed on a later attempt; refusals won't.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Timeout { .. } | DispatchError::Transport { .. }
        )
    }
}

/// One prompt handed to the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub role_id: String,
    pub prompt: RenderedPrompt,
    /// Sampling temperature suggested for this role.
    pub temperature: f32,
}

/// Produces an opinion for a rendered prompt.
///
/// Implement this to plug in a real LLM client or a test stub.
#[async_trait]
pub trait OpinionDispatcher: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<String, DispatchError>;
}

/// Backoff settings for [`RetryingDispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1).
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 20_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed_attempt`-th failure: base, base*2, base*4, ... capped.
    pub fn delay_for_retry(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let backoff_ms = self
            .base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(backoff_ms)
    }

    /// Longest a call can take when every attempt runs to `attempt_timeout`,
    /// backoff delays included.
    pub fn worst_case(&self, attempt_timeout: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let delays: Duration = (1..attempts).map(|n| self.delay_for_retry(n)).sum();
        attempt_timeout.saturating_mul(attempts) + delays
    }
}

/// Retries retryable failures of an inner dispatcher with exponential backoff.
pub struct RetryingDispatcher<D> {
    inner: D,
    policy: RetryPolicy,
}

impl<D: OpinionDispatcher> RetryingDispatcher<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<D: OpinionDispatcher> OpinionDispatcher for RetryingDispatcher<D> {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<String, DispatchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.dispatch(request).await {
                Ok(opinion) => return Ok(opinion),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.delay_for_retry(attempt);
                    warn!(
                        role_id = %request.role_id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "dispatch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
