//! Opinion collaborators used by the CLI.
//!
//! [`ChatCompletionsDispatcher`] posts rendered prompts to an OpenAI-compatible
//! chat-completions endpoint. [`DryRunDispatcher`] answers offline with a
//! deterministic placeholder so the pipeline can be exercised without an API key.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use sitepanel_core::{ChatSettings, DispatchError, DispatchRequest, OpinionDispatcher};

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client implementing [`OpinionDispatcher`].
pub struct ChatCompletionsDispatcher {
    settings: ChatSettings,
    api_key: String,
    http: reqwest::Client,
}

impl ChatCompletionsDispatcher {
    pub fn new(settings: ChatSettings, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sitepanel/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            settings,
            api_key,
            http,
        })
    }

    /// Read the API key from the variable named by `settings.api_key_env`.
    pub fn from_env(settings: ChatSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env)
            .with_context(|| format!("{} is not set", settings.api_key_env))?;
        Self::new(settings, api_key)
    }

    fn request_body(&self, request: &DispatchRequest) -> Value {
        json!({
            "model": self.settings.model,
            "messages": [
                { "role": "system", "content": request.prompt.system_prompt() },
                { "role": "user", "content": request.prompt.user_prompt() },
            ],
            "max_tokens": self.settings.max_tokens,
            "temperature": request.temperature,
        })
    }
}

#[async_trait]
impl OpinionDispatcher for ChatCompletionsDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<String, DispatchError> {
        debug!(role_id = %request.role_id, model = %self.settings.model, "posting chat completion");
        let response = self
            .http
            .post(&self.settings.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| classify_transport(&e, self.settings.request_timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| classify_transport(&e, self.settings.request_timeout_ms))?;
        opinion_from(parsed)
    }
}

fn classify_transport(error: &reqwest::Error, timeout_ms: u64) -> DispatchError {
    if error.is_timeout() {
        DispatchError::Timeout {
            after_ms: timeout_ms,
        }
    } else {
        DispatchError::Transport {
            detail: error.to_string(),
        }
    }
}

/// Rate limits, request timeouts and server errors are transient; any other
/// non-success status is a refusal.
fn classify_status(status: u16, body: &str) -> DispatchError {
    let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    match status {
        408 | 429 | 500..=599 => DispatchError::Transport {
            detail: format!("HTTP {status}: {body}"),
        },
        _ => DispatchError::Refused {
            reason: format!("HTTP {status}: {body}"),
        },
    }
}

fn opinion_from(response: ChatResponse) -> Result<String, DispatchError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| DispatchError::Refused {
            reason: "response has no choices".to_string(),
        })?;
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(DispatchError::Refused {
            reason: "completion stopped by content filter".to_string(),
        });
    }
    match choice.message.content {
        Some(content) if !content.trim().is_empty() => Ok(content),
        _ => Err(DispatchError::Refused {
            reason: "empty completion".to_string(),
        }),
    }
}

/// Offline collaborator: `[dry-run] <role_id> <first 12 hex of sha256(prompt)>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunDispatcher;

#[async_trait]
impl OpinionDispatcher for DryRunDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<String, DispatchError> {
        let digest = hex::encode(Sha256::digest(request.prompt.text().as_bytes()));
        Ok(format!("[dry-run] {} {}", request.role_id, &digest[..12]))
    }
}
