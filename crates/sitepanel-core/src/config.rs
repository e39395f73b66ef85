//! Panel configuration: TOML file plus `SITEPANEL_*` environment overrides.
//!
//! ```toml
//! roles_path = "configs/roles.json"
//!
//! [orchestrator]
//! max_concurrent = 5
//! persona_timeout_ms = 360000
//! render_policy = "strict"
//!
//! [chat]
//! model = "gpt-4o-mini"
//! max_tokens = 512
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dispatch::RetryPolicy;
use crate::error::{PanelError, PanelResult};
use crate::orchestrator::OrchestratorConfig;
use crate::registry::RoleRegistry;
use crate::render::RenderPolicy;

/// Settings for the chat-completions collaborator used by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub request_timeout_ms: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 512,
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_ms: 60_000,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Role registry JSON; the bundled panel is used when unset.
    pub roles_path: Option<PathBuf>,
    pub orchestrator: OrchestratorConfig,
    pub chat: ChatSettings,
    pub retry: RetryPolicy,
}

impl PanelConfig {
    /// Parse TOML configuration text.
    pub fn from_toml_str(source: &str) -> PanelResult<Self> {
        toml::from_str(source).map_err(|e| PanelError::Config(e.to_string()))
    }

    /// Read configuration from `path`, which must exist.
    pub fn load(path: &Path) -> PanelResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Read `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> PanelResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Apply `SITEPANEL_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> PanelResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`:
    ///
    /// - `SITEPANEL_MAX_CONCURRENCY` — persona dispatch limit
    /// - `SITEPANEL_PERSONA_TIMEOUT_MS` — barrier deadline, `0` disables it
    /// - `SITEPANEL_STRICT_FIELDS` — `true`/`1` rejects unused render fields
    /// - `SITEPANEL_MODEL` — chat model name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> PanelResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("SITEPANEL_MAX_CONCURRENCY") {
            self.orchestrator.max_concurrent = parse_env("SITEPANEL_MAX_CONCURRENCY", &raw)?;
        }
        if let Some(raw) = lookup("SITEPANEL_PERSONA_TIMEOUT_MS") {
            let ms: u64 = parse_env("SITEPANEL_PERSONA_TIMEOUT_MS", &raw)?;
            self.orchestrator.persona_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(raw) = lookup("SITEPANEL_STRICT_FIELDS") {
            let strict = matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
            self.orchestrator.render_policy = if strict {
                RenderPolicy::Strict
            } else {
                RenderPolicy::Lenient
            };
        }
        if let Some(model) = lookup("SITEPANEL_MODEL") {
            self.chat.model = model;
        }
        if !self.barrier_covers_retries() {
            warn!(
                persona_timeout_ms = ?self.orchestrator.persona_timeout_ms,
                retry_budget_ms = self.retry_budget().as_millis() as u64,
                "persona deadline is shorter than the retry budget; late retries will be cut off"
            );
        }
        Ok(())
    }

    /// Worst-case time for one chat call including all retries.
    pub fn retry_budget(&self) -> Duration {
        self.retry
            .worst_case(Duration::from_millis(self.chat.request_timeout_ms))
    }

    /// Whether the persona deadline leaves room for every retry attempt.
    pub fn barrier_covers_retries(&self) -> bool {
        match self.orchestrator.persona_timeout_ms {
            Some(ms) => Duration::from_millis(ms) >= self.retry_budget(),
            None => true,
        }
    }

    /// Load the role registry this configuration points at.
    pub fn load_registry(&self) -> PanelResult<RoleRegistry> {
        match &self.roles_path {
            Some(path) => RoleRegistry::from_path(path),
            None => RoleRegistry::builtin(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> PanelResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| PanelError::Config(format!("{key} has an invalid value: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(PanelConfig::from_toml_str("").unwrap(), PanelConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = PanelConfig::from_toml_str(
            r#"
            [orchestrator]
            max_concurrent = 2
            render_policy = "strict"

            [chat]
            model = "local-llm"
            "#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.max_concurrent, 2);
        assert_eq!(config.orchestrator.render_policy, RenderPolicy::Strict);
        assert_eq!(config.orchestrator.persona_timeout_ms, Some(360_000));
        assert_eq!(config.chat.model, "local-llm");
        assert_eq!(config.chat.max_tokens, 512);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = PanelConfig::from_toml_str("orchestrator = 3").unwrap_err();
        assert!(matches!(err, PanelError::Config(_)));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("SITEPANEL_MAX_CONCURRENCY", "3"),
            ("SITEPANEL_PERSONA_TIMEOUT_MS", "0"),
            ("SITEPANEL_STRICT_FIELDS", "true"),
            ("SITEPANEL_MODEL", "gpt-4o"),
        ]
        .into_iter()
        .collect();
        let mut config = PanelConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.orchestrator.max_concurrent, 3);
        assert_eq!(config.orchestrator.persona_timeout_ms, None);
        assert_eq!(config.orchestrator.render_policy, RenderPolicy::Strict);
        assert_eq!(config.chat.model, "gpt-4o");
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut config = PanelConfig::default();
        let err = config
            .apply_overrides(|key| (key == "SITEPANEL_MAX_CONCURRENCY").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SITEPANEL_MAX_CONCURRENCY"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PanelConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, PanelConfig::default());
        assert!(PanelConfig::load(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_load_registry_defaults_to_builtin() {
        let registry = PanelConfig::default().load_registry().unwrap();
        assert!(registry.get("summary").is_ok());
    }

    #[test]
    fn test_default_deadline_leaves_room_for_retries() {
        let config = PanelConfig::default();
        assert!(config.barrier_covers_retries());
        assert_eq!(config.retry_budget(), Duration::from_millis(315_000));

        let mut tight = PanelConfig::default();
        tight.orchestrator.persona_timeout_ms = Some(120_000);
        assert!(!tight.barrier_covers_retries());

        tight.orchestrator.persona_timeout_ms = None;
        assert!(tight.barrier_covers_retries());
    }
}
