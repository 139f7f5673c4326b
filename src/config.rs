//! Configuration for chat-relay

use crate::auth::AuthConfig;
use crate::dispatch::RoutePolicy;
use crate::provider::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Telemetry settings
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider type (openrouter, openai, custom)
    pub provider: LlmProvider,

    /// API key (can also be set via environment variable)
    pub api_key: Option<String>,

    /// Base URL for the API (for custom endpoints like LM Studio)
    pub base_url: Option<String>,

    /// Model name/ID
    pub model: String,

    /// Models tried in order after the primary model fails
    pub fallback_models: Vec<String>,

    /// Model for image generation
    pub image_model: String,

    /// Image models tried after the primary image model fails
    pub image_fallback_models: Vec<String>,

    /// Preferred upstream backend (OpenRouter `route`, e.g. "groq")
    pub route: Option<String>,

    /// Whether the route survives the first failure
    pub route_policy: RoutePolicy,

    /// Stream responses (first attempt only; fallbacks never stream)
    pub stream: bool,

    /// Request-level timeout in seconds
    pub timeout_secs: u64,

    /// Model used by the connection test
    pub probe_model: String,

    /// Optional system message at the start of every transcript
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LlmProvider {
    #[default]
    OpenRouter,
    OpenAI,
    /// Custom OpenAI-compatible endpoint (e.g., LM Studio, vLLM)
    Custom,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenRouter => "openrouter",
            LlmProvider::OpenAI => "openai",
            LlmProvider::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Directory for log files and REPL history
    pub log_dir: PathBuf,

    /// Enable verbose logging
    pub verbose: bool,

    /// OpenTelemetry collector endpoint (e.g., http://localhost:4318)
    pub otel_endpoint: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenRouter,
            api_key: None,
            base_url: None,
            model: "qwen/qwq-32b".to_string(),
            fallback_models: vec![
                "openai/gpt-4o".to_string(),
                "mistralai/mistral-medium".to_string(),
            ],
            image_model: "openai/dall-e-3".to_string(),
            image_fallback_models: vec!["stability/sdxl".to_string()],
            route: None,
            route_policy: RoutePolicy::default(),
            stream: true,
            timeout_secs: 120,
            probe_model: "openai/gpt-3.5-turbo".to_string(),
            system_prompt: None,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(".chat_relay"),
            verbose: false,
            otel_endpoint: None,
        }
    }
}

impl LlmConfig {
    /// Provider settings with the base URL override applied
    pub fn provider_config(&self) -> ProviderConfig {
        let provider = match self.provider {
            LlmProvider::OpenRouter => ProviderConfig::openrouter(),
            LlmProvider::OpenAI => ProviderConfig::openai(),
            LlmProvider::Custom => ProviderConfig::custom(
                "custom",
                self.base_url.clone().unwrap_or_default(),
                "CHAT_RELAY_API_KEY",
                self.model.clone(),
            ),
        };
        match &self.base_url {
            Some(base_url) => provider.with_base_url(base_url.clone()),
            None => provider,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Config {
    /// Create config for a custom OpenAI-compatible endpoint
    pub fn custom(base_url: &str, model: &str) -> Self {
        Self {
            llm: LlmConfig {
                provider: LlmProvider::Custom,
                base_url: Some(base_url.to_string()),
                model: model.to_string(),
                fallback_models: Vec::new(),
                ..LlmConfig::default()
            },
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Create config for OpenRouter
    pub fn openrouter(model: &str) -> Self {
        Self {
            llm: LlmConfig {
                provider: LlmProvider::OpenRouter,
                model: model.to_string(),
                ..LlmConfig::default()
            },
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Set verbose logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.telemetry.verbose = verbose;
        self
    }

    /// Set log directory
    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.telemetry.log_dir = log_dir;
        self
    }

    pub fn with_otel_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.telemetry.otel_endpoint = endpoint;
        self
    }

    /// Set API key
    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.llm.api_key = Some(api_key);
        self
    }

    /// Replace the fallback model list
    pub fn with_fallback_models(mut self, models: Vec<String>) -> Self {
        self.llm.fallback_models = models;
        self
    }

    pub fn with_image_model(mut self, model: String) -> Self {
        self.llm.image_model = model;
        self
    }

    pub fn with_route(mut self, route: Option<String>) -> Self {
        self.llm.route = route;
        self
    }

    pub fn with_route_policy(mut self, policy: RoutePolicy) -> Self {
        self.llm.route_policy = policy;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.llm.stream = stream;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.llm.timeout_secs = secs;
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.llm.system_prompt = prompt;
        self
    }

    /// Replace the model with the provider's default
    pub fn with_default_model(mut self) -> Self {
        self.llm.model = self.llm.provider_config().default_model;
        self
    }

    /// Create config from a provider entry in auth.json
    ///
    /// Uses the entry's API key and base_url. The model is given separately.
    pub fn from_auth(auth: &AuthConfig, provider: &str, model: &str) -> anyhow::Result<Self> {
        let entry = auth
            .get(provider)
            .ok_or_else(|| anyhow::anyhow!("Provider '{}' not found in auth.json", provider))?;

        let mut config = match entry.base_url() {
            Some(base_url) => Self::custom(base_url, model),
            None => {
                let mut config = Self::openrouter(model);
                if provider.eq_ignore_ascii_case("openai") {
                    config.llm.provider = LlmProvider::OpenAI;
                }
                config
            }
        };
        config.llm.api_key = Some(entry.api_key().to_string());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> AuthConfig {
        serde_json::from_str(
            r#"{
                "openrouter": {"type": "api", "key": "sk-or"},
                "openai": {"type": "api", "key": "sk-oa"},
                "lm-studio": {"type": "api", "key": "lm", "base_url": "http://localhost:1234/v1"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.llm.provider, LlmProvider::OpenRouter);
        assert_eq!(config.llm.model, "qwen/qwq-32b");
        assert!(config.llm.stream);
        assert_eq!(config.llm.route_policy, RoutePolicy::DropAfterFirstFailure);
        assert_eq!(config.llm.timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_from_auth() {
        let config = Config::from_auth(&auth(), "lm-studio", "local-model").unwrap();
        assert_eq!(config.llm.provider, LlmProvider::Custom);
        assert_eq!(config.llm.api_key.as_deref(), Some("lm"));
        assert_eq!(
            config.llm.provider_config().endpoint("chat/completions"),
            "http://localhost:1234/v1/chat/completions"
        );

        let config = Config::from_auth(&auth(), "openai", "gpt-4o").unwrap();
        assert_eq!(config.llm.provider, LlmProvider::OpenAI);
        assert_eq!(config.llm.provider_config().api_key_env, "OPENAI_API_KEY");

        assert!(Config::from_auth(&auth(), "missing", "m").is_err());
    }

    #[test]
    fn test_default_model_follows_provider() {
        let config = Config::from_auth(&auth(), "openai", "").unwrap().with_default_model();
        assert_eq!(config.llm.model, "gpt-4o");

        let config = Config::openrouter("").with_default_model();
        assert_eq!(config.llm.model, "qwen/qwq-32b");
    }

    #[test]
    fn test_builders() {
        let config = Config::openrouter("m1")
            .with_fallback_models(vec!["m2".into()])
            .with_route(Some("groq".into()))
            .with_stream(false)
            .with_timeout_secs(0);
        assert_eq!(config.llm.fallback_models, vec!["m2".to_string()]);
        assert_eq!(config.llm.route.as_deref(), Some("groq"));
        assert!(!config.llm.stream);
        // Never zero
        assert_eq!(config.llm.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json_config() {
        let config: LlmConfig =
            serde_json::from_str(r#"{"model": "m1", "route_policy": "persist"}"#).unwrap();
        assert_eq!(config.model, "m1");
        assert_eq!(config.route_policy, RoutePolicy::Persist);
        assert_eq!(config.image_model, "openai/dall-e-3");
    }
}
