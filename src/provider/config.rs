//! Provider configuration

use serde::{Deserialize, Serialize};

/// Configuration for an OpenAI-compatible provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Display name for the provider
    pub name: String,
    /// API base URL (e.g., "https://openrouter.ai/api/v1")
    pub base_url: String,
    /// Environment variable name for the API key
    pub api_key_env: String,
    /// Default model to use
    pub default_model: String,
    /// Sent as `HTTP-Referer` (OpenRouter app attribution)
    #[serde(default)]
    pub referer: Option<String>,
    /// Sent as `X-Title` (OpenRouter app attribution)
    #[serde(default)]
    pub title: Option<String>,
}

impl ProviderConfig {
    /// Create an OpenRouter provider config
    pub fn openrouter() -> Self {
        Self {
            name: "OpenRouter".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            default_model: "qwen/qwq-32b".to_string(),
            referer: Some("https://streamlit-app.com".to_string()),
            title: Some("Chat Relay".to_string()),
        }
    }

    /// Create an OpenAI provider config
    pub fn openai() -> Self {
        Self {
            name: "OpenAI".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            default_model: "gpt-4o".to_string(),
            referer: None,
            title: None,
        }
    }

    /// Create a custom provider config (e.g., LM Studio, vLLM)
    pub fn custom(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key_env: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key_env: api_key_env.into(),
            default_model: default_model.into(),
            referer: None,
            title: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Key used for this provider in auth.json
    pub fn auth_key(&self) -> String {
        let lowercase = self.name.to_lowercase();
        match lowercase.as_str() {
            "lm studio" | "lm-studio" => "lm-studio".to_string(),
            _ => lowercase,
        }
    }

    /// Full URL for an endpoint path
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_path() {
        let config = ProviderConfig::openrouter().with_base_url("http://localhost:1234/v1/");
        assert_eq!(
            config.endpoint("chat/completions"),
            "http://localhost:1234/v1/chat/completions"
        );
    }

    #[test]
    fn test_auth_key() {
        assert_eq!(ProviderConfig::openrouter().auth_key(), "openrouter");
        let lm = ProviderConfig::custom("LM Studio", "http://localhost:1234/v1", "LM_KEY", "m");
        assert_eq!(lm.auth_key(), "lm-studio");
    }
}
