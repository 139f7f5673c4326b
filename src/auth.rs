//! Authentication configuration loading
//!
//! Resolves the API credential, in priority order, from:
//! - an explicit value (CLI flag / config)
//! - the provider's environment variable (`.env` is loaded first)
//! - $XDG_DATA_HOME/chat-relay/auth.json
//! - ~/.local/share/chat-relay/auth.json

use crate::provider::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// An API key. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// `None` for blank keys
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into().trim().to_string();
        if key.is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Authentication entry for a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthEntry {
    /// Simple API key authentication
    #[serde(rename = "api")]
    Api {
        key: String,
        #[serde(default)]
        base_url: Option<String>,
    },
}

impl AuthEntry {
    /// Get the API key
    pub fn api_key(&self) -> &str {
        match self {
            AuthEntry::Api { key, .. } => key,
        }
    }

    /// Get the base URL if configured
    pub fn base_url(&self) -> Option<&str> {
        match self {
            AuthEntry::Api { base_url, .. } => base_url.as_deref(),
        }
    }
}

/// Authentication configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthConfig {
    pub providers: HashMap<String, AuthEntry>,
}

impl AuthConfig {
    /// Load auth config from the default location
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load auth config from a specific path. A missing file is empty.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: AuthConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Get the default config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            let path = PathBuf::from(xdg_data).join("chat-relay/auth.json");
            if path.exists() {
                return Ok(path);
            }
        }

        if let Some(data_dir) = dirs::data_dir() {
            return Ok(data_dir.join("chat-relay").join("auth.json"));
        }

        Ok(PathBuf::from(".chat-relay/auth.json"))
    }

    /// Get auth entry for a provider
    pub fn get(&self, provider: &str) -> Option<&AuthEntry> {
        self.providers.get(provider)
    }

    /// Get API key for a provider
    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.providers.get(provider).map(|e| e.api_key())
    }
}

/// Resolve the credential for `provider` from the process environment
pub fn resolve_credential(
    explicit: Option<&str>,
    provider: &ProviderConfig,
    auth: &AuthConfig,
) -> Option<Credential> {
    let _ = dotenvy::dotenv();
    resolve_credential_with(explicit, provider, auth, |name| std::env::var(name).ok())
}

/// Same as [`resolve_credential`] with an injectable environment lookup
pub fn resolve_credential_with(
    explicit: Option<&str>,
    provider: &ProviderConfig,
    auth: &AuthConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Option<Credential> {
    if let Some(key) = explicit.and_then(Credential::new) {
        tracing::debug!(provider = %provider.name, "Using explicit API key");
        return Some(key);
    }

    if let Some(key) = env(&provider.api_key_env).and_then(Credential::new) {
        tracing::debug!(provider = %provider.name, env = %provider.api_key_env, "Using API key from environment");
        return Some(key);
    }

    let key = auth.api_key(&provider.auth_key()).and_then(Credential::new);
    if key.is_some() {
        tracing::debug!(provider = %provider.name, "Using API key from auth.json");
    } else {
        tracing::warn!(
            provider = %provider.name,
            env = %provider.api_key_env,
            "No API key found in flags, environment or auth.json"
        );
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_auth() -> AuthConfig {
        let json = r#"{
            "openrouter": {"type": "api", "key": "sk-file"},
            "lm-studio": {"type": "api", "key": "lm-studio", "base_url": "http://localhost:1234/v1"}
        }"#;
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_auth_config() {
        let config = sample_auth();

        assert_eq!(config.api_key("openrouter"), Some("sk-file"));
        assert_eq!(config.get("openrouter").and_then(|e| e.base_url()), None);

        assert_eq!(config.api_key("lm-studio"), Some("lm-studio"));
        assert_eq!(
            config.get("lm-studio").and_then(|e| e.base_url()),
            Some("http://localhost:1234/v1")
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"openai": {{"type": "api", "key": "sk-openai"}}}}"#).unwrap();

        let config = AuthConfig::load_from(file.path()).unwrap();
        assert_eq!(config.api_key("openai"), Some("sk-openai"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig::load_from(&dir.path().join("auth.json")).unwrap();
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_resolution_priority() {
        let provider = ProviderConfig::openrouter();
        let auth = sample_auth();
        let env = |name: &str| (name == "OPENROUTER_API_KEY").then(|| "sk-env".to_string());

        let key = resolve_credential_with(Some("sk-flag"), &provider, &auth, env).unwrap();
        assert_eq!(key.expose(), "sk-flag");

        let key = resolve_credential_with(None, &provider, &auth, env).unwrap();
        assert_eq!(key.expose(), "sk-env");

        let key = resolve_credential_with(None, &provider, &auth, |_| None).unwrap();
        assert_eq!(key.expose(), "sk-file");

        let empty = AuthConfig::default();
        assert!(resolve_credential_with(Some("  "), &provider, &empty, |_| None).is_none());
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let key = Credential::new("sk-secret").unwrap();
        assert_eq!(format!("{:?}", key), "Credential(***)");
    }
}
