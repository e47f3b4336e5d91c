//! Configuration loading.
//!
//! A single TOML file plus environment overrides for secrets. Secrets
//! (inference API key, payment keys, identity client secret) are never
//! required in the file; the environment wins when both are set.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the SQLite databases.
    pub workspace_dir: PathBuf,
    pub gateway: GatewayConfig,
    pub inference: InferenceConfig,
    pub identity: IdentityConfig,
    pub stripe: StripeConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL of this deployment, used for checkout redirects.
    pub app_base_url: String,
    /// Sliding-window rate limits, per minute. 0 disables a limit.
    pub summarize_per_minute: u32,
    pub webhook_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub api_url: String,
    pub model: String,
    /// Env override: `GEMINI_API_KEY`.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub token_url: String,
    pub client_id: String,
    /// Env override: `IDENTITY_CLIENT_SECRET`.
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StripeConfig {
    pub api_url: String,
    /// Env override: `STRIPE_SECRET_KEY`.
    pub secret_key: Option<String>,
    /// Env override: `STRIPE_WEBHOOK_SECRET`.
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub session_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from(shellexpand::tilde("~/.policybrief").into_owned()),
            gateway: GatewayConfig::default(),
            inference: InferenceConfig::default(),
            identity: IdentityConfig::default(),
            stripe: StripeConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            app_base_url: "http://127.0.0.1:8080".to_string(),
            summarize_per_minute: 10,
            webhook_per_minute: 120,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_url: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key: None,
            timeout_secs: 60,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            token_url: "https://id.example.com/oauth/token".to_string(),
            client_id: "policybrief".to_string(),
            client_secret: None,
        }
    }
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.stripe.com".to_string(),
            secret_key: None,
            webhook_secret: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            // 30 days
            session_ttl_secs: 30 * 24 * 3600,
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "policybrief")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("policybrief.toml"))
    }

    /// Load configuration: file if present, defaults otherwise, then
    /// environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Pull secrets from the environment, overriding file values.
    fn apply_env_overrides(&mut self) {
        if let Some(key) = non_empty_env("GEMINI_API_KEY") {
            self.inference.api_key = Some(key);
        }
        if let Some(key) = non_empty_env("STRIPE_SECRET_KEY") {
            self.stripe.secret_key = Some(key);
        }
        if let Some(secret) = non_empty_env("STRIPE_WEBHOOK_SECRET") {
            self.stripe.webhook_secret = Some(secret);
        }
        if let Some(secret) = non_empty_env("IDENTITY_CLIENT_SECRET") {
            self.identity.client_secret = Some(secret);
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.inference.model, "gemini-2.5-flash");
        assert_eq!(config.auth.session_ttl_secs, 30 * 24 * 3600);
        assert!(config.stripe.secret_key.is_none());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            port = 9000

            [inference]
            model = "gemini-2.5-pro"
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.inference.model, "gemini-2.5-pro");
        assert_eq!(config.inference.timeout_secs, 60);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/policybrief.toml"))).unwrap();
        assert_eq!(config.gateway.port, 8080);
    }

    #[test]
    fn file_values_survive_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [stripe]
            api_url = "http://127.0.0.1:12111"
            "#,
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.stripe.api_url, "http://127.0.0.1:12111");
    }
}
