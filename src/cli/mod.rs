//! Configuration loading
//!
//! Precedence: TOML file, then `CLAUDE_BRIDGE__SECTION__KEY` environment
//! variables, then command-line flags (applied by `main`). `${VAR}` references
//! in provider credentials, URLs and header values are expanded after loading.

use crate::providers::ProviderConfig;
use crate::router::retry::RetryPolicy;
use crate::router::FallbackStrategy;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment overrides, e.g. `CLAUDE_BRIDGE__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "CLAUDE_BRIDGE";

static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex"));

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable '{var}' referenced by {field} is not set")]
    MissingEnvVar { var: String, field: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("could not determine home directory")]
    NoHomeDir,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of the per-request SSE channel
    pub stream_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8082,
            stream_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub strategy: FallbackStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before admitting a trial request
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Request log (JSONL) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub enabled: bool,
    pub path: String,
    /// Leave system prompts out of logged requests
    pub omit_system_prompt: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "~/.claude-bridge/requests.jsonl".to_string(),
            omit_system_prompt: true,
        }
    }
}

/// Response cache settings (non-streaming requests only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 300,
            max_entries: 1000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl AppConfig {
    /// Default config location: `~/.claude-bridge/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".claude-bridge").join("config.toml"))
    }

    /// Load from a TOML file with environment overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        config.finalize()
    }

    /// Parse an in-memory TOML document (no environment layer)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.finalize()
    }

    fn finalize(mut self) -> Result<Self, ConfigError> {
        self.expand_env()?;
        self.validate()?;
        Ok(self)
    }

    /// Substitute `${VAR}` in provider api keys, base URLs and header values.
    ///
    /// A missing variable is an error for enabled providers; disabled
    /// providers keep the unexpanded text.
    fn expand_env(&mut self) -> Result<(), ConfigError> {
        for provider in &mut self.providers {
            match expand_provider_env(provider) {
                Err(e) if !provider.is_enabled() => {
                    tracing::debug!("Skipping env expansion for disabled provider '{}': {}", provider.name, e);
                }
                other => other?,
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.server.stream_buffer == 0 {
            return Err(ConfigError::Invalid("server.stream_buffer must be at least 1".to_string()));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::Invalid("provider name must not be empty".to_string()));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate provider name '{}'", provider.name)));
            }
            if provider.timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}': timeout_secs must be at least 1",
                    provider.name
                )));
            }

            if !provider.is_enabled() {
                continue;
            }

            let url = url::Url::parse(&provider.base_url).map_err(|e| {
                ConfigError::Invalid(format!("provider '{}': invalid base_url '{}': {}", provider.name, provider.base_url, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}': base_url must be http or https",
                    provider.name
                )));
            }

            if provider.models.is_empty() {
                tracing::warn!("Provider '{}' has no model mappings and will never be selected", provider.name);
            }
        }

        if !self.providers.iter().any(|p| p.is_enabled()) {
            tracing::warn!("No enabled providers configured");
        }

        Ok(())
    }
}

fn expand_provider_env(provider: &mut ProviderConfig) -> Result<(), ConfigError> {
    let name = provider.name.clone();
    let api_key = expand_env_vars(&provider.api_key, &format!("providers.{}.api_key", name))?;
    let base_url = expand_env_vars(&provider.base_url, &format!("providers.{}.base_url", name))?;
    for (header, value) in provider.headers.iter_mut() {
        *value = expand_env_vars(value, &format!("providers.{}.headers.{}", name, header))?;
    }
    provider.api_key = api_key;
    provider.base_url = base_url;
    Ok(())
}

/// Expand `${VAR}` references in one value
pub fn expand_env_vars(input: &str, field: &str) -> Result<String, ConfigError> {
    let mut missing = None;

    let expanded = ENV_VAR_PATTERN.replace_all(input, |caps: &regex::Captures| {
        let var = &caps[1];
        std::env::var(var).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var.to_string());
            String::new()
        })
    });

    match missing {
        Some(var) => Err(ConfigError::MissingEnvVar {
            var,
            field: field.to_string(),
        }),
        None => Ok(expanded.into_owned()),
    }
}
