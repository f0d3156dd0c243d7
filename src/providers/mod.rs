pub mod error;
pub mod openai;
pub mod registry;
pub mod streaming;

use crate::mapper::ModelCategory;
use crate::models::openai::{OpenAIRequest, OpenAIResponse, OpenAIStreamChunk};
use async_trait::async_trait;
use error::ProviderError;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;

/// Typed upstream chunk stream, ending at `[DONE]` or EOF
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<OpenAIStreamChunk, ProviderError>> + Send>>;

/// An OpenAI-compatible chat completions backend
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send a non-streaming chat completion request
    async fn complete(&self, request: &OpenAIRequest) -> Result<OpenAIResponse, ProviderError>;

    /// Send a streaming chat completion request.
    /// Resolves once response headers arrive; chunks follow on the stream.
    async fn complete_stream(&self, request: &OpenAIRequest) -> Result<ChunkStream, ProviderError>;
}

fn default_priority() -> u32 {
    100
}

fn default_timeout_secs() -> u64 {
    60
}

/// Provider configuration from TOML
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    /// Lower values are tried first
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub enabled: Option<bool>,
    pub base_url: String,
    /// May reference the environment as `${VAR}`
    #[serde(default)]
    pub api_key: String,
    /// Category (`small`/`middle`/`big`) or exact client model name → upstream model
    #[serde(default)]
    pub models: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first attempt, transient errors only.
    /// Falls back to `[retry].max_retries`.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Ceiling applied to the client's `max_tokens`
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Extra request headers (e.g. OpenRouter's `HTTP-Referer`)
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: default_priority(),
            enabled: None,
            base_url: base_url.into(),
            api_key: String::new(),
            models: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
            max_retries: None,
            max_tokens: None,
            headers: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Concrete upstream model for a category, if this provider maps it
    pub fn model_for(&self, category: &ModelCategory) -> Option<&str> {
        self.models
            .get(category.as_str())
            .map(String::as_str)
            .filter(|m| !m.is_empty())
    }

    /// Clamp the requested `max_tokens` to this provider's ceiling
    pub fn clamp_max_tokens(&self, requested: u32) -> u32 {
        match self.max_tokens {
            Some(ceiling) if requested > ceiling => ceiling,
            _ => requested,
        }
    }
}

// Re-export provider implementations
pub use openai::OpenAIProvider;
pub use registry::ProviderRegistry;
