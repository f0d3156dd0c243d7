use thiserror::Error;

/// Provider-specific errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Provider API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed stream: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_connect() {
            ProviderError::Connection(e.to_string())
        } else {
            ProviderError::Http(e.to_string())
        }
    }
}

impl ProviderError {
    /// Transient failures worth retrying on the same provider:
    /// timeouts, connection failures and upstream 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::Connection(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Credential or quota rejections (401/402/403/429); never retried.
    pub fn is_auth_or_quota(&self) -> bool {
        match self {
            ProviderError::Api { status, .. } => matches!(status, 401 | 402 | 403 | 429),
            _ => false,
        }
    }

    /// Short label for logs and health records
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Connection(_) => "connection",
            ProviderError::Http(_) => "http",
            ProviderError::Serialization(_) => "serialization",
            ProviderError::Api { .. } if self.is_auth_or_quota() => "auth_or_quota",
            ProviderError::Api { .. } => "api",
            ProviderError::Config(_) => "config",
            ProviderError::Stream(_) => "stream",
        }
    }
}
