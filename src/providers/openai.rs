use super::error::ProviderError;
use super::streaming::chunk_stream;
use super::{ChatProvider, ChunkStream, ProviderConfig};
use crate::models::openai::{OpenAIRequest, OpenAIResponse};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

/// OpenAI-compatible `/chat/completions` provider
pub struct OpenAIProvider {
    name: String,
    api_key: SecretString,
    base_url: String,
    client: Client,
    timeout: Duration,
    custom_headers: Vec<(String, String)>,
}

impl OpenAIProvider {
    pub fn with_headers(
        name: String,
        api_key: String,
        base_url: String,
        timeout: Duration,
        custom_headers: Vec<(String, String)>,
    ) -> Result<Self, ProviderError> {
        // The total request timeout is applied per call: streaming bodies may
        // legitimately outlive it.
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Config(format!("failed to build HTTP client for '{}': {}", name, e)))?;

        Ok(Self {
            name,
            api_key: SecretString::new(api_key),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout,
            custom_headers,
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let mut headers: Vec<(String, String)> = config.headers.clone().into_iter().collect();
        headers.sort();

        Self::with_headers(
            config.name.clone(),
            config.api_key.clone(),
            config.base_url.clone(),
            Duration::from_secs(config.timeout_secs),
            headers,
        )
    }

    fn request(&self, body: &OpenAIRequest) -> RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);

        let mut req_builder = self.client.post(&url).header("Content-Type", "application/json");

        if !self.api_key.expose_secret().is_empty() {
            req_builder = req_builder.bearer_auth(self.api_key.expose_secret());
        }

        // Add custom headers (for OpenRouter, etc.)
        for (key, value) in &self.custom_headers {
            req_builder = req_builder.header(key, value);
        }

        req_builder.json(body)
    }

    /// Turn a non-2xx response into a typed error
    async fn check_status(&self, response: Response) -> Result<Response, ProviderError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        tracing::debug!(provider = %self.name, status, "Upstream error body: {}", error_text);

        Err(ProviderError::Api {
            status,
            message: error_text,
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    async fn complete(&self, request: &OpenAIRequest) -> Result<OpenAIResponse, ProviderError> {
        let response = self.request(request).timeout(self.timeout).send().await?;
        let response = self.check_status(response).await?;

        let response_text = response.text().await?;
        tracing::trace!(provider = %self.name, "Upstream response body: {}", response_text);

        serde_json::from_str(&response_text).map_err(|e| {
            tracing::error!(provider = %self.name, "Failed to parse upstream response: {}", e);
            ProviderError::Serialization(e)
        })
    }

    async fn complete_stream(&self, request: &OpenAIRequest) -> Result<ChunkStream, ProviderError> {
        let send = self.request(request).header("Accept", "text/event-stream").send();

        // Only waiting for headers is bounded; the body streams as long as it needs
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| ProviderError::Timeout(format!("no response headers from '{}' within {:?}", self.name, self.timeout)))??;
        let response = self.check_status(response).await?;

        Ok(chunk_stream(response.bytes_stream()))
    }
}
