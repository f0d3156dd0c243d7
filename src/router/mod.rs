//! Provider selection with retry, circuit breaking and fallover
//!
//! A request is converted once, then offered to each enabled provider in
//! ascending priority order. Each attempt is guarded by that provider's
//! breaker and wrapped in the retry policy; the first success wins.

pub mod breaker;
pub mod retry;

use crate::cache::{self, ResponseCache};
use crate::cli::AppConfig;
use crate::converter::{self, ConversionError};
use crate::mapper::{self, ModelCategory};
use crate::message_tracing::{HealthStatus, RequestLog};
use crate::models::openai::OpenAIResponse;
use crate::models::MessagesRequest;
use crate::providers::{ChunkStream, ProviderRegistry};
use breaker::{BreakerSnapshot, CircuitBreakers};
use retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// What to do when the first eligible provider fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    /// Try every provider in priority order
    #[default]
    Priority,
    /// Give up after the first provider attempted
    None,
}

/// Upstream result, complete or streaming
pub enum UpstreamReply {
    Complete(OpenAIResponse),
    Stream(ChunkStream),
}

impl fmt::Debug for UpstreamReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamReply::Complete(response) => f.debug_tuple("Complete").field(response).finish(),
            UpstreamReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A successfully dispatched request
#[derive(Debug)]
pub struct Routed {
    /// Provider that answered
    pub provider: String,
    /// Concrete upstream model
    pub model: String,
    pub category: ModelCategory,
    /// Served from the response cache
    pub cached: bool,
    pub reply: UpstreamReply,
}

/// One provider's reason for not answering
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub error: String,
}

impl fmt::Display for ProviderAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

fn format_attempts(attempts: &[ProviderAttempt]) -> String {
    if attempts.is_empty() {
        return "no enabled providers".to_string();
    }
    attempts.iter().map(|a| a.to_string()).collect::<Vec<_>>().join("; ")
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("all providers failed: {}", format_attempts(.attempts))]
    AllProvidersExhausted { attempts: Vec<ProviderAttempt> },
}

/// Provider listing entry for the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub priority: u32,
    pub enabled: bool,
    pub models: Vec<String>,
    pub circuit: BreakerSnapshot,
}

pub struct ProviderRouter {
    registry: ProviderRegistry,
    breakers: CircuitBreakers,
    retry: RetryPolicy,
    strategy: FallbackStrategy,
    cache: Option<Arc<dyn ResponseCache>>,
    cache_ttl: Duration,
    request_log: Arc<dyn RequestLog>,
}

impl ProviderRouter {
    pub fn new(config: &AppConfig, registry: ProviderRegistry, request_log: Arc<dyn RequestLog>) -> Self {
        Self {
            registry,
            breakers: CircuitBreakers::new(
                config.circuit_breaker.failure_threshold,
                config.circuit_breaker.recovery_timeout(),
            ),
            retry: config.retry.clone(),
            strategy: config.fallback.strategy,
            cache: cache::from_config(&config.cache),
            cache_ttl: config.cache.ttl(),
            request_log,
        }
    }

    /// Route a request to the first provider that answers.
    ///
    /// Streaming requests (`stream: true`) resolve once upstream headers
    /// arrive; non-streaming requests may be answered from the cache.
    pub async fn dispatch(&self, request: &MessagesRequest) -> Result<Routed, RouterError> {
        let category = mapper::resolve(&request.model);
        let stream = request.is_streaming();
        let base = converter::to_upstream(request)?;

        tracing::debug!(model = %request.model, category = %category, stream, "Dispatching request");

        let fingerprint = match &self.cache {
            Some(_) if !stream => cache::fingerprint(&base, &category),
            _ => None,
        };
        if let (Some(cache), Some(fingerprint)) = (&self.cache, &fingerprint) {
            if let Some(hit) = cache.get(fingerprint) {
                tracing::debug!(category = %category, "Cache hit");
                return Ok(Routed {
                    provider: "cache".to_string(),
                    model: hit.model.clone(),
                    category,
                    cached: true,
                    reply: UpstreamReply::Complete(hit),
                });
            }
        }

        let mut attempts = Vec::new();

        for entry in self.registry.enabled() {
            let name = entry.config.name.as_str();

            let Some(model) = entry.config.model_for(&category) else {
                tracing::debug!(provider = name, category = %category, "No model mapping, skipping provider");
                attempts.push(ProviderAttempt {
                    provider: name.to_string(),
                    error: format!("no model mapped for category '{}'", category),
                });
                continue;
            };

            let breaker = self.breakers.get(name);
            let Some(permit) = breaker.try_acquire() else {
                tracing::debug!(provider = name, "Circuit open, skipping provider");
                self.request_log
                    .log_health_status(name, HealthStatus::CircuitOpen, Duration::ZERO, None);
                attempts.push(ProviderAttempt {
                    provider: name.to_string(),
                    error: "circuit open".to_string(),
                });
                continue;
            };
            if permit.is_trial() {
                tracing::info!(provider = name, "Circuit half-open, sending trial request");
            }

            let mut upstream = base.clone();
            upstream.model = model.to_string();
            upstream.max_tokens = upstream.max_tokens.map(|t| entry.config.clamp_max_tokens(t));

            let policy = match entry.config.max_retries {
                Some(max_retries) => self.retry.with_max_retries(max_retries),
                None => self.retry.clone(),
            };
            let started = Instant::now();
            let result = if stream {
                policy
                    .execute(name, || entry.provider.complete_stream(&upstream))
                    .await
                    .map(UpstreamReply::Stream)
            } else {
                policy
                    .execute(name, || entry.provider.complete(&upstream))
                    .await
                    .map(UpstreamReply::Complete)
            };
            let latency = started.elapsed();

            match result {
                Ok(reply) => {
                    permit.success();
                    self.request_log
                        .log_health_status(name, HealthStatus::Healthy, latency, None);
                    tracing::info!(
                        provider = name,
                        model,
                        latency_ms = latency.as_millis() as u64,
                        "✅ Provider answered"
                    );

                    if let (Some(cache), Some(fingerprint), UpstreamReply::Complete(response)) =
                        (&self.cache, &fingerprint, &reply)
                    {
                        cache.put(fingerprint, response, self.cache_ttl);
                    }

                    return Ok(Routed {
                        provider: name.to_string(),
                        model: model.to_string(),
                        category,
                        cached: false,
                        reply,
                    });
                }
                Err(e) => {
                    permit.failure();
                    let message = e.to_string();
                    self.request_log
                        .log_health_status(name, HealthStatus::Unhealthy, latency, Some(&message));
                    tracing::warn!(
                        provider = name,
                        model,
                        error_kind = e.kind(),
                        "⚠️ Provider failed: {}",
                        message
                    );
                    attempts.push(ProviderAttempt {
                        provider: name.to_string(),
                        error: message,
                    });

                    if self.strategy == FallbackStrategy::None {
                        break;
                    }
                }
            }
        }

        tracing::error!(model = %request.model, "❌ {}", format_attempts(&attempts));
        Err(RouterError::AllProvidersExhausted { attempts })
    }

    /// Count a transport failure that happened after a stream was accepted
    pub fn report_stream_failure(&self, provider: &str, error: &str) {
        self.breakers.get(provider).record_failure();
        self.request_log
            .log_health_status(provider, HealthStatus::Unhealthy, Duration::ZERO, Some(error));
    }

    /// Every configured provider with its breaker state, in priority order
    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.registry
            .entries()
            .iter()
            .map(|entry| ProviderHealth {
                name: entry.config.name.clone(),
                priority: entry.config.priority,
                enabled: entry.config.is_enabled(),
                models: entry.config.models.keys().cloned().collect(),
                circuit: self.breakers.snapshot(&entry.config.name),
            })
            .collect()
    }
}
