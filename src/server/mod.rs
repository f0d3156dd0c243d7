mod tokens;

use crate::cli::AppConfig;
use crate::converter::{self, ConversionError};
use crate::message_tracing::{self, RequestEntry, RequestLog, RequestOutcome};
use crate::models::{CountTokensRequest, CountTokensResponse, MessagesRequest, MessagesResponse};
use crate::providers::ProviderRegistry;
use crate::router::{ProviderRouter, Routed, RouterError, UpstreamReply};
use crate::transcoder::{self, RelayOutcome, StreamTranscoder};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router as AxumRouter,
};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

pub use tokens::estimate_input_tokens;

/// Application state shared across handlers
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub router: Arc<ProviderRouter>,
    pub request_log: Arc<dyn RequestLog>,
}

impl AppState {
    /// Build providers, router and request log from configuration
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let registry = ProviderRegistry::from_configs(&config.providers)
            .map_err(|e| anyhow::anyhow!("Failed to initialize provider registry: {}", e))?;

        info!(
            "📦 Loaded {} providers ({} enabled)",
            registry.entries().len(),
            registry.enabled().count()
        );

        let request_log = message_tracing::from_config(&config.tracing);
        let router = ProviderRouter::new(&config, registry, request_log.clone());

        Ok(Self {
            config: Arc::new(config),
            router: Arc::new(router),
            request_log,
        })
    }
}

/// HTTP routes over shared state
pub fn app(state: Arc<AppState>) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/health", get(health_check))
        .route("/api/providers", get(get_providers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(config: AppConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::from_config(config)?);

    let listener = TcpListener::bind(&addr).await?;
    info!("🚀 Server listening on {}", addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "claude-bridge"
    }))
}

/// Configured providers with circuit state
async fn get_providers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.router.provider_health())
}

fn parse_request(body: &[u8]) -> Result<MessagesRequest, AppError> {
    let request: MessagesRequest = serde_json::from_slice(body).map_err(|e| {
        debug!("Rejected request body: {}", e);
        AppError::Validation(format!("Invalid request format: {}", e))
    })?;

    if request.messages.is_empty() {
        return Err(AppError::Validation("messages: at least one message is required".to_string()));
    }
    if request.max_tokens == 0 {
        return Err(AppError::Validation("max_tokens: must be greater than 0".to_string()));
    }

    Ok(request)
}

fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response, AppError> {
    let request = parse_request(&body)?;
    let started = Instant::now();
    let id = new_message_id();

    debug!(model = %request.model, stream = request.is_streaming(), "📥 Incoming request");

    let routed = match state.router.dispatch(&request).await {
        Ok(routed) => routed,
        Err(e) => {
            let message = e.to_string();
            state.request_log.log_request(&RequestEntry {
                id: &id,
                request: &request,
                provider: None,
                upstream_model: None,
                latency: started.elapsed(),
                outcome: RequestOutcome::Failed(&message),
            });
            return Err(e.into());
        }
    };

    let Routed {
        provider,
        model: upstream_model,
        cached,
        reply,
        ..
    } = routed;

    match reply {
        UpstreamReply::Complete(upstream) => {
            let mut response = converter::to_client(upstream).map_err(|e| {
                error!(provider = %provider, "❌ Could not convert upstream response: {}", e);
                let message = e.to_string();
                state.request_log.log_request(&RequestEntry {
                    id: &id,
                    request: &request,
                    provider: Some(&provider),
                    upstream_model: Some(&upstream_model),
                    latency: started.elapsed(),
                    outcome: RequestOutcome::Failed(&message),
                });
                AppError::Upstream(message)
            })?;
            response.model = request.model.clone();

            info!(
                provider = %provider,
                model = %upstream_model,
                cached,
                latency_ms = started.elapsed().as_millis() as u64,
                "✅ {} → {}",
                request.model,
                upstream_model
            );
            log_completed(&state, &request, &provider, &upstream_model, started, &response);

            Ok(Json(response).into_response())
        }
        UpstreamReply::Stream(chunks) => {
            let (tx, rx) = mpsc::channel(state.config.server.stream_buffer);
            let transcoder = StreamTranscoder::new(id.clone(), request.model.clone());

            let relay_state = state.clone();
            tokio::spawn(async move {
                let outcome = transcoder::relay(chunks, transcoder, tx).await;
                finish_stream(&relay_state, &id, &request, &provider, &upstream_model, started, outcome);
            });

            let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
            Ok((
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                body,
            )
                .into_response())
        }
    }
}

fn log_completed(
    state: &AppState,
    request: &MessagesRequest,
    provider: &str,
    upstream_model: &str,
    started: Instant,
    response: &MessagesResponse,
) {
    state.request_log.log_request(&RequestEntry {
        id: &response.id,
        request,
        provider: Some(provider),
        upstream_model: Some(upstream_model),
        latency: started.elapsed(),
        outcome: RequestOutcome::Completed(response),
    });
}

fn finish_stream(
    state: &AppState,
    id: &str,
    request: &MessagesRequest,
    provider: &str,
    upstream_model: &str,
    started: Instant,
    outcome: RelayOutcome,
) {
    match outcome {
        RelayOutcome::Completed(response) => {
            info!(
                provider,
                model = upstream_model,
                latency_ms = started.elapsed().as_millis() as u64,
                "✅ Stream completed: {} → {}",
                request.model,
                upstream_model
            );
            log_completed(state, request, provider, upstream_model, started, &response);
        }
        RelayOutcome::Failed { message, transport } => {
            if transport {
                state.router.report_stream_failure(provider, &message);
            }
            state.request_log.log_request(&RequestEntry {
                id,
                request,
                provider: Some(provider),
                upstream_model: Some(upstream_model),
                latency: started.elapsed(),
                outcome: RequestOutcome::Failed(&message),
            });
        }
        RelayOutcome::ClientGone => {
            debug!(provider, "Stream abandoned by client");
        }
    }
}

async fn handle_count_tokens(State(_state): State<Arc<AppState>>, body: Bytes) -> Result<Response, AppError> {
    let request: CountTokensRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid count_tokens request format: {}", e)))?;

    let input_tokens = estimate_input_tokens(&request);
    debug!(model = %request.model, input_tokens, "🧮 Counted tokens");

    Ok(Json(CountTokensResponse { input_tokens }).into_response())
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Exhausted(String),
}

impl From<RouterError> for AppError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::Conversion(e) => AppError::Conversion(e),
            e @ RouterError::AllProvidersExhausted { .. } => AppError::Exhausted(e.to_string()),
        }
    }
}

impl AppError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) | AppError::Conversion(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            AppError::Upstream(_) | AppError::Exhausted(_) => (StatusCode::BAD_GATEWAY, "api_error"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();

        let body = Json(serde_json::json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}
