//! Request logging
//!
//! Best-effort, fire-and-forget records of completed requests and of every
//! provider attempt. Logging failures are swallowed; they never reach the
//! client-facing request.

use crate::cli::TracingConfig;
use crate::models::{MessagesRequest, MessagesResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Result of one provider attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Breaker open; no request was sent
    CircuitOpen,
}

/// How a client request ended
#[derive(Debug)]
pub enum RequestOutcome<'a> {
    Completed(&'a MessagesResponse),
    Failed(&'a str),
}

/// One finished client request
#[derive(Debug)]
pub struct RequestEntry<'a> {
    pub id: &'a str,
    pub request: &'a MessagesRequest,
    pub provider: Option<&'a str>,
    pub upstream_model: Option<&'a str>,
    pub latency: Duration,
    pub outcome: RequestOutcome<'a>,
}

/// Persistence collaborator for request and provider-health records
pub trait RequestLog: Send + Sync {
    fn log_request(&self, entry: &RequestEntry<'_>);

    fn log_health_status(&self, provider: &str, status: HealthStatus, latency: Duration, error: Option<&str>);
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NoopRequestLog;

impl RequestLog for NoopRequestLog {
    fn log_request(&self, _entry: &RequestEntry<'_>) {}

    fn log_health_status(&self, _provider: &str, _status: HealthStatus, _latency: Duration, _error: Option<&str>) {}
}

/// Build the configured request log
pub fn from_config(config: &TracingConfig) -> Arc<dyn RequestLog> {
    if !config.enabled {
        return Arc::new(NoopRequestLog);
    }
    match JsonlRequestLog::open(config) {
        Some(log) => Arc::new(log),
        None => Arc::new(NoopRequestLog),
    }
}

#[derive(Serialize)]
struct RequestRecord<'a> {
    ts: DateTime<Utc>,
    kind: &'static str,
    id: &'a str,
    model: &'a str,
    provider: Option<&'a str>,
    upstream_model: Option<&'a str>,
    stream: bool,
    latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct HealthRecord<'a> {
    ts: DateTime<Utc>,
    kind: &'static str,
    provider: &'a str,
    status: HealthStatus,
    latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Request log that appends JSON lines to a file
pub struct JsonlRequestLog {
    omit_system_prompt: bool,
    file: Mutex<File>,
}

impl JsonlRequestLog {
    /// Open (or create) the log file. Returns `None` and logs the reason when
    /// the file cannot be opened.
    pub fn open(config: &TracingConfig) -> Option<Self> {
        // Expand ~ in path
        let path = expand_tilde(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!("Failed to create request log directory: {}", e);
                return None;
            }
        }

        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                tracing::info!("📝 Request logging enabled: {}", path.display());
                Some(Self {
                    omit_system_prompt: config.omit_system_prompt,
                    file: Mutex::new(file),
                })
            }
            Err(e) => {
                tracing::error!("Failed to open request log: {}", e);
                None
            }
        }
    }

    fn write_record<T: Serialize>(&self, record: &T) {
        let Ok(json) = serde_json::to_string(record) else {
            return;
        };

        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = writeln!(file, "{}", json) {
                tracing::debug!("Failed to write request log record: {}", e);
            }
        }
    }
}

impl RequestLog for JsonlRequestLog {
    fn log_request(&self, entry: &RequestEntry<'_>) {
        let request = entry.request;
        let system = if self.omit_system_prompt {
            None
        } else {
            request.system.as_ref().map(|s| s.to_text())
        };

        let (response, error) = match entry.outcome {
            RequestOutcome::Completed(response) => (Some(response), None),
            RequestOutcome::Failed(error) => (None, Some(error)),
        };

        let record = RequestRecord {
            ts: Utc::now(),
            kind: "request",
            id: entry.id,
            model: &request.model,
            provider: entry.provider,
            upstream_model: entry.upstream_model,
            stream: request.is_streaming(),
            latency_ms: entry.latency.as_millis() as u64,
            system,
            messages: serde_json::to_value(&request.messages).unwrap_or_default(),
            input_tokens: response.map(|r| r.usage.input_tokens),
            output_tokens: response.map(|r| r.usage.output_tokens),
            content: response.and_then(|r| serde_json::to_value(&r.content).ok()),
            error,
        };

        self.write_record(&record);
    }

    fn log_health_status(&self, provider: &str, status: HealthStatus, latency: Duration, error: Option<&str>) {
        let record = HealthRecord {
            ts: Utc::now(),
            kind: "health",
            provider,
            status,
            latency_ms: latency.as_millis() as u64,
            error,
        };

        self.write_record(&record);
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
