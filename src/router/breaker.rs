//! Per-provider circuit breaker
//!
//! Stops sending requests to a provider that keeps failing, and lets a single
//! trial request through once the recovery timeout has elapsed. Transitions are
//! evaluated synchronously on every call; there is no background timer.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state for a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests flow through
    Closed,
    /// Provider is failing, requests are blocked
    Open,
    /// Probing, exactly one request tests recovery
    HalfOpen,
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Health state machine for one provider
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // State stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn recovered(&self, inner: &BreakerInner) -> bool {
        inner
            .last_failure
            .map(|at| at.elapsed() >= self.recovery_timeout)
            .unwrap_or(true)
    }

    /// Ask to send a request. `None` means short-circuit this provider.
    ///
    /// The permit must be resolved with [`BreakerPermit::success`] or
    /// [`BreakerPermit::failure`]. A half-open trial permit dropped unresolved
    /// (the request was cancelled) reopens the breaker and restarts its timer,
    /// so the next trial is admitted after another recovery timeout.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BreakerPermit> {
        let mut inner = self.lock();

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if !self.recovered(&inner) {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Some(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            resolved: false,
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
            }
            CircuitState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    error_count = inner.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.state = CircuitState::Open;
            inner.trial_in_flight = false;
            inner.last_failure = Some(Instant::now());
            tracing::debug!("half-open trial abandoned, circuit reopened");
        }
    }

    /// Effective state: an open breaker past its recovery timeout reports `half_open`
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let state = match inner.state {
            CircuitState::Open if self.recovered(&inner) => CircuitState::HalfOpen,
            state => state,
        };
        BreakerSnapshot {
            state,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

/// Admission to send one request through a breaker
#[must_use = "an unresolved trial permit reopens the breaker when dropped"]
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    /// Whether this request is the half-open recovery trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.abandon_trial();
        }
    }
}

/// All breakers, one per provider name, created lazily
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreakers {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold,
            recovery_timeout,
        }
    }

    pub fn get(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(provider) {
            return breaker.clone();
        }
        self.breakers
            .entry(provider.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.failure_threshold, self.recovery_timeout)))
            .clone()
    }

    /// Snapshot without creating a breaker for unknown providers
    pub fn snapshot(&self, provider: &str) -> BreakerSnapshot {
        self.breakers
            .get(provider)
            .map(|b| b.snapshot())
            .unwrap_or(BreakerSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
            })
    }
}
