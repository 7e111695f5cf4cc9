//! Circuit breaker protecting the cache backend
//!
//! Every backend call from the caching core runs through [`CircuitBreaker::execute`].
//!
//! State machine:
//! - CLOSED: normal operation; `failure_threshold` backend failures inside
//!   the tracking window transition to OPEN.
//! - OPEN: calls fail fast with `BackendUnavailable` without touching the
//!   backend; after `reset_timeout` the next call moves the breaker to
//!   HALF_OPEN.
//! - HALF_OPEN: up to `half_open_trial_limit` concurrent trial calls pass
//!   through; a trial success closes the breaker (counters reset), a trial
//!   failure reopens it and restarts the timeout clock.
//!
//! Counters are guarded by a single mutex per breaker instance; concurrent
//! completions from in-flight calls are expected and must not lose updates.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::{BreakerConfig, CacheError};

/// Breaker state, exposed on the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Snapshot of breaker state and counters for the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last recorded failure, if any
    pub last_failure_age_ms: Option<u64>,
    /// Milliseconds since the last state transition
    pub last_state_change_age_ms: u64,
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    window_started_at: Instant,
    last_failure_at: Option<Instant>,
    last_state_change_at: Instant,
    half_open_in_flight: u32,
}

/// One breaker per protected backend/resource.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                window_started_at: now,
                last_failure_at: None,
                last_state_change_at: now,
                half_open_in_flight: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a backend call under breaker protection.
    ///
    /// Fails immediately with `BackendUnavailable` while the breaker is OPEN
    /// (or the half-open trial slots are taken) without polling the future.
    /// Errors for which [`CacheError::is_backend_failure`] is false complete
    /// the call without counting against the breaker.
    pub async fn execute<T, Fut>(&self, fut: Fut) -> Result<T, CacheError>
    where
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let trial = self.try_acquire()?;
        let result = fut.await;
        match &result {
            Ok(_) => self.on_success(trial),
            Err(e) if e.is_backend_failure() => self.on_failure(trial),
            Err(_) => self.on_neutral(trial),
        }
        result
    }

    /// Returns whether the admitted call is a half-open trial.
    fn try_acquire(&self) -> Result<bool, CacheError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                if inner.last_state_change_at.elapsed() >= self.config.reset_timeout {
                    debug!("circuit breaker {} half-open, allowing trial call", self.name);
                    inner.state = BreakerState::HalfOpen;
                    inner.last_state_change_at = Instant::now();
                    inner.half_open_in_flight = 1;
                    Ok(true)
                } else {
                    Err(CacheError::BackendUnavailable(format!(
                        "circuit breaker {} is open",
                        self.name
                    )))
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_trial_limit {
                    Err(CacheError::BackendUnavailable(format!(
                        "circuit breaker {} is half-open and trial slots are full",
                        self.name
                    )))
                } else {
                    inner.half_open_in_flight += 1;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        if inner.state == BreakerState::HalfOpen {
            debug!("circuit breaker {} closed after successful trial", self.name);
            inner.state = BreakerState::Closed;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.half_open_in_flight = 0;
            inner.window_started_at = Instant::now();
            inner.last_state_change_at = Instant::now();
        } else {
            inner.success_count = inner.success_count.saturating_add(1);
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(Instant::now());
        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("circuit breaker {} reopened: trial call failed", self.name);
                inner.state = BreakerState::Open;
                inner.half_open_in_flight = 0;
                inner.last_state_change_at = Instant::now();
            }
            BreakerState::Closed => {
                if inner.window_started_at.elapsed() > self.config.failure_window {
                    inner.failure_count = 0;
                    inner.window_started_at = Instant::now();
                }
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        "circuit breaker {} opened after {} failures",
                        self.name, inner.failure_count
                    );
                    inner.state = BreakerState::Open;
                    inner.last_state_change_at = Instant::now();
                }
            }
            // A call admitted before the transition finished while OPEN; only
            // the failure timestamp is worth keeping.
            BreakerState::Open => {}
        }
    }

    /// A completion that neither closes nor opens the breaker (degraded or
    /// non-backend errors). Releases the trial slot if one was held.
    fn on_neutral(&self, trial: bool) {
        if trial {
            let mut inner = self.lock();
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn get_stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_age_ms: inner
                .last_failure_at
                .map(|at| at.elapsed().as_millis() as u64),
            last_state_change_age_ms: inner.last_state_change_at.elapsed().as_millis() as u64,
        }
    }
}
