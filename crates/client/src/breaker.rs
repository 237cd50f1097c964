//! Circuit breaker for the upstream dependency.
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive transient failures reach the threshold
//! Open → Half-Open: first call after the recovery timeout
//! Half-Open → Closed: the trial call succeeds
//! Half-Open → Open: the trial call fails (cooldown restarts)
//! ```
//!
//! Only transient failures count. A client error proves the dependency
//! answered, so it resets the streak like a success. While half-open exactly
//! one trial is in flight; concurrent callers are rejected until it settles.
//! A trial whose future is dropped before completing frees the slot without
//! changing state.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use harbor_core::{Error, ErrorClass, config::BreakerConfig};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerOptions {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(60) }
    }
}

impl From<&BreakerConfig> for BreakerOptions {
    fn from(config: &BreakerConfig) -> Self {
        Self { failure_threshold: config.failure_threshold, recovery_timeout: config.recovery_timeout() }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    /// Neither proves nor disproves the dependency's health.
    Neutral,
}

impl Outcome {
    fn of<T>(result: &Result<T, Error>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(e) if e.is_transient() => Outcome::Failure,
            Err(e) if e.class() == ErrorClass::Client => Outcome::Success,
            Err(_) => Outcome::Neutral,
        }
    }
}

/// Guards calls to one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    options: BreakerOptions,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, options: BreakerOptions) -> Self {
        Self {
            name: name.into(),
            options,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current stored state. An open breaker whose cooldown has elapsed
    /// reports `Open` until the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive transient failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Time left before an open breaker admits a trial. `None` unless open.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(at)) => Some(self.options.recovery_timeout.saturating_sub(at.elapsed())),
            _ => None,
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        tracing::info!(dependency = %self.name, "circuit reset");
    }

    /// Run `operation` if the breaker admits it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] without calling `operation` while the
    /// breaker is open or a half-open trial is in flight. Otherwise returns
    /// the operation's own result.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let permit = self.acquire()?;
        let result = operation().await;
        permit.settle(Outcome::of(&result));
        result
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rejected(&self, retry_in: Duration) -> Error {
        Error::CircuitOpen { dependency: self.name.clone(), retry_in }
    }

    fn acquire(&self) -> Result<Permit<'_>, Error> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit { breaker: self, trial: false, settled: false }),
            CircuitState::Open => {
                let elapsed = inner.last_failure.map(|at| at.elapsed()).unwrap_or(Duration::MAX);
                if elapsed < self.options.recovery_timeout {
                    return Err(self.rejected(self.options.recovery_timeout - elapsed));
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!(dependency = %self.name, "circuit half-open, admitting trial call");
                Ok(Permit { breaker: self, trial: true, settled: false })
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.rejected(Duration::ZERO));
                }
                inner.trial_in_flight = true;
                Ok(Permit { breaker: self, trial: true, settled: false })
            }
        }
    }

    fn record(&self, outcome: Outcome, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }

        match outcome {
            Outcome::Success => {
                if trial || inner.state == CircuitState::Closed {
                    if inner.state != CircuitState::Closed {
                        tracing::info!(dependency = %self.name, "circuit closed");
                    }
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                }
            }
            Outcome::Failure => {
                inner.failures = inner.failures.saturating_add(1);
                inner.last_failure = Some(Instant::now());
                let reopen = trial || inner.state == CircuitState::HalfOpen;
                if reopen || (inner.state == CircuitState::Closed && inner.failures >= self.options.failure_threshold) {
                    if inner.state != CircuitState::Open {
                        tracing::warn!(
                            dependency = %self.name,
                            failures = inner.failures,
                            cooldown_ms = self.options.recovery_timeout.as_millis() as u64,
                            "circuit opened"
                        );
                    }
                    inner.state = CircuitState::Open;
                }
            }
            Outcome::Neutral => {}
        }
    }
}

/// Admission for one call. A trial permit dropped unsettled frees the
/// half-open slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(outcome, self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.lock().trial_in_flight = false;
            tracing::debug!(dependency = %self.breaker.name, "trial call cancelled");
        }
    }
}
