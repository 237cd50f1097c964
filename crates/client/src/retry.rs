//! Retry with exponential backoff.
//!
//! # Backoff Schedule (defaults)
//!
//! | Retry | Delay before it |
//! |-------|-----------------|
//! | 1     | 1s              |
//! | 2     | 2s              |
//! | 3     | 4s              |
//!
//! Delays grow by `backoff_factor` and are capped at `max_delay`. Only
//! errors accepted by `retry_condition` are retried; anything else is
//! returned unchanged after the attempt that produced it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use harbor_core::{Error, config::RetryConfig};

pub type RetryCondition = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
pub type RetryHook = Arc<dyn Fn(u32, &Error) + Send + Sync>;

/// Retry policy for one operation.
#[derive(Clone)]
pub struct RetryOptions {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub retry_condition: RetryCondition,
    /// Called with the 1-based number of the failed attempt before sleeping.
    pub on_retry: Option<RetryHook>,
    /// Deadline for each individual attempt.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            retry_condition: Arc::new(Error::is_transient),
            on_retry: None,
            timeout: None,
        }
    }
}

impl RetryOptions {
    /// For flaky links: more retries, shorter ceiling.
    pub fn network() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// For an overloaded upstream: fewer retries, longer initial wait.
    pub fn server() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15),
            ..Default::default()
        }
    }

    pub fn aggressive() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.5,
            ..Default::default()
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            backoff_factor: config.backoff_factor,
            timeout: config.attempt_timeout(),
            ..Default::default()
        }
    }

    pub fn with_condition(mut self, condition: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.retry_condition = Arc::new(condition);
        self
    }

    pub fn with_on_retry(mut self, hook: impl Fn(u32, &Error) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the retry budget runs out.
///
/// # Errors
///
/// - The operation's own error if `retry_condition` rejects it.
/// - [`Error::RetryExhausted`] carrying the last error once all
///   `max_retries + 1` attempts failed.
/// - [`Error::Timeout`] (retryable by default) for an attempt that missed
///   its deadline.
pub async fn with_retry<T, F, Fut>(mut operation: F, options: &RetryOptions) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut delay = options.initial_delay.min(options.max_delay);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = match options.timeout {
            Some(deadline) => tokio::time::timeout(deadline, operation())
                .await
                .unwrap_or_else(|_| Err(Error::Timeout(deadline))),
            None => operation().await,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !(options.retry_condition)(&err) {
            return Err(err);
        }

        if attempt > options.max_retries {
            return Err(Error::RetryExhausted { attempts: attempt, last: Box::new(err) });
        }

        if let Some(hook) = &options.on_retry {
            hook(attempt, &err);
        }
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after failure");

        tokio::time::sleep(delay).await;
        delay = options.next_delay(delay);
    }
}
