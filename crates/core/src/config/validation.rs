//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `user_agent` is empty
    /// - `retry.backoff_factor` is below 1 or the retry delays are inverted
    /// - `breaker.failure_threshold` is 0
    /// - an interval that drives a periodic task is 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms < 100 {
            return Err(invalid("timeout_ms", "must be at least 100ms"));
        }
        if self.timeout_ms > 300_000 {
            return Err(invalid("timeout_ms", "must not exceed 5 minutes (300000ms)"));
        }

        if self.user_agent.is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }

        if self.drain_interval_secs == 0 {
            return Err(invalid("drain_interval_secs", "must be greater than 0"));
        }

        if self.cache.max_age_secs == 0 {
            return Err(invalid("cache.max_age_secs", "must be greater than 0"));
        }
        if self.cache.cleanup_interval_secs == 0 {
            return Err(invalid("cache.cleanup_interval_secs", "must be greater than 0"));
        }

        if self.probe.liveness_url.is_some() && self.probe.liveness_interval_ms == 0 {
            return Err(invalid("probe.liveness_interval_ms", "must be greater than 0 when liveness_url is set"));
        }
        if let Some(url) = &self.probe.liveness_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(invalid("probe.liveness_url", "must be an http(s) URL"));
        }
        if self.cache.revalidate_urls.iter().any(|url| !(url.starts_with("http://") || url.starts_with("https://"))) {
            return Err(invalid("cache.revalidate_urls", "every entry must be an http(s) URL"));
        }

        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(invalid("retry.backoff_factor", "must be a finite number >= 1"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.initial_delay_ms", "must not exceed retry.max_delay_ms"));
        }
        if self.retry.attempt_timeout_ms == Some(0) {
            return Err(invalid("retry.attempt_timeout_ms", "must be greater than 0 when set"));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }

        if self.probe.debounce_ms > self.breaker.recovery_timeout_ms {
            tracing::warn!(
                debounce_ms = self.probe.debounce_ms,
                recovery_timeout_ms = self.breaker.recovery_timeout_ms,
                "probe debounce is longer than the breaker cooldown; recovery drains may start late"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, CacheConfig, ProbeConfig, RetryConfig};

    fn field_of(result: Result<(), ConfigError>) -> String {
        match result {
            Err(ConfigError::Invalid { field, .. }) => field,
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_timeout_bounds() {
        let config = AppConfig { timeout_ms: 50, ..Default::default() };
        assert_eq!(field_of(config.validate()), "timeout_ms");

        let config = AppConfig { timeout_ms: 301_000, ..Default::default() };
        assert_eq!(field_of(config.validate()), "timeout_ms");

        let config = AppConfig { timeout_ms: 100, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_user_agent() {
        let config = AppConfig { user_agent: String::new(), ..Default::default() };
        assert_eq!(field_of(config.validate()), "user_agent");
    }

    #[test]
    fn test_validate_zero_cache_age() {
        let config = AppConfig { cache: CacheConfig { max_age_secs: 0, ..Default::default() }, ..Default::default() };
        assert_eq!(field_of(config.validate()), "cache.max_age_secs");
    }

    #[test]
    fn test_validate_backoff_factor() {
        let config =
            AppConfig { retry: RetryConfig { backoff_factor: 0.9, ..Default::default() }, ..Default::default() };
        assert_eq!(field_of(config.validate()), "retry.backoff_factor");

        let config =
            AppConfig { retry: RetryConfig { backoff_factor: f64::NAN, ..Default::default() }, ..Default::default() };
        assert_eq!(field_of(config.validate()), "retry.backoff_factor");

        let config =
            AppConfig { retry: RetryConfig { backoff_factor: 1.0, ..Default::default() }, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_inverted_delays() {
        let retry = RetryConfig { initial_delay_ms: 5_000, max_delay_ms: 1_000, ..Default::default() };
        let config = AppConfig { retry, ..Default::default() };
        assert_eq!(field_of(config.validate()), "retry.initial_delay_ms");
    }

    #[test]
    fn test_validate_zero_threshold() {
        let config = AppConfig {
            breaker: BreakerConfig { failure_threshold: 0, ..Default::default() },
            ..Default::default()
        };
        assert_eq!(field_of(config.validate()), "breaker.failure_threshold");
    }

    #[test]
    fn test_validate_liveness_url_scheme() {
        let probe = ProbeConfig { liveness_url: Some("ftp://example.com".into()), ..Default::default() };
        let config = AppConfig { probe, ..Default::default() };
        assert_eq!(field_of(config.validate()), "probe.liveness_url");

        let probe = ProbeConfig { liveness_url: Some("https://example.com/health".into()), ..Default::default() };
        let config = AppConfig { probe, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_revalidate_urls() {
        let cache = CacheConfig { revalidate_urls: vec!["https://example.com/api/notices".into()], ..Default::default() };
        let config = AppConfig { cache, ..Default::default() };
        assert!(config.validate().is_ok());

        let cache = CacheConfig { revalidate_urls: vec!["example.com/api/notices".into()], ..Default::default() };
        let config = AppConfig { cache, ..Default::default() };
        assert_eq!(field_of(config.validate()), "cache.revalidate_urls");
    }

    #[test]
    fn test_validate_zero_debounce_allowed() {
        let probe = ProbeConfig { debounce_ms: 0, ..Default::default() };
        let config = AppConfig { probe, ..Default::default() };
        assert!(config.validate().is_ok());
    }
}
