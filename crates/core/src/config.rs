//! Engine configuration
//!
//! One TOML document configures every component. Sections that are left out
//! take their defaults:
//!
//! ```toml
//! [queue]
//! capacity = 512
//! backpressure = "block"
//!
//! [rate_limit]
//! capacity = 20
//! refill_amount = 20
//! refill_interval = 1000
//! scope = "per_key"
//! mode = "wait"
//!
//! [concurrency]
//! permits = 8
//!
//! [retry]
//! max_attempts = 4
//! base_delay = 100
//! max_delay = 2000
//! factor = 2.0
//! jitter = "full"
//! attempt_timeout = 5000
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! reset_timeout = 30000
//! half_open_policy = "fail_fast"
//! ```
//!
//! Durations are in milliseconds.

use std::path::Path;

use serde::{Deserialize, Serialize};
use taskgate_common::collections::QueueConfig;
use taskgate_common::error::{CommonError, ErrorSeverity};
use taskgate_common::resilience::{
    CircuitBreakerConfig, ConfigError, RateLimiterConfig, RetryConfig,
};
use taskgate_common::{impl_error_classification, impl_error_conversion};
use thiserror::Error;
use tracing::debug;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum EngineConfigError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("invalid [{section}] configuration: {source}")]
    Invalid {
        section: &'static str,
        #[source]
        source: ConfigError,
    },
}

impl_error_conversion!(EngineConfigError, Common);

impl_error_classification!(EngineConfigError, Common,
    Self::Invalid { .. } => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    }
);

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, EngineConfigError>;

pub(crate) fn invalid(section: &'static str) -> impl FnOnce(ConfigError) -> EngineConfigError {
    move |source| EngineConfigError::Invalid { section, source }
}

/// Concurrency limiter section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum number of tasks executing at once
    pub permits: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { permits: 16 }
    }
}

/// Complete engine configuration
///
/// `retry.max_attempts` and `retry.attempt_timeout` are the defaults a task
/// gets when its options do not override them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub rate_limit: RateLimiterConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading engine configuration");
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string(self).map_err(|err| EngineConfigError::Common(err.into()))
    }

    /// Check every section, reporting the first invalid one
    pub fn validate(&self) -> ConfigResult<()> {
        self.queue.validate().map_err(invalid("queue"))?;
        self.rate_limit.validate().map_err(invalid("rate_limit"))?;
        if self.concurrency.permits == 0 {
            return Err(EngineConfigError::Invalid {
                section: "concurrency",
                source: ConfigError::invalid("permits", "must be greater than 0"),
            });
        }
        self.retry.validate().map_err(invalid("retry"))?;
        self.circuit_breaker.validate().map_err(invalid("circuit_breaker"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use taskgate_common::collections::BackpressurePolicy;
    use taskgate_common::error::ErrorClassification;
    use taskgate_common::resilience::{AdmissionMode, HalfOpenPolicy, Jitter, RateLimitScope};

    use super::*;

    const FULL: &str = r#"
        [queue]
        capacity = 64
        backpressure = "block"

        [rate_limit]
        capacity = 5
        refill_amount = 5
        refill_interval = 1000
        scope = "per_key"
        mode = "fail_fast"

        [concurrency]
        permits = 2

        [retry]
        max_attempts = 4
        base_delay = 100
        max_delay = 2000
        factor = 2.0
        jitter = "none"
        attempt_timeout = 250

        [circuit_breaker]
        failure_threshold = 3
        reset_timeout = 500
        half_open_policy = "wait"
    "#;

    #[test]
    fn test_parse_full_document() {
        let config = EngineConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.queue, QueueConfig::new(64, BackpressurePolicy::Block));
        assert_eq!(config.rate_limit.bucket.capacity, 5);
        assert_eq!(config.rate_limit.scope, RateLimitScope::PerKey);
        assert_eq!(config.rate_limit.mode, AdmissionMode::FailFast);
        assert_eq!(config.concurrency.permits, 2);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.jitter, Jitter::None);
        assert_eq!(config.retry.attempt_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.half_open_policy, HalfOpenPolicy::Wait);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = EngineConfig::from_toml_str("[concurrency]\npermits = 4\n").unwrap();
        assert_eq!(config.concurrency.permits, 4);
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.circuit_breaker, CircuitBreakerConfig::default());
    }

    #[test]
    fn test_zero_permits_rejected() {
        let err = EngineConfig::from_toml_str("[concurrency]\npermits = 0\n").unwrap_err();
        assert!(matches!(err, EngineConfigError::Invalid { section: "concurrency", .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_section_is_named() {
        let err =
            EngineConfig::from_toml_str("[circuit_breaker]\nfailure_threshold = 0\n").unwrap_err();
        assert!(matches!(err, EngineConfigError::Invalid { section: "circuit_breaker", .. }));
        assert!(err.to_string().starts_with("invalid [circuit_breaker] configuration"));
    }

    #[test]
    fn test_malformed_toml_is_serialization_error() {
        let err = EngineConfig::from_toml_str("[queue\ncapacity = ").unwrap_err();
        assert!(matches!(err, EngineConfigError::Common(CommonError::Serialization { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = EngineConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.concurrency.permits, 2);
    }

    #[test]
    fn test_missing_file_is_persistence_error() {
        let err = EngineConfig::from_toml_file("/nonexistent/taskgate.toml").unwrap_err();
        assert!(matches!(err, EngineConfigError::Common(CommonError::Persistence { .. })));
    }

    #[test]
    fn test_toml_round_trip_preserves_values() {
        let config = EngineConfig::from_toml_str(FULL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
