//! Resilience primitives for task execution
//!
//! - **Circuit Breaker**: per-key fault isolation with a single half-open trial call
//! - **Rate Limiter**: token bucket with lazy continuous refill
//! - **Concurrency Limiter**: owned semaphore permits released on drop
//! - **Retry**: exponential backoff with jitter, classification and circuit
//!   integration
//!
//! Every component that reads time does so through [`Clock`], so tests can
//! drive state transitions with [`MockClock`] instead of sleeping.

pub mod circuit_breaker;
pub mod clock;
pub mod concurrency;
pub mod rate_limiter;
pub mod retry;

use thiserror::Error;

use crate::error::CommonError;

/// Invalid component configuration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

impl From<ConfigError> for CommonError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid { field, message } => CommonError::config_field(field, message),
        }
    }
}

/// Configuration result type using simple config errors
pub type ConfigResult<T> = Result<T, ConfigError>;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitCallError,
    CircuitListener, CircuitOpenError, CircuitPermit, CircuitSnapshot, CircuitState,
    HalfOpenPolicy, ResetBackoff,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use concurrency::{ConcurrencyLimiter, ConcurrencyMetrics, ConcurrencyPermit, LimiterClosed};
pub use rate_limiter::{
    AdmissionMode, RateLimitError, RateLimitScope, RateLimiter, RateLimiterConfig, TokenBucket,
    TokenBucketConfig, TokenBucketConfigBuilder,
};
pub use retry::{
    policies, AttemptRecord, Jitter, RetryConfig, RetryConfigBuilder, RetryDecision, RetryError,
    RetryExecutor, RetryListener, RetryPolicy, RetryResult, RetryScope, TaskError,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts_to_common_error() {
        let err: CommonError = ConfigError::invalid("capacity", "must be positive").into();
        assert!(matches!(err, CommonError::Config { field: Some(ref f), .. } if f == "capacity"));
    }
}
