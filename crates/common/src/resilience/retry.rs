//! Retry execution with exponential backoff, jitter and circuit integration
//!
//! [`RetryExecutor`] runs one operation up to `max_attempts` times. Before each
//! attempt it asks the target's [`CircuitBreaker`] for a permit and aborts
//! immediately if the circuit rejects the call. After each failed attempt the
//! breaker is told about the failure, the error is classified through a
//! [`RetryPolicy`], and a transient failure is retried after
//! `min(max_delay, base_delay * factor^(attempt - 1))` with jitter applied.
//!
//! Cancellation is cooperative. The operation receives its attempt number and
//! is expected to observe its own cancellation signal; the executor checks the
//! token before every attempt and races it against every backoff sleep.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitOpenError, CircuitPermit};
use super::{Clock, ConfigError, ConfigResult, SystemClock};
use crate::error::ErrorClassification;
use crate::{duration_millis, option_duration_millis};

/// Decision for whether to retry an operation
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry the operation with the default backoff delay
    Retry,
    /// Retry the operation with a custom delay
    RetryAfter(Duration),
    /// Don't retry the operation
    Stop,
}

/// Trait for determining whether an error should be retried
pub trait RetryPolicy<E> {
    /// Classify `error` raised by attempt number `attempt` (1-based)
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

impl<E, P> RetryPolicy<E> for Arc<P>
where
    P: RetryPolicy<E> + ?Sized,
{
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
        (**self).should_retry(error, attempt)
    }
}

/// Jitter applied to the raw backoff delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Use the raw delay as is
    None,
    /// Uniform in `[0, delay]`
    #[default]
    Full,
    /// `delay / 2` plus a uniform value in `[0, delay / 2]`
    Equal,
}

impl Jitter {
    /// Apply jitter to the calculated delay
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => delay.mul_f64(rand::thread_rng().gen_range(0.0..=1.0)),
            Jitter::Equal => {
                let half = delay / 2;
                half + half.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
            }
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound for any single backoff delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub factor: f64,
    /// Jitter strategy
    pub jitter: Jitter,
    /// Time limit for a single attempt
    #[serde(with = "option_duration_millis")]
    pub attempt_timeout: Option<Duration>,
    /// Whether an attempt that hit `attempt_timeout` may be retried
    pub retry_timeouts: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: Jitter::Full,
            attempt_timeout: None,
            retry_timeouts: true,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "max_attempts",
                "max_attempts must be greater than 0",
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "base_delay",
                "base_delay must not exceed max_delay",
            ));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ConfigError::invalid("factor", "factor must be finite and at least 1.0"));
        }
        if self.attempt_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::invalid(
                "attempt_timeout",
                "attempt_timeout must be greater than zero when set",
            ));
        }
        Ok(())
    }

    /// Backoff delay after failed attempt `attempt` (1-based), before jitter
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff delay after failed attempt `attempt`, with jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.raw_delay(attempt))
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn exponential_backoff(
        mut self,
        base_delay: Duration,
        factor: f64,
        max_delay: Duration,
    ) -> Self {
        self.config.base_delay = base_delay;
        self.config.factor = factor;
        self.config.max_delay = max_delay;
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.config.jitter = Jitter::None;
        self
    }

    pub fn full_jitter(mut self) -> Self {
        self.config.jitter = Jitter::Full;
        self
    }

    pub fn equal_jitter(mut self) -> Self {
        self.config.jitter = Jitter::Equal;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.attempt_timeout = Some(timeout);
        self
    }

    pub fn retry_timeouts(mut self, retry: bool) -> Self {
        self.config.retry_timeouts = retry;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Failure of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError<E> {
    /// The operation returned an error
    Failed(E),
    /// The attempt did not finish within the per-attempt timeout
    TimedOut { timeout: Duration },
}

impl<E> TaskError<E> {
    /// The operation's own error, if the attempt did not time out
    pub fn into_inner(self) -> Option<E> {
        match self {
            TaskError::Failed(error) => Some(error),
            TaskError::TimedOut { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::TimedOut { .. })
    }
}

impl<E: fmt::Display> fmt::Display for TaskError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed(error) => write!(f, "{error}"),
            TaskError::TimedOut { timeout } => write!(f, "attempt timed out after {timeout:?}"),
        }
    }
}

impl<E> std::error::Error for TaskError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TaskError::Failed(error) => Some(error),
            TaskError::TimedOut { .. } => None,
        }
    }
}

/// One failed attempt in a retry sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Attempt number (1-based)
    pub attempt: u32,
    /// Rendered error of the attempt
    pub error: String,
    /// How long the attempt ran
    pub duration: Duration,
    /// Backoff scheduled after this attempt, if another attempt followed
    pub delay: Option<Duration>,
}

/// Errors that end a retry sequence
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The circuit rejected an attempt before it started
    #[error("{open}")]
    CircuitOpen { open: CircuitOpenError, history: Vec<AttemptRecord> },

    /// The operation failed with an error classified as permanent
    #[error("permanent failure on attempt {attempt}: {error}")]
    Permanent { error: TaskError<E>, attempt: u32, history: Vec<AttemptRecord> },

    /// Every allowed attempt failed with a transient error
    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: u32, last: TaskError<E>, history: Vec<AttemptRecord> },

    /// Cancellation was observed before the sequence completed
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, history: Vec<AttemptRecord> },
}

impl<E> RetryError<E> {
    /// History of failed attempts leading to this error
    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            RetryError::CircuitOpen { history, .. }
            | RetryError::Permanent { history, .. }
            | RetryError::Exhausted { history, .. }
            | RetryError::Cancelled { history, .. } => history,
        }
    }

    /// Number of attempts that actually ran
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempt, .. } => *attempt,
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => {
                *attempts
            }
            RetryError::CircuitOpen { history, .. } => {
                u32::try_from(history.len()).unwrap_or(u32::MAX)
            }
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Observer of scheduled retries
pub trait RetryListener: Send + Sync {
    /// Called after attempt `attempt` failed and before sleeping `delay`
    fn on_retry(&self, key: &str, attempt: u32, delay: Duration, error: &str);
}

/// Per-execution context: target circuit, cancellation and overrides
///
/// ```rust
/// use taskgate_common::resilience::{CircuitBreaker, RetryScope};
///
/// let breaker = CircuitBreaker::with_defaults();
/// let scope = RetryScope::guarded(&breaker, "inventory").max_attempts(5);
/// # let _ = scope;
/// ```
pub struct RetryScope<'a, C: Clock = SystemClock> {
    breaker: Option<&'a CircuitBreaker<C>>,
    key: &'a str,
    cancel: Option<&'a CancellationToken>,
    listener: Option<&'a dyn RetryListener>,
    max_attempts: Option<u32>,
    attempt_timeout: Option<Duration>,
}

impl Default for RetryScope<'_, SystemClock> {
    fn default() -> Self {
        Self {
            breaker: None,
            key: "",
            cancel: None,
            listener: None,
            max_attempts: None,
            attempt_timeout: None,
        }
    }
}

impl<'a, C: Clock> RetryScope<'a, C> {
    /// Scope bound to `key`'s circuit in `breaker`
    pub fn guarded(breaker: &'a CircuitBreaker<C>, key: &'a str) -> Self {
        Self {
            breaker: Some(breaker),
            key,
            cancel: None,
            listener: None,
            max_attempts: None,
            attempt_timeout: None,
        }
    }

    #[must_use]
    pub fn cancel_on(mut self, token: &'a CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: &'a dyn RetryListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Override the configured attempt limit
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Override the configured per-attempt timeout
    #[must_use]
    pub fn attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancellationToken::is_cancelled)
    }

    async fn cancelled(&self) {
        match self.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }

    async fn admit(&self) -> Result<Option<CircuitPermit<'a, C>>, CircuitOpenError> {
        match self.breaker {
            Some(breaker) => breaker.acquire(self.key).await.map(Some),
            None => Ok(None),
        }
    }
}

/// The main retry executor
pub struct RetryExecutor<P> {
    config: RetryConfig,
    policy: P,
}

impl<P> fmt::Debug for RetryExecutor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<P> RetryExecutor<P> {
    /// Create a new retry executor with the given configuration and policy
    pub fn new(config: RetryConfig, policy: P) -> Self {
        Self { config, policy }
    }

    /// Create with default configuration
    pub fn with_policy(policy: P) -> Self {
        Self::new(RetryConfig::default(), policy)
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retries and no circuit
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_in(RetryScope::default(), operation).await
    }

    /// Execute an operation with retries inside `scope`
    ///
    /// The operation is called with the 1-based attempt number.
    #[instrument(skip_all, fields(key = scope.key))]
    pub async fn execute_in<C, F, Fut, T, E>(
        &self,
        scope: RetryScope<'_, C>,
        mut operation: F,
    ) -> RetryResult<T, E>
    where
        C: Clock,
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = scope.max_attempts.unwrap_or(self.config.max_attempts).max(1);
        let attempt_timeout = scope.attempt_timeout.or(self.config.attempt_timeout);
        let mut history = Vec::new();
        let mut attempt = 1;

        loop {
            if scope.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt - 1, history });
            }

            let permit = tokio::select! {
                biased;
                () = scope.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt - 1, history });
                }
                admitted = scope.admit() => match admitted {
                    Ok(permit) => permit,
                    Err(open) => {
                        debug!(key = scope.key, attempt, "circuit rejected attempt");
                        return Err(RetryError::CircuitOpen { open, history });
                    }
                },
            };

            debug!(attempt, max_attempts, "executing attempt");
            let started = Instant::now();
            let outcome = match attempt_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, operation(attempt)).await {
                    Ok(result) => result.map_err(TaskError::Failed),
                    Err(_) => Err(TaskError::TimedOut { timeout }),
                },
                None => operation(attempt).await.map_err(TaskError::Failed),
            };
            let duration = started.elapsed();

            let error = match outcome {
                Ok(value) => {
                    if let Some(permit) = permit {
                        permit.succeed();
                    }
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            // A failure caused by cancellation says nothing about the target's health.
            if scope.is_cancelled() {
                drop(permit);
                return Err(RetryError::Cancelled { attempts: attempt, history });
            }
            if let Some(permit) = permit {
                permit.fail();
            }

            let decision = match &error {
                TaskError::TimedOut { .. } if self.config.retry_timeouts => RetryDecision::Retry,
                TaskError::TimedOut { .. } => RetryDecision::Stop,
                TaskError::Failed(inner) => self.policy.should_retry(inner, attempt),
            };
            let mut record =
                AttemptRecord { attempt, error: error.to_string(), duration, delay: None };

            let delay = match decision {
                RetryDecision::Stop => {
                    debug!(attempt, error = %record.error, "permanent failure, not retrying");
                    history.push(record);
                    return Err(RetryError::Permanent { error, attempt, history });
                }
                _ if attempt >= max_attempts => {
                    warn!(attempts = attempt, error = %record.error, "retry attempts exhausted");
                    history.push(record);
                    return Err(RetryError::Exhausted { attempts: attempt, last: error, history });
                }
                RetryDecision::Retry => self.config.delay_for(attempt),
                RetryDecision::RetryAfter(delay) => delay,
            };

            let delay_ms = delay.as_millis() as u64;
            debug!(attempt, delay_ms, error = %record.error, "retrying after backoff");
            if let Some(listener) = scope.listener {
                listener.on_retry(scope.key, attempt, delay, &record.error);
            }
            record.delay = Some(delay);
            history.push(record);

            tokio::select! {
                biased;
                () = scope.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt, history });
                }
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use super::*;

    /// Always retry policy - retries on any error
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retry policy - every error is permanent
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Predicate-based retry policy
    #[derive(Debug, Clone)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E) -> bool,
    {
        fn should_retry(&self, error: &E, _attempt: u32) -> RetryDecision {
            if (self.predicate)(error) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }

    /// Defers to the error's own [`ErrorClassification`]
    ///
    /// Honors `retry_after` hints as custom delays.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct Classified;

    impl<E: ErrorClassification> RetryPolicy<E> for Classified {
        fn should_retry(&self, error: &E, _attempt: u32) -> RetryDecision {
            if !error.is_retryable() {
                return RetryDecision::Stop;
            }
            match error.retry_after() {
                Some(delay) => RetryDecision::RetryAfter(delay),
                None => RetryDecision::Retry,
            }
        }
    }
}
