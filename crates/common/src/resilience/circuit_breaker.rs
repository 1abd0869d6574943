//! Keyed circuit breaker
//!
//! One [`CircuitBreaker`] guards many targets. Each target key owns a lazily
//! created circuit with the classic three states:
//!
//! - **CLOSED**: calls pass through; consecutive failures are counted and the
//!   circuit opens once they reach `failure_threshold`.
//! - **OPEN**: calls are rejected with [`CircuitOpenError`] until the open
//!   timeout elapses.
//! - **HALF_OPEN**: a single trial call is admitted. Its success closes the
//!   circuit, its failure reopens it.
//!
//! Every read and write of one key's state happens under that key's mutex, so
//! the trial gate and the failure counter are exact under contention.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use taskgate_common::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(2)
//!     .reset_timeout(Duration::from_secs(30))
//!     .build()?;
//! let breaker = CircuitBreaker::new(config);
//!
//! for _ in 0..2 {
//!     breaker.try_acquire("billing")?.fail();
//! }
//! assert_eq!(breaker.state("billing"), CircuitState::Open);
//! assert!(breaker.try_acquire("billing").is_err());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::{Clock, ConfigError, ConfigResult, SystemClock};
use crate::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, admitting a single trial
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// What happens to callers that arrive while a half-open trial is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfOpenPolicy {
    /// Reject them immediately with [`CircuitOpenError`]
    #[default]
    FailFast,
    /// Suspend them until the trial resolves, then re-evaluate
    Wait,
}

/// Growth of the open timeout after each failed half-open trial
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResetBackoff {
    /// Multiplier applied per failed trial
    pub factor: f64,
    /// Upper bound for the grown timeout
    #[serde(with = "duration_millis")]
    pub max_timeout: Duration,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
    /// Treatment of callers arriving during a half-open trial
    pub half_open_policy: HalfOpenPolicy,
    /// Optional open-timeout growth after failed trials
    pub reset_backoff: Option<ResetBackoff>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_policy: HalfOpenPolicy::FailFast,
            reset_backoff: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "failure_threshold",
                "failure_threshold must be greater than 0",
            ));
        }
        if self.reset_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "reset_timeout",
                "reset_timeout must be greater than zero",
            ));
        }
        if let Some(backoff) = &self.reset_backoff {
            if !backoff.factor.is_finite() || backoff.factor < 1.0 {
                return Err(ConfigError::invalid(
                    "reset_backoff.factor",
                    "reset_backoff factor must be finite and at least 1.0",
                ));
            }
            if backoff.max_timeout < self.reset_timeout {
                return Err(ConfigError::invalid(
                    "reset_backoff.max_timeout",
                    "reset_backoff max_timeout must not be below reset_timeout",
                ));
            }
        }
        Ok(())
    }

    /// Open duration after `failed_trials` consecutive failed trials
    pub fn open_timeout(&self, failed_trials: u32) -> Duration {
        match &self.reset_backoff {
            Some(backoff) if failed_trials > 0 => {
                let exponent = i32::try_from(failed_trials).unwrap_or(i32::MAX);
                let millis = self.reset_timeout.as_millis() as f64 * backoff.factor.powi(exponent);
                let capped = millis.min(backoff.max_timeout.as_millis() as f64);
                Duration::from_millis(capped as u64)
            }
            _ => self.reset_timeout,
        }
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn half_open_policy(mut self, policy: HalfOpenPolicy) -> Self {
        self.config.half_open_policy = policy;
        self
    }

    pub fn reset_backoff(mut self, factor: f64, max_timeout: Duration) -> Self {
        self.config.reset_backoff = Some(ResetBackoff { factor, max_timeout });
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// A call was rejected because the target's circuit is not accepting traffic
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit for '{key}' is {state}, rejecting call")]
pub struct CircuitOpenError {
    /// Target key whose circuit rejected the call
    pub key: String,
    /// State observed at rejection time
    pub state: CircuitState,
    /// Time until the circuit will admit a trial, when known
    pub retry_after: Option<Duration>,
}

/// Result of [`CircuitBreaker::execute`]
#[derive(Debug, Error)]
pub enum CircuitCallError<E>
where
    E: std::error::Error + 'static,
{
    /// The circuit rejected the call without running it
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    /// The call ran and failed
    #[error("operation failed")]
    Failed(#[source] E),
}

/// Receives every state transition of every key
pub trait CircuitListener: Send + Sync {
    /// Called after the transition is committed, outside the circuit's lock
    fn on_state_change(&self, key: &str, from: CircuitState, to: CircuitState);
}

/// Point-in-time view of one key's circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub trial_in_flight: bool,
    pub open_timeout: Duration,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    failed_trials: u32,
    open_timeout: Duration,
    rejected_calls: u64,
}

impl CircuitRecord {
    fn new(reset_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            failed_trials: 0,
            open_timeout: reset_timeout,
            rejected_calls: 0,
        }
    }

    fn open_elapsed(&self, now: Instant) -> bool {
        self.opened_at.is_some_and(|opened| now.duration_since(opened) >= self.open_timeout)
    }

    fn remaining_open(&self, now: Instant) -> Option<Duration> {
        self.opened_at.map(|opened| self.open_timeout.saturating_sub(now.duration_since(opened)))
    }

    fn close(&mut self, reset_timeout: Duration) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
        self.failed_trials = 0;
        self.open_timeout = reset_timeout;
    }
}

#[derive(Debug)]
struct KeyCircuit {
    record: Mutex<CircuitRecord>,
    changes: watch::Sender<u64>,
}

impl KeyCircuit {
    fn new(reset_timeout: Duration) -> Self {
        let (changes, _) = watch::channel(0);
        Self { record: Mutex::new(CircuitRecord::new(reset_timeout)), changes }
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

type Transition = Option<(CircuitState, CircuitState)>;

/// Keyed circuit breaker registry
///
/// Circuits are created on first use of a key and live as long as the
/// breaker.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Arc<KeyCircuit>>,
    clock: Arc<C>,
    listener: Option<Arc<dyn CircuitListener>>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("keys", &self.circuits.len())
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker on the system clock
    ///
    /// The configuration is expected to have been validated by its builder.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }

    /// Create a breaker with default configuration
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> Self {
        Self { config, circuits: DashMap::new(), clock: Arc::new(clock), listener: None }
    }

    /// Attach a listener that observes every state transition
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn CircuitListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// The configuration this breaker was built with
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuit(&self, key: &str) -> Arc<KeyCircuit> {
        if let Some(existing) = self.circuits.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .circuits
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyCircuit::new(self.config.reset_timeout)));
        Arc::clone(entry.value())
    }

    fn emit(&self, key: &str, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => warn!(key, %from, %to, "circuit opened"),
            _ => info!(key, %from, %to, "circuit state changed"),
        }
        if let Some(listener) = &self.listener {
            listener.on_state_change(key, from, to);
        }
    }

    /// Ask the circuit of `key` for permission to make one call
    ///
    /// Never suspends: under [`HalfOpenPolicy::Wait`] a caller that finds a
    /// trial in flight is still rejected here. Use [`acquire`](Self::acquire)
    /// for the waiting behavior.
    pub fn try_acquire(&self, key: &str) -> Result<CircuitPermit<'_, C>, CircuitOpenError> {
        let circuit = self.circuit(key);
        let (result, transition) = self.admit(&circuit, key);
        self.emit(key, transition);
        result.map(|trial| CircuitPermit {
            breaker: self,
            circuit,
            key: key.to_string(),
            trial,
            settled: false,
        })
    }

    /// Ask for permission, honoring the configured [`HalfOpenPolicy`]
    #[instrument(skip(self), fields(policy = ?self.config.half_open_policy))]
    pub async fn acquire(&self, key: &str) -> Result<CircuitPermit<'_, C>, CircuitOpenError> {
        loop {
            let circuit = self.circuit(key);
            // Subscribing before the check guarantees the trial's resolution is observed.
            let mut changes = circuit.changes.subscribe();
            let (result, transition) = self.admit(&circuit, key);
            self.emit(key, transition);

            match result {
                Ok(trial) => {
                    return Ok(CircuitPermit {
                        breaker: self,
                        circuit,
                        key: key.to_string(),
                        trial,
                        settled: false,
                    })
                }
                Err(rejection)
                    if rejection.state == CircuitState::HalfOpen
                        && self.config.half_open_policy == HalfOpenPolicy::Wait =>
                {
                    debug!(key, "waiting for half-open trial to resolve");
                    if changes.changed().await.is_err() {
                        return Err(rejection);
                    }
                }
                Err(rejection) => return Err(rejection),
            }
        }
    }

    /// Returns `Ok(true)` for a trial permit, `Ok(false)` for a normal one
    fn admit(
        &self,
        circuit: &KeyCircuit,
        key: &str,
    ) -> (Result<bool, CircuitOpenError>, Transition) {
        let now = self.clock.now();
        let mut record = circuit.record.lock();
        match record.state {
            CircuitState::Closed => (Ok(false), None),
            CircuitState::Open if record.open_elapsed(now) => {
                record.state = CircuitState::HalfOpen;
                record.trial_in_flight = true;
                debug!(key, "admitting half-open trial");
                (Ok(true), Some((CircuitState::Open, CircuitState::HalfOpen)))
            }
            CircuitState::Open => {
                record.rejected_calls += 1;
                let rejection = CircuitOpenError {
                    key: key.to_string(),
                    state: CircuitState::Open,
                    retry_after: record.remaining_open(now),
                };
                (Err(rejection), None)
            }
            CircuitState::HalfOpen if !record.trial_in_flight => {
                record.trial_in_flight = true;
                debug!(key, "admitting half-open trial");
                (Ok(true), None)
            }
            CircuitState::HalfOpen => {
                record.rejected_calls += 1;
                let rejection = CircuitOpenError {
                    key: key.to_string(),
                    state: CircuitState::HalfOpen,
                    retry_after: None,
                };
                (Err(rejection), None)
            }
        }
    }

    fn settle_success(&self, circuit: &KeyCircuit, key: &str, trial: bool) {
        let transition = {
            let mut record = circuit.record.lock();
            match record.state {
                CircuitState::Closed => {
                    record.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if trial => {
                    record.close(self.config.reset_timeout);
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                }
                // Calls admitted before the circuit opened do not decide recovery.
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        if trial {
            circuit.notify();
        }
        self.emit(key, transition);
    }

    fn settle_failure(&self, circuit: &KeyCircuit, key: &str, trial: bool) {
        let now = self.clock.now();
        let transition = {
            let mut record = circuit.record.lock();
            match record.state {
                CircuitState::Closed => {
                    record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                    if record.consecutive_failures >= self.config.failure_threshold {
                        record.state = CircuitState::Open;
                        record.opened_at = Some(now);
                        record.open_timeout = self.config.reset_timeout;
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if trial => {
                    record.trial_in_flight = false;
                    record.failed_trials = record.failed_trials.saturating_add(1);
                    record.state = CircuitState::Open;
                    record.opened_at = Some(now);
                    record.open_timeout = self.config.open_timeout(record.failed_trials);
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        if trial {
            circuit.notify();
        }
        self.emit(key, transition);
    }

    fn release_trial(&self, circuit: &KeyCircuit, key: &str) {
        {
            let mut record = circuit.record.lock();
            if record.state == CircuitState::HalfOpen {
                record.trial_in_flight = false;
            }
        }
        debug!(key, "half-open trial released without a verdict");
        circuit.notify();
    }

    /// Execute an operation under the protection of `key`'s circuit
    pub async fn execute<F, Fut, T, E>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<T, CircuitCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let permit = self.acquire(key).await?;
        match operation().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(error) => {
                permit.fail();
                Err(CircuitCallError::Failed(error))
            }
        }
    }

    /// Current state of `key`, applying a due OPEN to HALF_OPEN transition
    pub fn state(&self, key: &str) -> CircuitState {
        let Some(circuit) = self.circuits.get(key).map(|entry| Arc::clone(entry.value())) else {
            return CircuitState::Closed;
        };
        let now = self.clock.now();
        let (state, transition) = {
            let mut record = circuit.record.lock();
            if record.state == CircuitState::Open && record.open_elapsed(now) {
                record.state = CircuitState::HalfOpen;
                (CircuitState::HalfOpen, Some((CircuitState::Open, CircuitState::HalfOpen)))
            } else {
                (record.state, None)
            }
        };
        self.emit(key, transition);
        state
    }

    /// Snapshot of `key`'s circuit, if the key has been seen
    pub fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        let circuit = self.circuits.get(key).map(|entry| Arc::clone(entry.value()))?;
        let record = circuit.record.lock();
        Some(CircuitSnapshot {
            key: key.to_string(),
            state: record.state,
            consecutive_failures: record.consecutive_failures,
            opened_at: record.opened_at,
            trial_in_flight: record.trial_in_flight,
            open_timeout: record.open_timeout,
            rejected_calls: record.rejected_calls,
        })
    }

    /// Current state of every known key, without applying transitions
    pub fn states(&self) -> HashMap<String, CircuitState> {
        self.circuits
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().record.lock().state))
            .collect()
    }

    /// Force `key` back to CLOSED
    pub fn reset(&self, key: &str) {
        let Some(circuit) = self.circuits.get(key).map(|entry| Arc::clone(entry.value())) else {
            return;
        };
        let transition = {
            let mut record = circuit.record.lock();
            let from = record.state;
            record.close(self.config.reset_timeout);
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        circuit.notify();
        info!(key, "circuit manually reset");
        self.emit(key, transition);
    }
}

/// Permission to make one call through a circuit
///
/// Report the verdict with [`succeed`](Self::succeed) or
/// [`fail`](Self::fail). Dropping an unsettled trial frees the half-open slot
/// without recording a verdict, so an abandoned trial never wedges the key.
#[must_use = "a permit must be settled with succeed() or fail()"]
pub struct CircuitPermit<'a, C: Clock = SystemClock> {
    breaker: &'a CircuitBreaker<C>,
    circuit: Arc<KeyCircuit>,
    key: String,
    trial: bool,
    settled: bool,
}

impl<C: Clock> fmt::Debug for CircuitPermit<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("key", &self.key)
            .field("trial", &self.trial)
            .field("settled", &self.settled)
            .finish()
    }
}

impl<C: Clock> CircuitPermit<'_, C> {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Target key of the permit
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record a successful call
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.settle_success(&self.circuit, &self.key, self.trial);
    }

    /// Record a failed call
    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.settle_failure(&self.circuit, &self.key, self.trial);
    }
}

impl<C: Clock> Drop for CircuitPermit<'_, C> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial(&self.circuit, &self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for keyed circuit breaker transitions

    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::resilience::MockClock;

    fn breaker(threshold: u32, reset: Duration) -> (CircuitBreaker<MockClock>, MockClock) {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .reset_timeout(reset)
            .build()
            .unwrap();
        (CircuitBreaker::with_clock(config, clock.clone()), clock)
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<(String, CircuitState, CircuitState)>>,
    }

    impl CircuitListener for RecordingListener {
        fn on_state_change(&self, key: &str, from: CircuitState, to: CircuitState) {
            self.events.lock().push((key.to_string(), from, to));
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().reset_timeout(Duration::ZERO).build().is_err());
        assert!(CircuitBreakerConfig::builder()
            .reset_backoff(0.5, Duration::from_secs(60))
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::builder()
            .reset_timeout(Duration::from_secs(10))
            .reset_backoff(2.0, Duration::from_secs(5))
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_open_timeout_growth_is_capped() {
        let config = CircuitBreakerConfig::builder()
            .reset_timeout(Duration::from_millis(100))
            .reset_backoff(2.0, Duration::from_millis(500))
            .build()
            .unwrap();
        assert_eq!(config.open_timeout(0), Duration::from_millis(100));
        assert_eq!(config.open_timeout(1), Duration::from_millis(200));
        assert_eq!(config.open_timeout(2), Duration::from_millis(400));
        assert_eq!(config.open_timeout(3), Duration::from_millis(500));
    }

    #[test]
    fn test_unknown_key_is_closed() {
        let (breaker, _) = breaker(3, Duration::from_secs(1));
        assert_eq!(breaker.state("nobody"), CircuitState::Closed);
        assert!(breaker.snapshot("nobody").is_none());
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let (breaker, _) = breaker(3, Duration::from_secs(1));

        breaker.try_acquire("k").unwrap().fail();
        breaker.try_acquire("k").unwrap().fail();
        assert_eq!(breaker.state("k"), CircuitState::Closed);

        breaker.try_acquire("k").unwrap().fail();
        assert_eq!(breaker.state("k"), CircuitState::Open);

        let rejection = breaker.try_acquire("k").unwrap_err();
        assert_eq!(rejection.state, CircuitState::Open);
        assert_eq!(rejection.key, "k");
        assert_eq!(rejection.retry_after, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (breaker, _) = breaker(3, Duration::from_secs(1));
        breaker.try_acquire("k").unwrap().fail();
        breaker.try_acquire("k").unwrap().fail();
        breaker.try_acquire("k").unwrap().succeed();
        assert_eq!(breaker.snapshot("k").unwrap().consecutive_failures, 0);

        breaker.try_acquire("k").unwrap().fail();
        breaker.try_acquire("k").unwrap().fail();
        assert_eq!(breaker.state("k"), CircuitState::Closed);
    }

    #[test]
    fn test_rejections_are_not_failures() {
        let (breaker, _) = breaker(1, Duration::from_secs(5));
        breaker.try_acquire("k").unwrap().fail();
        for _ in 0..10 {
            assert!(breaker.try_acquire("k").is_err());
        }
        let snapshot = breaker.snapshot("k").unwrap();
        assert_eq!(snapshot.consecutive_failures, 1);
        assert_eq!(snapshot.rejected_calls, 10);
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        let (breaker, clock) = breaker(1, Duration::from_millis(100));
        breaker.try_acquire("k").unwrap().fail();

        clock.advance_millis(100);
        let trial = breaker.try_acquire("k").unwrap();
        assert!(trial.is_trial());

        for _ in 0..5 {
            let rejection = breaker.try_acquire("k").unwrap_err();
            assert_eq!(rejection.state, CircuitState::HalfOpen);
        }

        trial.succeed();
        assert_eq!(breaker.state("k"), CircuitState::Closed);
        assert!(!breaker.try_acquire("k").unwrap().is_trial());
    }

    #[test]
    fn test_failed_trial_reopens_with_fresh_timer() {
        let (breaker, clock) = breaker(1, Duration::from_millis(100));
        breaker.try_acquire("k").unwrap().fail();

        clock.advance_millis(150);
        breaker.try_acquire("k").unwrap().fail();
        assert_eq!(breaker.state("k"), CircuitState::Open);

        clock.advance_millis(99);
        assert!(breaker.try_acquire("k").is_err());
        clock.advance_millis(1);
        assert!(breaker.try_acquire("k").unwrap().is_trial());
    }

    #[test]
    fn test_failed_trial_grows_open_timeout() {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .reset_timeout(Duration::from_millis(100))
            .reset_backoff(2.0, Duration::from_secs(1))
            .build()
            .unwrap();
        let breaker = CircuitBreaker::with_clock(config, clock.clone());

        breaker.try_acquire("k").unwrap().fail();
        clock.advance_millis(100);
        breaker.try_acquire("k").unwrap().fail();
        assert_eq!(breaker.snapshot("k").unwrap().open_timeout, Duration::from_millis(200));

        clock.advance_millis(150);
        assert!(breaker.try_acquire("k").is_err());
        clock.advance_millis(50);
        breaker.try_acquire("k").unwrap().succeed();
        assert_eq!(breaker.snapshot("k").unwrap().open_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_dropped_trial_frees_slot() {
        let (breaker, clock) = breaker(1, Duration::from_millis(10));
        breaker.try_acquire("k").unwrap().fail();
        clock.advance_millis(10);

        let trial = breaker.try_acquire("k").unwrap();
        drop(trial);

        assert_eq!(breaker.state("k"), CircuitState::HalfOpen);
        assert!(breaker.try_acquire("k").unwrap().is_trial());
    }

    #[test]
    fn test_keys_are_isolated() {
        let (breaker, _) = breaker(1, Duration::from_secs(1));
        breaker.try_acquire("a").unwrap().fail();
        assert_eq!(breaker.state("a"), CircuitState::Open);
        assert_eq!(breaker.state("b"), CircuitState::Closed);
        assert!(breaker.try_acquire("b").is_ok());
    }

    #[test]
    fn test_state_applies_due_half_open_transition() {
        let (breaker, clock) = breaker(1, Duration::from_millis(50));
        breaker.try_acquire("k").unwrap().fail();
        clock.advance_millis(50);
        assert_eq!(breaker.state("k"), CircuitState::HalfOpen);
        assert!(!breaker.snapshot("k").unwrap().trial_in_flight);
    }

    #[test]
    fn test_listener_sees_full_cycle() {
        let clock = MockClock::new();
        let listener = Arc::new(RecordingListener::default());
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(2)
            .reset_timeout(Duration::from_millis(10))
            .build()
            .unwrap();
        let breaker = CircuitBreaker::with_clock(config, clock.clone())
            .with_listener(listener.clone() as Arc<dyn CircuitListener>);

        breaker.try_acquire("svc").unwrap().fail();
        breaker.try_acquire("svc").unwrap().fail();
        clock.advance_millis(10);
        breaker.try_acquire("svc").unwrap().succeed();

        let events = listener.events.lock().clone();
        assert_eq!(
            events,
            vec![
                ("svc".to_string(), CircuitState::Closed, CircuitState::Open),
                ("svc".to_string(), CircuitState::Open, CircuitState::HalfOpen),
                ("svc".to_string(), CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_manual_reset() {
        let (breaker, _) = breaker(1, Duration::from_secs(60));
        breaker.try_acquire("k").unwrap().fail();
        breaker.reset("k");
        assert_eq!(breaker.state("k"), CircuitState::Closed);
        assert_eq!(breaker.states().get("k"), Some(&CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_execute_skips_operation_when_open() {
        let (breaker, _) = breaker(1, Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        let first: Result<(), _> = breaker
            .execute("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::other("down"))
            })
            .await;
        assert!(matches!(first, Err(CircuitCallError::Failed(_))));

        let second: Result<(), CircuitCallError<std::io::Error>> = breaker
            .execute("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(second, Err(CircuitCallError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_policy_resumes_after_trial() {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .reset_timeout(Duration::from_millis(10))
            .half_open_policy(HalfOpenPolicy::Wait)
            .build()
            .unwrap();
        let breaker = Arc::new(CircuitBreaker::with_clock(config, clock.clone()));

        breaker.try_acquire("k").unwrap().fail();
        clock.advance_millis(10);
        let trial = breaker.try_acquire("k").unwrap();

        let waiter = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                let permit = breaker.acquire("k").await;
                permit.map(|p| {
                    let trial = p.is_trial();
                    p.succeed();
                    trial
                })
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        trial.succeed();
        let admitted = waiter.await.unwrap();
        assert_eq!(admitted, Ok(false));
    }

    #[tokio::test]
    async fn test_fail_fast_policy_rejects_during_trial() {
        let (breaker, clock) = breaker(1, Duration::from_millis(10));
        breaker.try_acquire("k").unwrap().fail();
        clock.advance_millis(10);
        let _trial = breaker.acquire("k").await.unwrap();

        let rejection = breaker.acquire("k").await.unwrap_err();
        assert_eq!(rejection.state, CircuitState::HalfOpen);
    }
}
