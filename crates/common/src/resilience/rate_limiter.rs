//! Token bucket rate limiting
//!
//! A [`TokenBucket`] holds up to `capacity` tokens and refills continuously at
//! `refill_amount / refill_interval`. Refill is computed lazily from the clock
//! on every access, so no background timer exists. Token counts are real
//! valued: a bucket refilling at 5 tokens per second has 2.5 tokens after
//! 500 ms of idleness.
//!
//! [`RateLimiter`] layers a scope (one shared bucket or one bucket per key)
//! and an admission mode (wait for tokens or fail fast) on top.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::{Clock, ConfigError, ConfigResult, SystemClock};
use crate::duration_millis;

/// Configuration for token bucket rate limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens the bucket can hold
    pub capacity: u64,
    /// Number of tokens refilled per interval
    pub refill_amount: u64,
    /// Time interval over which `refill_amount` tokens accrue
    #[serde(with = "duration_millis")]
    pub refill_interval: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self { capacity: 100, refill_amount: 10, refill_interval: Duration::from_secs(1) }
    }
}

impl TokenBucketConfig {
    /// Create a new configuration builder
    pub fn builder() -> TokenBucketConfigBuilder {
        TokenBucketConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("capacity", "capacity must be greater than 0"));
        }
        if self.refill_amount == 0 {
            return Err(ConfigError::invalid(
                "refill_amount",
                "refill_amount must be greater than 0",
            ));
        }
        if self.refill_interval.is_zero() {
            return Err(ConfigError::invalid(
                "refill_interval",
                "refill_interval must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Refill rate in tokens per millisecond
    pub fn tokens_per_milli(&self) -> f64 {
        1.0 / self.millis_per_token()
    }

    /// Milliseconds needed to accrue one token
    pub fn millis_per_token(&self) -> f64 {
        self.refill_interval.as_secs_f64() * 1000.0 / self.refill_amount as f64
    }
}

/// Builder for TokenBucketConfig
#[derive(Debug, Default)]
pub struct TokenBucketConfigBuilder {
    config: TokenBucketConfig,
}

impl TokenBucketConfigBuilder {
    pub fn new() -> Self {
        Self { config: TokenBucketConfig::default() }
    }

    pub fn capacity(mut self, capacity: u64) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn refill_amount(mut self, amount: u64) -> Self {
        self.config.refill_amount = amount;
        self
    }

    pub fn refill_interval(mut self, interval: Duration) -> Self {
        self.config.refill_interval = interval;
        self
    }

    pub fn build(self) -> ConfigResult<TokenBucketConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Errors raised by rate limiter admission
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RateLimitError {
    /// The request can never be satisfied by this bucket
    #[error("requested {requested} tokens exceeds bucket capacity {capacity}")]
    ExceedsCapacity { requested: u64, capacity: u64 },

    /// Not enough tokens right now and the limiter is in fail-fast mode
    #[error("rate limit exceeded{}, retry after {retry_after:?}", key_suffix(.key))]
    Exhausted { key: Option<String>, retry_after: Duration },
}

fn key_suffix(key: &Option<String>) -> String {
    key.as_deref().map(|k| format!(" for '{k}'")).unwrap_or_default()
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter
///
/// Allows bursts up to the capacity, then admits at the refill rate.
///
/// ```rust
/// use std::time::Duration;
///
/// use taskgate_common::resilience::{TokenBucket, TokenBucketConfig};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TokenBucketConfig::builder()
///     .capacity(10)
///     .refill_amount(5)
///     .refill_interval(Duration::from_secs(1))
///     .build()?;
/// let bucket = TokenBucket::new(config)?;
///
/// assert!(bucket.try_acquire(3));
/// assert!(!bucket.try_acquire(8));
/// # Ok(())
/// # }
/// ```
pub struct TokenBucket<C: Clock = SystemClock> {
    config: TokenBucketConfig,
    millis_per_token: f64,
    state: Mutex<BucketState>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for TokenBucket<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("config", &self.config)
            .field("tokens", &self.state.lock().tokens)
            .finish()
    }
}

impl TokenBucket<SystemClock> {
    /// Create a full bucket on the system clock
    pub fn new(config: TokenBucketConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Create a full bucket with a custom clock
    pub fn with_clock(config: TokenBucketConfig, clock: C) -> ConfigResult<Self> {
        Self::with_shared_clock(config, Arc::new(clock))
    }

    fn with_shared_clock(config: TokenBucketConfig, clock: Arc<C>) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::full(config, clock))
    }

    fn full(config: TokenBucketConfig, clock: Arc<C>) -> Self {
        let state = BucketState { tokens: config.capacity as f64, last_refill: clock.now() };
        Self {
            millis_per_token: config.millis_per_token(),
            state: Mutex::new(state),
            clock,
            config,
        }
    }

    /// Bucket configuration
    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let accrued = elapsed.as_secs_f64() * 1000.0 / self.millis_per_token;
        state.tokens = (state.tokens + accrued).min(self.config.capacity as f64);
        state.last_refill = now;
    }

    fn wait_for(&self, deficit: f64) -> Duration {
        let millis = (deficit * self.millis_per_token).ceil().max(1.0);
        Duration::from_millis(millis as u64)
    }

    /// Take `n` tokens if they are available right now
    pub fn try_acquire(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after applying refill
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Time until `n` tokens will be available, or `None` if `n` exceeds the
    /// capacity
    pub fn time_until_available(&self, n: u64) -> Option<Duration> {
        if n > self.config.capacity {
            return None;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);
        let deficit = n as f64 - state.tokens;
        if deficit <= 0.0 {
            Some(Duration::ZERO)
        } else {
            Some(self.wait_for(deficit))
        }
    }

    /// Take `n` tokens, suspending until enough have accrued
    ///
    /// The wait is computed from the deficit and the refill rate, then the
    /// bucket is re-checked, since concurrent callers may have taken the
    /// tokens in the meantime.
    pub async fn acquire(&self, n: u64) -> Result<(), RateLimitError> {
        if n > self.config.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                requested: n,
                capacity: self.config.capacity,
            });
        }
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= n as f64 {
                    state.tokens -= n as f64;
                    return Ok(());
                }
                self.wait_for(n as f64 - state.tokens)
            };
            let wait_ms = wait.as_millis() as u64;
            debug!(requested = n, wait_ms, "waiting for rate limit tokens");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Whether one bucket is shared by every call or each key has its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    #[default]
    Global,
    PerKey,
}

/// What a caller experiences when no token is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Suspend until the bucket refills
    #[default]
    Wait,
    /// Return [`RateLimitError::Exhausted`] immediately
    FailFast,
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    #[serde(flatten)]
    pub bucket: TokenBucketConfig,
    pub scope: RateLimitScope,
    pub mode: AdmissionMode,
}

impl RateLimiterConfig {
    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.bucket.validate()
    }
}

/// Scoped rate limiter
///
/// In [`RateLimitScope::PerKey`] mode buckets are created full on first use
/// of a key.
pub struct RateLimiter<C: Clock = SystemClock> {
    config: RateLimiterConfig,
    global: Arc<TokenBucket<C>>,
    keyed: DashMap<String, Arc<TokenBucket<C>>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("keys", &self.keyed.len())
            .finish()
    }
}

impl RateLimiter<SystemClock> {
    pub fn new(config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(config: RateLimiterConfig, clock: C) -> ConfigResult<Self> {
        let clock = Arc::new(clock);
        let global = TokenBucket::with_shared_clock(config.bucket.clone(), Arc::clone(&clock))?;
        Ok(Self { config, global: Arc::new(global), keyed: DashMap::new(), clock })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Bucket governing `key` under the configured scope
    fn bucket(&self, key: &str) -> Arc<TokenBucket<C>> {
        if self.config.scope == RateLimitScope::Global {
            return Arc::clone(&self.global);
        }
        if let Some(existing) = self.keyed.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.keyed.entry(key.to_string()).or_insert_with(|| {
            Arc::new(TokenBucket::full(self.config.bucket.clone(), Arc::clone(&self.clock)))
        });
        Arc::clone(entry.value())
    }

    /// Take `n` tokens for `key` without waiting
    pub fn try_acquire(&self, key: &str, n: u64) -> bool {
        self.bucket(key).try_acquire(n)
    }

    /// Tokens currently available for `key`
    pub fn available_tokens(&self, key: &str) -> f64 {
        self.bucket(key).available_tokens()
    }

    /// Take `n` tokens for `key` according to the admission mode
    #[instrument(skip(self), fields(scope = ?self.config.scope, mode = ?self.config.mode))]
    pub async fn acquire(&self, key: &str, n: u64) -> Result<(), RateLimitError> {
        let bucket = self.bucket(key);
        match self.config.mode {
            AdmissionMode::Wait => bucket.acquire(n).await,
            AdmissionMode::FailFast => {
                if bucket.try_acquire(n) {
                    return Ok(());
                }
                match bucket.time_until_available(n) {
                    None => Err(RateLimitError::ExceedsCapacity {
                        requested: n,
                        capacity: self.config.bucket.capacity,
                    }),
                    Some(retry_after) => {
                        let retry_after_ms = retry_after.as_millis() as u64;
                        warn!(retry_after_ms, "rate limit exceeded");
                        let key =
                            (self.config.scope == RateLimitScope::PerKey).then(|| key.to_string());
                        Err(RateLimitError::Exhausted { key, retry_after })
                    }
                }
            }
        }
    }
}
