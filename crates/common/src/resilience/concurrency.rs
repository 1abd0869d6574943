//! Concurrency limiting with owned permits
//!
//! [`ConcurrencyLimiter`] caps the number of operations in flight. Permits are
//! owned values that can be moved into spawned tasks and are returned to the
//! pool when dropped, on every exit path including panics and cancellation.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument};

use super::{ConfigError, ConfigResult};

/// The limiter was closed and will not hand out further permits
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("concurrency limiter is closed")]
pub struct LimiterClosed;

/// Point-in-time counters for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyMetrics {
    /// Maximum permits
    pub max_concurrent: usize,
    /// Permits currently held
    pub in_flight: usize,
    /// Highest `in_flight` ever observed
    pub peak_in_flight: usize,
    /// Total permits handed out
    pub acquired: u64,
    /// Total permits returned
    pub released: u64,
}

impl ConcurrencyMetrics {
    /// Current utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.in_flight as f64 / self.max_concurrent as f64
    }

    /// Check if every permit is held
    pub fn is_at_capacity(&self) -> bool {
        self.in_flight >= self.max_concurrent
    }
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Limits the number of concurrent operations
///
/// Cloning is cheap and clones share the same permit pool.
///
/// ```rust
/// use taskgate_common::resilience::ConcurrencyLimiter;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = ConcurrencyLimiter::new(2)?;
///
/// let permit = limiter.acquire().await?;
/// tokio::spawn(async move {
///     // work while holding the permit
///     drop(permit);
/// });
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl ConcurrencyLimiter {
    /// Create a limiter allowing `max_concurrent` permits at once
    pub fn new(max_concurrent: usize) -> ConfigResult<Self> {
        if max_concurrent == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent",
                "max_concurrent must be greater than 0",
            ));
        }
        if max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(
                "max_concurrent",
                format!("max_concurrent must not exceed {}", Semaphore::MAX_PERMITS),
            ));
        }
        Ok(Self {
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            counters: Arc::new(Counters::default()),
        })
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> ConcurrencyPermit {
        let previous = self.counters.in_flight.fetch_add(1, Ordering::AcqRel);
        self.counters.peak.fetch_max(previous + 1, Ordering::AcqRel);
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        ConcurrencyPermit { _permit: permit, counters: Arc::clone(&self.counters) }
    }

    /// Try to acquire a permit without waiting
    ///
    /// Returns `None` if at capacity or closed.
    pub fn try_acquire(&self) -> Option<ConcurrencyPermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok().map(|permit| self.wrap(permit))
    }

    /// Acquire a permit, waiting in FIFO order until one is free
    pub async fn acquire(&self) -> Result<ConcurrencyPermit, LimiterClosed> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.map_err(|_| LimiterClosed)?;
        Ok(self.wrap(permit))
    }

    /// Run an operation while holding a permit
    #[instrument(skip(self, operation), fields(in_flight = self.in_flight()))]
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, LimiterClosed>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        debug!("executing under concurrency limit");
        Ok(operation().await)
    }

    /// Wait until every permit has been returned
    ///
    /// Holds all permits momentarily, so callers waiting in [`acquire`]
    /// queued before this call are served first.
    ///
    /// [`acquire`]: Self::acquire
    pub async fn wait_idle(&self) -> Result<(), LimiterClosed> {
        let permits = u32::try_from(self.max_concurrent).map_err(|_| LimiterClosed)?;
        let all = self.semaphore.acquire_many(permits).await.map_err(|_| LimiterClosed)?;
        drop(all);
        Ok(())
    }

    /// Stop handing out permits; pending and future acquires fail
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Maximum number of permits
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Permits currently held
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }

    /// Permits currently available
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn metrics(&self) -> ConcurrencyMetrics {
        ConcurrencyMetrics {
            max_concurrent: self.max_concurrent,
            in_flight: self.in_flight(),
            peak_in_flight: self.counters.peak.load(Ordering::Acquire),
            acquired: self.counters.acquired.load(Ordering::Acquire),
            released: self.counters.released.load(Ordering::Acquire),
        }
    }
}

impl fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("max_concurrent", &self.max_concurrent)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A held concurrency slot, released on drop
#[must_use = "dropping the permit releases the slot immediately"]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyPermit").finish_non_exhaustive()
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }
}
