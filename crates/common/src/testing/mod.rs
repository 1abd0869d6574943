//! Testing utilities and helpers
//!
//! - **[`async_utils`]**: async assertions and polling helpers
//! - **[`gauges`]**: concurrency instrumentation for task bodies
//! - Time mocking via [`MockClock`], re-exported from `resilience`
//!
//! ```rust
//! use std::time::Duration;
//!
//! use taskgate_common::testing::{Clock, MockClock};
//!
//! let clock = MockClock::new();
//! let start = clock.now();
//! clock.advance(Duration::from_secs(5));
//! assert_eq!(clock.now() - start, Duration::from_secs(5));
//! ```

pub mod async_utils;
pub mod gauges;

pub use async_utils::{poll_until, timeout_ok};
pub use gauges::{ConcurrencyGauge, GaugeGuard};

pub use crate::resilience::{Clock, MockClock, SystemClock};

/// Install a `tracing` subscriber that writes through the test harness
///
/// Safe to call from many tests; only the first call installs.
#[cfg(feature = "test-utils")]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
