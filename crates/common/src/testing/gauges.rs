//! Instrumentation for concurrency assertions
//!
//! A [`ConcurrencyGauge`] is entered at the start of a task body and exited by
//! dropping the returned guard, recording how many bodies ran at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts concurrently running sections and remembers the peak
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGauge {
    inner: Arc<GaugeCounters>,
}

#[derive(Debug, Default)]
struct GaugeCounters {
    current: AtomicUsize,
    peak: AtomicUsize,
    entered: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a section as running until the guard drops
    pub fn enter(&self) -> GaugeGuard {
        let now = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);
        self.inner.entered.fetch_add(1, Ordering::SeqCst);
        GaugeGuard { inner: Arc::clone(&self.inner) }
    }

    pub fn current(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    /// Total number of sections ever entered
    pub fn entered(&self) -> usize {
        self.inner.entered.load(Ordering::SeqCst)
    }
}

/// Running-section marker returned by [`ConcurrencyGauge::enter`]
#[derive(Debug)]
pub struct GaugeGuard {
    inner: Arc<GaugeCounters>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.inner.current.fetch_sub(1, Ordering::SeqCst);
    }
}
