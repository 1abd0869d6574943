//! Engine counters

use std::sync::atomic::{AtomicU64, Ordering};

use taskgate_common::resilience::ConcurrencyMetrics;

use crate::hooks::OutcomeKind;

#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    circuit_rejected: AtomicU64,
    rate_limited: AtomicU64,
    aborted: AtomicU64,
}

impl EngineCounters {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, outcome: OutcomeKind) {
        let counter = match outcome {
            OutcomeKind::Succeeded => &self.succeeded,
            OutcomeKind::Failed | OutcomeKind::Exhausted | OutcomeKind::Panicked => &self.failed,
            OutcomeKind::Cancelled => &self.cancelled,
            OutcomeKind::CircuitOpen => &self.circuit_rejected,
            OutcomeKind::RateLimited => &self.rate_limited,
            OutcomeKind::Aborted => &self.aborted,
            OutcomeKind::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, queued: usize, concurrency: ConcurrencyMetrics) -> EngineMetrics {
        EngineMetrics {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            circuit_rejected: self.circuit_rejected.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            queued,
            concurrency,
        }
    }
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineMetrics {
    /// Tasks accepted into the queue
    pub submitted: u64,
    /// Tasks refused at submission because the queue was full
    pub rejected: u64,
    /// Retries scheduled across all tasks
    pub retries: u64,
    pub succeeded: u64,
    /// Permanent failures, exhausted retries and handler panics
    pub failed: u64,
    pub cancelled: u64,
    pub circuit_rejected: u64,
    pub rate_limited: u64,
    /// Tasks that never ran because the engine shut down
    pub aborted: u64,
    /// Tasks currently waiting in the queue
    pub queued: usize,
    pub concurrency: ConcurrencyMetrics,
}

impl EngineMetrics {
    /// Tasks that reached a terminal outcome
    pub fn completed(&self) -> u64 {
        self.succeeded
            + self.failed
            + self.cancelled
            + self.circuit_rejected
            + self.rate_limited
            + self.aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_limiter() -> ConcurrencyMetrics {
        ConcurrencyMetrics {
            max_concurrent: 2,
            in_flight: 0,
            peak_in_flight: 0,
            acquired: 0,
            released: 0,
        }
    }

    #[test]
    fn test_outcomes_land_in_their_counters() {
        let counters = EngineCounters::default();
        counters.record_submitted();
        counters.record_submitted();
        counters.record_submitted();
        counters.record_outcome(OutcomeKind::Succeeded);
        counters.record_outcome(OutcomeKind::Exhausted);
        counters.record_outcome(OutcomeKind::Panicked);
        counters.record_outcome(OutcomeKind::Rejected);
        counters.record_retry();

        let snapshot = counters.snapshot(0, idle_limiter());
        assert_eq!(snapshot.submitted, 3);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.completed(), 3);
    }
}
