//! Lifecycle observation hooks
//!
//! [`EngineObserver`] receives enqueue, dequeue, retry, circuit and
//! completion events. Every method has a no-op default so observers only
//! implement what they need. Callbacks run inline on engine tasks and must
//! not block.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskgate_common::collections::Priority;
use taskgate_common::impl_status_conversions;
use taskgate_common::resilience::CircuitState;
use tracing::{debug, info, warn};

use crate::task::TaskId;

/// Terminal outcome of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    /// The classifier marked an error as permanent
    Failed,
    /// Every allowed attempt failed
    Exhausted,
    CircuitOpen,
    RateLimited,
    Cancelled,
    /// Never ran because the engine was shutting down
    Aborted,
    Panicked,
    /// Refused at submission
    Rejected,
}

impl_status_conversions!(OutcomeKind {
    Succeeded => "succeeded",
    Failed => "failed",
    Exhausted => "exhausted",
    CircuitOpen => "circuit_open",
    RateLimited => "rate_limited",
    Cancelled => "cancelled",
    Aborted => "aborted",
    Panicked => "panicked",
    Rejected => "rejected",
});

impl OutcomeKind {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Observer of task lifecycle events
#[allow(unused_variables)]
pub trait EngineObserver: Send + Sync {
    /// A task was accepted into the queue
    fn on_enqueue(&self, task_id: TaskId, target_key: &str, priority: Priority) {}

    /// A task left the queue for dispatch after waiting `queued_for`
    fn on_dequeue(&self, task_id: TaskId, target_key: &str, queued_for: Duration) {}

    /// Attempt `attempt` failed and the next one starts after `delay`
    fn on_retry(
        &self,
        task_id: TaskId,
        target_key: &str,
        attempt: u32,
        delay: Duration,
        error: &str,
    ) {
    }

    /// A target's circuit changed state
    fn on_circuit_state_change(&self, target_key: &str, from: CircuitState, to: CircuitState) {}

    /// A task reached its terminal outcome
    fn on_task_complete(
        &self,
        task_id: TaskId,
        target_key: &str,
        outcome: OutcomeKind,
        elapsed: Duration,
    ) {
    }
}

/// Observer that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl EngineObserver for NoOpObserver {}

/// Observer that forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl EngineObserver for TracingObserver {
    fn on_enqueue(&self, task_id: TaskId, target_key: &str, priority: Priority) {
        debug!(%task_id, target_key, %priority, "task enqueued");
    }

    fn on_dequeue(&self, task_id: TaskId, target_key: &str, queued_for: Duration) {
        debug!(%task_id, target_key, queued_ms = queued_for.as_millis() as u64, "task dequeued");
    }

    fn on_retry(
        &self,
        task_id: TaskId,
        target_key: &str,
        attempt: u32,
        delay: Duration,
        error: &str,
    ) {
        let delay_ms = delay.as_millis() as u64;
        info!(%task_id, target_key, attempt, delay_ms, error, "retrying task");
    }

    fn on_circuit_state_change(&self, target_key: &str, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(target_key, %from, %to, "circuit opened"),
            _ => info!(target_key, %from, %to, "circuit state changed"),
        }
    }

    fn on_task_complete(
        &self,
        task_id: TaskId,
        target_key: &str,
        outcome: OutcomeKind,
        elapsed: Duration,
    ) {
        let elapsed_ms = elapsed.as_millis() as u64;
        if outcome.is_success() {
            debug!(%task_id, target_key, %outcome, elapsed_ms, "task completed");
        } else {
            info!(%task_id, target_key, %outcome, elapsed_ms, "task completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_outcome_kind_conversions() {
        assert_eq!(OutcomeKind::CircuitOpen.to_string(), "circuit_open");
        assert_eq!(OutcomeKind::from_str("RATE_LIMITED"), Ok(OutcomeKind::RateLimited));
        assert!(OutcomeKind::from_str("unknown").is_err());
    }

    #[test]
    fn test_only_succeeded_is_success() {
        assert!(OutcomeKind::Succeeded.is_success());
        assert!(!OutcomeKind::Exhausted.is_success());
        assert!(!OutcomeKind::Cancelled.is_success());
    }

    #[test]
    fn test_default_observer_methods_are_noops() {
        let observer: &dyn EngineObserver = &NoOpObserver;
        observer.on_enqueue(TaskId::new(), "svc", Priority::High);
        observer.on_task_complete(TaskId::new(), "svc", OutcomeKind::Succeeded, Duration::ZERO);
    }
}
