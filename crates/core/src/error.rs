//! Engine error taxonomy
//!
//! [`EngineError`] is what a task handle resolves to when a task does not
//! succeed, and what [`Engine::submit`](crate::Engine::submit) returns when a
//! task is refused. It is generic over the handler's error type so callers
//! keep access to the typed failure.

use std::time::Duration;

use taskgate_common::error::{CommonError, ErrorClassification, ErrorSeverity};
use taskgate_common::resilience::{AttemptRecord, RetryError, TaskError};
use thiserror::Error;

use crate::hooks::OutcomeKind;

/// Terminal failure of a task
#[derive(Debug, Error)]
pub enum EngineError<E> {
    /// The classifier marked the failure as not worth retrying
    #[error("task failed permanently on attempt {attempts}: {error}")]
    Permanent { error: TaskError<E>, attempts: u32, history: Vec<AttemptRecord> },

    /// Every allowed attempt failed
    #[error("task failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TaskError<E>, history: Vec<AttemptRecord> },

    /// The target's circuit refused the task
    #[error("circuit for '{key}' is open")]
    CircuitOpen { key: String, retry_after: Option<Duration>, history: Vec<AttemptRecord> },

    /// The queue is full and the engine rejects on backpressure
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// No rate-limit token was available and the limiter fails fast
    #[error("rate limit exceeded for '{key}', retry after {retry_after:?}")]
    RateLimited { key: String, retry_after: Duration },

    /// The task was cancelled before it completed
    #[error("task was cancelled")]
    Cancelled,

    /// The engine stopped accepting or running tasks
    #[error("engine is shutting down")]
    ShuttingDown,

    /// The handler panicked
    #[error("task handler panicked: {message}")]
    Panicked { message: String },

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl<E> EngineError<E> {
    /// Terminal outcome this error represents
    pub fn outcome(&self) -> OutcomeKind {
        match self {
            Self::Permanent { .. } => OutcomeKind::Failed,
            Self::RetriesExhausted { .. } => OutcomeKind::Exhausted,
            Self::CircuitOpen { .. } => OutcomeKind::CircuitOpen,
            Self::QueueFull { .. } => OutcomeKind::Rejected,
            Self::RateLimited { .. } => OutcomeKind::RateLimited,
            Self::Cancelled => OutcomeKind::Cancelled,
            Self::ShuttingDown | Self::Common(_) => OutcomeKind::Aborted,
            Self::Panicked { .. } => OutcomeKind::Panicked,
        }
    }

    /// Failed attempts recorded before the task ended
    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            Self::Permanent { history, .. }
            | Self::RetriesExhausted { history, .. }
            | Self::CircuitOpen { history, .. } => history,
            _ => &[],
        }
    }

    /// The handler's last error, if the task ended on one
    pub fn task_error(&self) -> Option<&TaskError<E>> {
        match self {
            Self::Permanent { error, .. } => Some(error),
            Self::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl<E> From<RetryError<E>> for EngineError<E> {
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::CircuitOpen { open, history } => {
                Self::CircuitOpen { key: open.key, retry_after: open.retry_after, history }
            }
            RetryError::Permanent { error, attempt, history } => {
                Self::Permanent { error, attempts: attempt, history }
            }
            RetryError::Exhausted { attempts, last, history } => {
                Self::RetriesExhausted { attempts, last, history }
            }
            RetryError::Cancelled { .. } => Self::Cancelled,
        }
    }
}

/// Refusals are worth resubmitting later; task failures already went
/// through the retry loop.
impl<E> ErrorClassification for EngineError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::QueueFull { .. } | Self::RateLimited { .. } | Self::CircuitOpen { .. } => true,
            Self::Common(err) => err.is_retryable(),
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::QueueFull { .. } | Self::RateLimited { .. } | Self::CircuitOpen { .. } => {
                ErrorSeverity::Warning
            }
            Self::Cancelled | Self::ShuttingDown => ErrorSeverity::Info,
            Self::Panicked { .. } => ErrorSeverity::Critical,
            Self::Common(err) => err.severity(),
            Self::Permanent { .. } | Self::RetriesExhausted { .. } => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        match self {
            Self::Panicked { .. } => true,
            Self::Common(err) => err.is_critical(),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => *retry_after,
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            Self::Common(err) => err.retry_after(),
            _ => None,
        }
    }
}

/// Result type for engine operations on handler error `E`
pub type EngineResult<T, E> = Result<T, EngineError<E>>;

#[cfg(test)]
mod tests {
    use taskgate_common::resilience::{CircuitOpenError, CircuitState};

    use super::*;

    fn record(attempt: u32) -> AttemptRecord {
        AttemptRecord {
            attempt,
            error: "boom".into(),
            duration: Duration::from_millis(1),
            delay: None,
        }
    }

    #[test]
    fn test_retry_errors_map_to_engine_errors() {
        let exhausted: EngineError<String> = RetryError::Exhausted {
            attempts: 3,
            last: TaskError::Failed("boom".to_string()),
            history: vec![record(1), record(2), record(3)],
        }
        .into();
        assert_eq!(exhausted.outcome(), OutcomeKind::Exhausted);
        assert_eq!(exhausted.history().len(), 3);
        assert_eq!(exhausted.task_error(), Some(&TaskError::Failed("boom".to_string())));

        let open: EngineError<String> = RetryError::CircuitOpen {
            open: CircuitOpenError {
                key: "svc".into(),
                state: CircuitState::Open,
                retry_after: Some(Duration::from_secs(5)),
            },
            history: Vec::new(),
        }
        .into();
        assert!(matches!(open, EngineError::CircuitOpen { ref key, .. } if key == "svc"));
        assert_eq!(open.retry_after(), Some(Duration::from_secs(5)));

        let cancelled: EngineError<String> =
            RetryError::Cancelled { attempts: 1, history: vec![record(1)] }.into();
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn test_classification() {
        let full: EngineError<String> = EngineError::QueueFull { capacity: 8 };
        assert!(full.is_retryable());
        assert_eq!(full.severity(), ErrorSeverity::Warning);

        let panicked: EngineError<String> = EngineError::Panicked { message: "oops".into() };
        assert!(!panicked.is_retryable());
        assert!(panicked.is_critical());

        let limited: EngineError<String> =
            EngineError::RateLimited { key: "svc".into(), retry_after: Duration::from_millis(200) };
        assert_eq!(limited.retry_after(), Some(Duration::from_millis(200)));
        assert_eq!(limited.to_string(), "rate limit exceeded for 'svc', retry after 200ms");
    }

    #[test]
    fn test_permanent_message_includes_cause() {
        let err: EngineError<String> = EngineError::Permanent {
            error: TaskError::Failed("bad request".into()),
            attempts: 1,
            history: vec![record(1)],
        };
        assert_eq!(err.to_string(), "task failed permanently on attempt 1: bad request");
        assert_eq!(err.outcome(), OutcomeKind::Failed);
    }
}
