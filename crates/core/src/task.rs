//! Task identity, per-task options and the context handed to handlers

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskgate_common::collections::Priority;
use taskgate_common::resilience::{policies::PredicateRetry, RetryPolicy};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique, time-ordered task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh UUIDv7 identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Shared retry classifier attached to a task
pub type SharedRetryPolicy<E> = Arc<dyn RetryPolicy<E> + Send + Sync>;

/// Per-task overrides of the engine defaults
///
/// ```rust
/// use std::time::Duration;
///
/// use taskgate_common::collections::Priority;
/// use taskgate_core::TaskOptions;
///
/// let options = TaskOptions::<std::io::Error>::new()
///     .priority(Priority::High)
///     .max_attempts(5)
///     .attempt_timeout(Duration::from_secs(2))
///     .retry_if(|err: &std::io::Error| err.kind() == std::io::ErrorKind::TimedOut);
/// assert_eq!(options.max_attempts_override(), Some(5));
/// ```
pub struct TaskOptions<E> {
    priority: Priority,
    max_attempts: Option<u32>,
    attempt_timeout: Option<Duration>,
    retry_policy: Option<SharedRetryPolicy<E>>,
}

impl<E> TaskOptions<E> {
    pub fn new() -> Self {
        Self {
            priority: Priority::Normal,
            max_attempts: None,
            attempt_timeout: None,
            retry_policy: None,
        }
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Upper bound on attempts for this task, at least 1
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    #[must_use]
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Replace the engine's retry classifier for this task
    #[must_use]
    pub fn retry_policy<P>(mut self, policy: P) -> Self
    where
        P: RetryPolicy<E> + Send + Sync + 'static,
    {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    /// Retry only errors for which `predicate` returns true
    #[must_use]
    pub fn retry_if<F>(self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_policy(PredicateRetry::new(predicate))
    }

    pub fn get_priority(&self) -> Priority {
        self.priority
    }

    pub fn max_attempts_override(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn attempt_timeout_override(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    pub(crate) fn take_retry_policy(&mut self) -> Option<SharedRetryPolicy<E>> {
        self.retry_policy.take()
    }
}

impl<E> Default for TaskOptions<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for TaskOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("priority", &self.priority)
            .field("max_attempts", &self.max_attempts)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("custom_retry_policy", &self.retry_policy.is_some())
            .finish()
    }
}

/// Execution context for one attempt of a task
///
/// Handlers should watch [`cancelled`](Self::cancelled) in long-running work;
/// cancellation is cooperative.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    target_key: Arc<str>,
    attempt: u32,
    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        target_key: Arc<str>,
        attempt: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self { task_id, target_key, attempt, cancellation }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the task has been cancelled
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }
}

#[cfg(test)]
mod tests {
    use taskgate_common::resilience::RetryDecision;

    use super::*;

    #[test]
    fn test_task_ids_are_unique_and_time_ordered() {
        let first = TaskId::new();
        let second = TaskId::new();
        assert_ne!(first, second);
        assert!(first < second);
        assert_eq!(first.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn test_task_id_serializes_as_plain_uuid() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            id: TaskId,
        }

        let id = TaskId::new();
        let encoded = toml::to_string(&Wrapper { id }).unwrap();
        assert!(encoded.contains(&id.to_string()));
        let decoded: Wrapper = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, id);
    }

    #[test]
    fn test_options_defaults() {
        let options = TaskOptions::<std::io::Error>::default();
        assert_eq!(options.get_priority(), Priority::Normal);
        assert_eq!(options.max_attempts_override(), None);
        assert_eq!(options.attempt_timeout_override(), None);
    }

    #[test]
    fn test_max_attempts_floor_is_one() {
        let options = TaskOptions::<std::io::Error>::new().max_attempts(0);
        assert_eq!(options.max_attempts_override(), Some(1));
    }

    #[test]
    fn test_retry_if_installs_predicate() {
        let mut options = TaskOptions::<String>::new().retry_if(|err: &String| err == "transient");
        let policy = options.take_retry_policy().unwrap();
        assert_eq!(policy.should_retry(&"transient".to_string(), 1), RetryDecision::Retry);
        assert_eq!(policy.should_retry(&"fatal".to_string(), 1), RetryDecision::Stop);
        assert!(options.take_retry_policy().is_none());
    }

    #[test]
    fn test_context_observes_cancellation() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new(TaskId::new(), Arc::from("svc"), 2, token.clone());
        assert_eq!(ctx.attempt(), 2);
        assert_eq!(ctx.target_key(), "svc");
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
