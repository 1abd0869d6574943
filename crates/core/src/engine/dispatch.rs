//! Dispatcher loop and per-task pipeline

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use taskgate_common::error::CommonError;
use taskgate_common::resilience::{
    ConcurrencyPermit, RateLimitError, RetryDecision, RetryError, RetryExecutor, RetryListener,
    RetryPolicy, RetryScope, TaskError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::metrics::EngineCounters;
use super::{EngineInner, QueuedTask};
use crate::error::{EngineError, EngineResult};
use crate::handler::TaskHandler;
use crate::hooks::EngineObserver;
use crate::task::{SharedRetryPolicy, TaskContext, TaskId, TaskOptions};

/// Reports scheduled retries of one task to the engine
struct RetryEvents<'a> {
    task_id: TaskId,
    observer: &'a dyn EngineObserver,
    counters: &'a EngineCounters,
}

impl RetryListener for RetryEvents<'_> {
    fn on_retry(&self, key: &str, attempt: u32, delay: Duration, error: &str) {
        self.counters.record_retry();
        self.observer.on_retry(self.task_id, key, attempt, delay, error);
    }
}

/// Failure of one attempt as the retry loop sees it
#[derive(Debug)]
enum AttemptFailure<E> {
    Handler(E),
    Panicked(String),
}

impl<E: fmt::Display> fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(error) => error.fmt(f),
            Self::Panicked(message) => write!(f, "handler panicked: {message}"),
        }
    }
}

/// Task classifier that never retries a panicked attempt
struct StopOnPanic<E>(SharedRetryPolicy<E>);

impl<E> RetryPolicy<AttemptFailure<E>> for StopOnPanic<E> {
    fn should_retry(&self, error: &AttemptFailure<E>, attempt: u32) -> RetryDecision {
        match error {
            AttemptFailure::Handler(error) => self.0.should_retry(error, attempt),
            AttemptFailure::Panicked(_) => RetryDecision::Stop,
        }
    }
}

/// The handler's error, or the panic message when the attempt panicked
fn split_panic<E>(error: TaskError<AttemptFailure<E>>) -> Result<TaskError<E>, String> {
    match error {
        TaskError::Failed(AttemptFailure::Handler(error)) => Ok(TaskError::Failed(error)),
        TaskError::Failed(AttemptFailure::Panicked(message)) => Err(message),
        TaskError::TimedOut { timeout } => Ok(TaskError::TimedOut { timeout }),
    }
}

fn into_engine_error<E>(err: RetryError<AttemptFailure<E>>) -> EngineError<E> {
    match err {
        RetryError::Permanent { error, attempt, history } => match split_panic(error) {
            Ok(error) => EngineError::Permanent { error, attempts: attempt, history },
            Err(message) => EngineError::Panicked { message },
        },
        RetryError::Exhausted { attempts, last, history } => match split_panic(last) {
            Ok(last) => EngineError::RetriesExhausted { attempts, last, history },
            Err(message) => EngineError::Panicked { message },
        },
        RetryError::CircuitOpen { open, history } => {
            EngineError::CircuitOpen { key: open.key, retry_after: open.retry_after, history }
        }
        RetryError::Cancelled { .. } => EngineError::Cancelled,
    }
}

/// Pull tasks in queue order, take a permit for each and hand it to its own
/// tokio task
///
/// Exits when the queue is closed and drained, or on immediate shutdown.
pub(super) async fn run<H: TaskHandler>(inner: Arc<EngineInner<H>>) {
    debug!("dispatcher started");
    loop {
        let next = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => None,
            next = inner.queue.dequeue() => next,
        };
        let Some(task) = next else { break };

        inner.observer.on_dequeue(task.id, &task.target_key, task.submitted_at.elapsed());

        let token = task.token.clone();
        let permit = tokio::select! {
            biased;
            () = token.cancelled() => None,
            permit = inner.limiter.acquire() => Some(permit),
        };
        let error = match permit {
            Some(Ok(permit)) => {
                inner.tasks.spawn(execute(Arc::clone(&inner), task, permit));
                continue;
            }
            Some(Err(closed)) => {
                warn!(task_id = %task.id, error = %closed, "no permit available");
                EngineError::ShuttingDown
            }
            None => {
                debug!(task_id = %task.id, "task cancelled before dispatch");
                EngineError::Cancelled
            }
        };
        let QueuedTask { id, target_key, submitted_at, completion, .. } = task;
        inner.settle(id, &target_key, submitted_at, completion, Err(error)).await;
    }

    // Left behind only on immediate shutdown or when the engine is dropped.
    let abandoned = inner.abandon_queued();
    if abandoned > 0 {
        info!(abandoned, "dispatcher stopped with tasks still queued");
    }
    debug!("dispatcher stopped");
}

/// Run one task to its terminal outcome while holding `permit`
#[instrument(skip_all, fields(task_id = %task.id, target_key = %task.target_key))]
async fn execute<H: TaskHandler>(
    inner: Arc<EngineInner<H>>,
    task: QueuedTask<H>,
    permit: ConcurrencyPermit,
) {
    let QueuedTask { id, target_key, payload, mut options, submitted_at, token, completion } =
        task;

    // Handler panics are caught per attempt; this only guards the pipeline itself.
    let pipeline = inner.run_pipeline(id, &target_key, &payload, &mut options, &token);
    let result = AssertUnwindSafe(pipeline).catch_unwind().await.unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        error!(task_id = %id, panic = %message, "task pipeline panicked");
        Err(EngineError::Panicked { message })
    });

    // The permit is back before the caller observes the result.
    drop(permit);
    inner.settle(id, &target_key, submitted_at, completion, result).await;
}

impl<H: TaskHandler> EngineInner<H> {
    /// Rate-limit admission followed by the retry loop
    async fn run_pipeline(
        &self,
        id: TaskId,
        target_key: &Arc<str>,
        payload: &H::Payload,
        options: &mut TaskOptions<H::Error>,
        token: &CancellationToken,
    ) -> EngineResult<H::Output, H::Error> {
        let admitted = tokio::select! {
            biased;
            () = token.cancelled() => return Err(EngineError::Cancelled),
            admitted = self.rate_limiter.acquire(target_key, 1) => admitted,
        };
        if let Err(err) = admitted {
            return Err(match err {
                RateLimitError::Exhausted { retry_after, .. } => {
                    debug!(retry_after_ms = retry_after.as_millis() as u64, "rate limit exhausted");
                    EngineError::RateLimited { key: target_key.to_string(), retry_after }
                }
                other @ RateLimitError::ExceedsCapacity { .. } => {
                    EngineError::Common(CommonError::internal(other.to_string()))
                }
            });
        }

        let policy =
            options.take_retry_policy().unwrap_or_else(|| Arc::clone(&self.default_policy));
        let executor = RetryExecutor::new(self.config.retry.clone(), StopOnPanic(policy));
        let listener =
            RetryEvents { task_id: id, observer: self.observer.as_ref(), counters: &self.counters };

        let mut scope = RetryScope::guarded(&self.breaker, target_key)
            .cancel_on(token)
            .listener(&listener)
            .attempt_timeout(options.attempt_timeout_override());
        if let Some(max_attempts) = options.max_attempts_override() {
            scope = scope.max_attempts(max_attempts);
        }

        // A panicking attempt counts against the circuit like any failure.
        let handler = &self.handler;
        executor
            .execute_in(scope, move |attempt| {
                let ctx = TaskContext::new(id, Arc::clone(target_key), attempt, token.clone());
                let attempt_run = AssertUnwindSafe(handler.handle(ctx, payload)).catch_unwind();
                attempt_run.map(move |caught| match caught {
                    Ok(result) => result.map_err(AttemptFailure::Handler),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(task_id = %id, attempt, panic = %message, "task handler panicked");
                        Err(AttemptFailure::Panicked(message))
                    }
                })
            })
            .await
            .map_err(into_engine_error)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
