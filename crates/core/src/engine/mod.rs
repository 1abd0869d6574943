//! Task execution engine
//!
//! The [`Engine`] owns one queue, one rate limiter, one concurrency limiter
//! and one circuit breaker registry, and runs every submitted task through
//! them in order:
//!
//! 1. the bounded priority queue (reject or block when full)
//! 2. a concurrency permit, acquired by the dispatcher in queue order
//! 3. a rate-limit token for the task's target key (wait or fail fast)
//! 4. the retry loop, each attempt admitted by the target's circuit
//!
//! Every task resolves its [`TaskHandle`] exactly once and returns its permit
//! on every exit path.
//!
//! ```rust,no_run
//! use taskgate_core::{Engine, EngineConfig, FnHandler, TaskContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handler = FnHandler::new(|_ctx: TaskContext, order: u64| async move {
//!     Ok::<_, std::io::Error>(format!("shipped {order}"))
//! });
//! let engine = Engine::new(handler, EngineConfig::default())?;
//!
//! let handle = engine.submit("warehouse-eu", 42).await?;
//! assert_eq!(handle.await?, "shipped 42");
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod handle;
mod metrics;

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use taskgate_common::collections::{QueueError, TaskQueue};
use taskgate_common::error::CommonError;
use taskgate_common::resilience::{
    policies, CircuitBreaker, CircuitListener, CircuitSnapshot, CircuitState, ConcurrencyLimiter,
    RateLimiter, RetryPolicy,
};
use tokio::runtime::Handle as RuntimeHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

pub use handle::{TaskCanceller, TaskHandle};
pub use metrics::EngineMetrics;

use self::handle::{task_channel, Completion, Withdraw};
use self::metrics::EngineCounters;
use crate::config::{invalid, ConfigResult, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::handler::TaskHandler;
use crate::hooks::{EngineObserver, NoOpObserver, OutcomeKind};
use crate::store::{TaskRecord, TaskStore};
use crate::task::{SharedRetryPolicy, TaskId, TaskOptions};

/// A task waiting in the queue
pub(crate) struct QueuedTask<H: TaskHandler> {
    id: TaskId,
    target_key: Arc<str>,
    payload: H::Payload,
    options: TaskOptions<H::Error>,
    submitted_at: Instant,
    token: CancellationToken,
    completion: Completion<H::Output, H::Error>,
}

/// Forwards circuit transitions to the engine observer
struct CircuitEvents(Arc<dyn EngineObserver>);

impl CircuitListener for CircuitEvents {
    fn on_state_change(&self, key: &str, from: CircuitState, to: CircuitState) {
        self.0.on_circuit_state_change(key, from, to);
    }
}

/// State shared by the engine front, the dispatcher and running tasks
pub(crate) struct EngineInner<H: TaskHandler> {
    handler: H,
    config: EngineConfig,
    queue: TaskQueue<TaskId, QueuedTask<H>>,
    rate_limiter: RateLimiter,
    limiter: ConcurrencyLimiter,
    breaker: CircuitBreaker,
    default_policy: SharedRetryPolicy<H::Error>,
    observer: Arc<dyn EngineObserver>,
    store: Option<Arc<dyn TaskStore>>,
    counters: EngineCounters,
    /// Cancelled by `shutdown_now`; every task token is a child
    shutdown: CancellationToken,
    /// Running tasks and detached store writes; shutdown waits on both
    tasks: TaskTracker,
}

impl<H: TaskHandler> EngineInner<H> {
    /// Count, observe and log a terminal outcome
    fn record_outcome(
        &self,
        id: TaskId,
        target_key: &str,
        outcome: OutcomeKind,
        elapsed: Duration,
    ) {
        self.counters.record_outcome(outcome);
        self.observer.on_task_complete(id, target_key, outcome, elapsed);
    }

    async fn persist_outcome(&self, id: TaskId, outcome: OutcomeKind) {
        if let Some(store) = &self.store {
            if let Err(err) = store.persist_complete(id, outcome).await {
                warn!(task_id = %id, %outcome, error = %err, "failed to persist task outcome");
            }
        }
    }

    /// Resolve a task that ran (or tried to run) through the pipeline
    pub(crate) async fn settle(
        &self,
        id: TaskId,
        target_key: &str,
        submitted_at: Instant,
        completion: Completion<H::Output, H::Error>,
        result: EngineResult<H::Output, H::Error>,
    ) {
        let outcome = match &result {
            Ok(_) => OutcomeKind::Succeeded,
            Err(err) => err.outcome(),
        };
        self.record_outcome(id, target_key, outcome, submitted_at.elapsed());
        self.persist_outcome(id, outcome).await;
        completion.resolve(result);
    }

    /// Resolve a task that never left the queue
    ///
    /// Synchronous so it can run from [`TaskCanceller::cancel`]; the store
    /// write is spawned onto the current runtime when there is one.
    pub(crate) fn abandon(&self, task: QueuedTask<H>, error: EngineError<H::Error>) {
        let outcome = error.outcome();
        self.record_outcome(task.id, &task.target_key, outcome, task.submitted_at.elapsed());
        self.persist_detached(task.id, outcome);
        task.completion.resolve(Err(error));
    }

    /// Persist an outcome from a synchronous context
    ///
    /// The write runs on the task tracker so shutdown still waits for it.
    fn persist_detached(&self, id: TaskId, outcome: OutcomeKind) {
        let Some(store) = &self.store else { return };
        let store = Arc::clone(store);
        match RuntimeHandle::try_current() {
            Ok(runtime) => {
                self.tasks.spawn_on(
                    async move {
                        if let Err(err) = store.persist_complete(id, outcome).await {
                            warn!(
                                task_id = %id,
                                %outcome,
                                error = %err,
                                "failed to persist task outcome"
                            );
                        }
                    },
                    &runtime,
                );
            }
            Err(_) => {
                warn!(task_id = %id, %outcome, "no runtime available to persist task outcome");
            }
        }
    }

    /// Resolve every task still in the queue with `ShuttingDown`
    pub(crate) fn abandon_queued(&self) -> usize {
        let drained = self.queue.drain();
        let count = drained.len();
        for task in drained {
            self.abandon(task, EngineError::ShuttingDown);
        }
        count
    }
}

/// Marks a persisted submission aborted unless the queue took the task
///
/// A blocked `submit` whose future is dropped never reaches the queue; the
/// store must not keep that record pending.
struct PendingEnqueue<'a, H: TaskHandler> {
    inner: &'a EngineInner<H>,
    id: TaskId,
    armed: bool,
}

impl<H: TaskHandler> PendingEnqueue<'_, H> {
    /// The queue accepted the task; the dispatcher now owns its record
    fn accepted(mut self) {
        self.armed = false;
    }

    /// The queue refused the task with `outcome`
    fn refused(mut self, outcome: OutcomeKind) {
        self.armed = false;
        self.inner.persist_detached(self.id, outcome);
    }
}

impl<H: TaskHandler> Drop for PendingEnqueue<'_, H> {
    fn drop(&mut self) {
        if self.armed {
            debug!(task_id = %self.id, "submission abandoned before the task was queued");
            self.inner.persist_detached(self.id, OutcomeKind::Aborted);
        }
    }
}

impl<H: TaskHandler> Withdraw for EngineInner<H> {
    fn withdraw(&self, id: TaskId) -> bool {
        match self.queue.remove(&id) {
            Some(task) => {
                debug!(task_id = %id, "cancelled task removed from queue");
                self.abandon(task, EngineError::Cancelled);
                true
            }
            None => false,
        }
    }
}

/// Configures and starts an [`Engine`]
pub struct EngineBuilder<H: TaskHandler> {
    handler: H,
    config: EngineConfig,
    observer: Arc<dyn EngineObserver>,
    store: Option<Arc<dyn TaskStore>>,
    retry_policy: SharedRetryPolicy<H::Error>,
}

impl<H: TaskHandler> EngineBuilder<H> {
    fn new(handler: H) -> Self {
        Self {
            handler,
            config: EngineConfig::default(),
            observer: Arc::new(NoOpObserver),
            store: None,
            retry_policy: Arc::new(policies::AlwaysRetry),
        }
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Classifier for tasks that do not bring their own; every error is
    /// retried by default
    #[must_use]
    pub fn retry_policy<P>(mut self, policy: P) -> Self
    where
        P: RetryPolicy<H::Error> + Send + Sync + 'static,
    {
        self.retry_policy = Arc::new(policy);
        self
    }

    /// Validate the configuration and start the dispatcher
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> ConfigResult<Engine<H>> {
        let config = self.config;
        config.validate()?;
        let runtime = RuntimeHandle::try_current()
            .map_err(|_| CommonError::internal("engine must be built inside a tokio runtime"))?;

        let queue = TaskQueue::new(config.queue.clone()).map_err(invalid("queue"))?;
        let rate_limiter =
            RateLimiter::new(config.rate_limit.clone()).map_err(invalid("rate_limit"))?;
        let limiter =
            ConcurrencyLimiter::new(config.concurrency.permits).map_err(invalid("concurrency"))?;
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone())
            .with_listener(Arc::new(CircuitEvents(Arc::clone(&self.observer))));

        info!(
            permits = config.concurrency.permits,
            queue_capacity = config.queue.capacity,
            failure_threshold = config.circuit_breaker.failure_threshold,
            "starting task engine"
        );

        let inner = Arc::new(EngineInner {
            handler: self.handler,
            config,
            queue,
            rate_limiter,
            limiter,
            breaker,
            default_policy: self.retry_policy,
            observer: self.observer,
            store: self.store,
            counters: EngineCounters::default(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        let dispatcher = runtime.spawn(dispatch::run(Arc::clone(&inner)));

        Ok(Engine { inner, dispatcher: Mutex::new(Some(dispatcher)) })
    }
}

/// Resilient task execution engine
pub struct Engine<H: TaskHandler> {
    inner: Arc<EngineInner<H>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<H: TaskHandler> Engine<H> {
    pub fn builder(handler: H) -> EngineBuilder<H> {
        EngineBuilder::new(handler)
    }

    /// Start an engine with default hooks and no store
    pub fn new(handler: H, config: EngineConfig) -> ConfigResult<Self> {
        Self::builder(handler).config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Submit a task with default options
    pub async fn submit(
        &self,
        target_key: impl Into<String>,
        payload: H::Payload,
    ) -> EngineResult<TaskHandle<H::Output, H::Error>, H::Error> {
        self.submit_with(target_key, payload, TaskOptions::default()).await
    }

    /// Submit a task
    ///
    /// Resolves once the task is queued. Under the block backpressure policy
    /// this waits for queue space. The observer's `on_enqueue` fires after
    /// the queue accepted the task, so a fast dispatcher may report the
    /// dequeue first.
    #[instrument(skip(self, target_key, payload, options), fields(key = tracing::field::Empty))]
    pub async fn submit_with(
        &self,
        target_key: impl Into<String>,
        payload: H::Payload,
        options: TaskOptions<H::Error>,
    ) -> EngineResult<TaskHandle<H::Output, H::Error>, H::Error> {
        let target_key: Arc<str> = Arc::from(target_key.into());
        tracing::Span::current().record("key", &*target_key);
        let inner = &self.inner;
        if inner.queue.is_closed() {
            return Err(EngineError::ShuttingDown);
        }

        let id = TaskId::new();
        let priority = options.get_priority();
        let mut pending = None;
        if let Some(store) = &inner.store {
            let max_attempts =
                options.max_attempts_override().unwrap_or(inner.config.retry.max_attempts);
            let record = TaskRecord {
                id,
                target_key: target_key.to_string(),
                priority,
                max_attempts,
                enqueued_at: Utc::now(),
            };
            store.persist_enqueue(&record).await?;
            pending = Some(PendingEnqueue { inner: inner.as_ref(), id, armed: true });
        }

        let token = inner.shutdown.child_token();
        let weak: Weak<EngineInner<H>> = Arc::downgrade(inner);
        let withdraw: Weak<dyn Withdraw> = weak;
        let (handle, completion) = task_channel(id, token.clone(), withdraw);
        let task = QueuedTask {
            id,
            target_key: Arc::clone(&target_key),
            payload,
            options,
            submitted_at: Instant::now(),
            token,
            completion,
        };

        match inner.queue.enqueue(id, priority, task).await {
            Ok(()) => {
                if let Some(pending) = pending {
                    pending.accepted();
                }
                inner.counters.record_submitted();
                inner.observer.on_enqueue(id, &target_key, priority);
                debug!(task_id = %id, %priority, "task queued");
                Ok(handle)
            }
            Err(err) => {
                let error = match err {
                    QueueError::Full { capacity } => {
                        warn!(task_id = %id, capacity, "queue full, rejecting task");
                        inner.counters.record_outcome(OutcomeKind::Rejected);
                        EngineError::QueueFull { capacity }
                    }
                    QueueError::Closed => EngineError::ShuttingDown,
                    QueueError::Common(err) => EngineError::Common(err),
                    QueueError::DuplicateItem(item) => EngineError::Common(CommonError::internal(
                        format!("duplicate task id {item}"),
                    )),
                };
                if let Some(pending) = pending {
                    pending.refused(error.outcome());
                }
                Err(error)
            }
        }
    }

    /// Submit a task and wait for its result
    pub async fn execute(
        &self,
        target_key: impl Into<String>,
        payload: H::Payload,
        options: TaskOptions<H::Error>,
    ) -> EngineResult<H::Output, H::Error> {
        self.submit_with(target_key, payload, options).await?.await
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.inner.counters.snapshot(self.inner.queue.len(), self.inner.limiter.metrics())
    }

    pub fn circuit_state(&self, target_key: &str) -> CircuitState {
        self.inner.breaker.state(target_key)
    }

    pub fn circuit_snapshot(&self, target_key: &str) -> Option<CircuitSnapshot> {
        self.inner.breaker.snapshot(target_key)
    }

    /// Force a target's circuit back to closed
    pub fn reset_circuit(&self, target_key: &str) {
        self.inner.breaker.reset(target_key);
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether new submissions are accepted
    pub fn is_accepting(&self) -> bool {
        !self.inner.queue.is_closed()
    }

    /// Stop accepting tasks, run everything already queued, and wait until
    /// every task has settled
    ///
    /// On return each outcome is counted, reported to the observer, written
    /// to the store and delivered to its handle.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!(queued = self.inner.queue.len(), "graceful shutdown requested");
        self.inner.queue.close();
        self.join_dispatcher().await;
        self.wait_settled().await;
        info!(metrics = ?self.metrics(), "engine stopped");
    }

    /// Stop accepting tasks, resolve queued tasks with `ShuttingDown`, signal
    /// cancellation to running tasks and wait for them to return
    #[instrument(skip(self))]
    pub async fn shutdown_now(&self) {
        warn!(queued = self.inner.queue.len(), "immediate shutdown requested");
        self.inner.queue.close();
        self.inner.shutdown.cancel();
        let abandoned = self.inner.abandon_queued();
        if abandoned > 0 {
            info!(abandoned, "queued tasks resolved as shutting down");
        }
        self.join_dispatcher().await;
        self.wait_settled().await;
        info!(metrics = ?self.metrics(), "engine stopped");
    }

    async fn join_dispatcher(&self) {
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if let Err(err) = dispatcher.await {
                error!(error = %err, "dispatcher task failed");
            }
        }
    }

    /// Wait for spawned tasks and pending store writes
    ///
    /// The dispatcher has stopped, so nothing new reaches the tracker
    /// except store writes for tasks withdrawn meanwhile.
    async fn wait_settled(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

impl<H: TaskHandler> Drop for Engine<H> {
    fn drop(&mut self) {
        if !self.inner.queue.is_closed() {
            debug!("engine dropped without shutdown, cancelling outstanding tasks");
        }
        self.inner.queue.close();
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
    }
}

impl<H: TaskHandler> std::fmt::Debug for Engine<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("accepting", &self.is_accepting())
            .field("queued", &self.inner.queue.len())
            .field("in_flight", &self.inner.limiter.in_flight())
            .finish_non_exhaustive()
    }
}
