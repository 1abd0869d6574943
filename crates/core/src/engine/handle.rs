//! Caller-side task handles

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::task::TaskId;

type Outcome<O, E> = Result<O, EngineError<E>>;

/// Engine side of a handle; resolves it exactly once
///
/// Dropping an unresolved completion resolves the handle with
/// [`EngineError::ShuttingDown`].
pub(crate) struct Completion<O, E> {
    sender: Option<oneshot::Sender<Outcome<O, E>>>,
}

impl<O, E> Completion<O, E> {
    pub(crate) fn resolve(mut self, outcome: Outcome<O, E>) {
        if let Some(sender) = self.sender.take() {
            // The caller may have dropped its handle.
            let _ = sender.send(outcome);
        }
    }
}

impl<O, E> Drop for Completion<O, E> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(EngineError::ShuttingDown));
        }
    }
}

/// Removes a still-queued task so it never reaches the dispatcher
pub(crate) trait Withdraw: Send + Sync {
    fn withdraw(&self, id: TaskId) -> bool;
}

/// Cancels one task; cloneable and detached from the handle
#[derive(Clone)]
pub struct TaskCanceller {
    id: TaskId,
    token: CancellationToken,
    queue: Weak<dyn Withdraw>,
}

impl TaskCanceller {
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Request cancellation
    ///
    /// A task still in the queue is removed and resolves with
    /// [`EngineError::Cancelled`] immediately. A running task sees the
    /// cancellation through its context and at the next retry boundary.
    /// Returns true when the task was removed from the queue.
    pub fn cancel(&self) -> bool {
        self.token.cancel();
        self.queue.upgrade().is_some_and(|queue| queue.withdraw(self.id))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for TaskCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCanceller")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Awaitable result of a submitted task
///
/// Resolves exactly once with the handler's output or an [`EngineError`].
/// Dropping the handle does not cancel the task.
pub struct TaskHandle<O, E> {
    receiver: oneshot::Receiver<Outcome<O, E>>,
    canceller: TaskCanceller,
}

impl<O, E> TaskHandle<O, E> {
    pub fn id(&self) -> TaskId {
        self.canceller.id
    }

    /// See [`TaskCanceller::cancel`]
    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    pub fn canceller(&self) -> TaskCanceller {
        self.canceller.clone()
    }
}

impl<O, E> Future for TaskHandle<O, E> {
    type Output = Outcome<O, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(EngineError::ShuttingDown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<O, E> fmt::Debug for TaskHandle<O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.canceller.id).finish_non_exhaustive()
    }
}

/// Create a linked handle and completion
pub(crate) fn task_channel<O, E>(
    id: TaskId,
    token: CancellationToken,
    queue: Weak<dyn Withdraw>,
) -> (TaskHandle<O, E>, Completion<O, E>) {
    let (sender, receiver) = oneshot::channel();
    let canceller = TaskCanceller { id, token, queue };
    (TaskHandle { receiver, canceller }, Completion { sender: Some(sender) })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct CountingQueue {
        withdrawn: AtomicUsize,
    }

    impl Withdraw for CountingQueue {
        fn withdraw(&self, _id: TaskId) -> bool {
            self.withdrawn.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn detached<O, E>() -> (TaskHandle<O, E>, Completion<O, E>) {
        let queue: Arc<dyn Withdraw> = Arc::new(CountingQueue::default());
        task_channel(TaskId::new(), CancellationToken::new(), Arc::downgrade(&queue))
    }

    #[tokio::test]
    async fn test_handle_resolves_with_output() {
        let (handle, completion) = detached::<u32, String>();
        completion.resolve(Ok(7));
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_dropped_completion_resolves_shutting_down() {
        let (handle, completion) = detached::<u32, String>();
        drop(completion);
        assert!(matches!(handle.await, Err(EngineError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_cancel_sets_token_and_withdraws() {
        let queue = Arc::new(CountingQueue::default());
        let dyn_queue: Arc<dyn Withdraw> = queue.clone();
        let token = CancellationToken::new();
        let (handle, _completion) =
            task_channel::<u32, String>(TaskId::new(), token.clone(), Arc::downgrade(&dyn_queue));

        let canceller = handle.canceller();
        assert!(canceller.cancel());
        assert!(token.is_cancelled());
        assert!(handle.canceller().is_cancelled());
        assert_eq!(queue.withdrawn.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_engine_dropped_only_sets_token() {
        let (handle, _completion) = detached::<u32, String>();
        assert!(!handle.cancel());
        assert!(handle.canceller().is_cancelled());
    }
}
