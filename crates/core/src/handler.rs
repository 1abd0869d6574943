//! Task handler port
//!
//! The engine is generic over one [`TaskHandler`]: it owns the payload type,
//! the success value and the error type that the retry classifier sees.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::task::TaskContext;

/// Executes the body of a task
///
/// Called once per attempt with a fresh [`TaskContext`]. The payload is
/// borrowed so that retries re-run the same input.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Input carried by each task
    type Payload: Send + Sync + 'static;
    /// Value a successful attempt produces
    type Output: Send + 'static;
    /// Error a failed attempt produces
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run one attempt
    async fn handle(
        &self,
        ctx: TaskContext,
        payload: &Self::Payload,
    ) -> Result<Self::Output, Self::Error>;
}

/// Adapts an async closure into a [`TaskHandler`]
///
/// The payload is cloned into the closure on every attempt.
///
/// ```rust
/// use taskgate_core::{FnHandler, TaskContext};
///
/// let doubler: FnHandler<_, u32, u32, std::io::Error> =
///     FnHandler::new(|_ctx: TaskContext, n: u32| async move { Ok::<u32, std::io::Error>(n * 2) });
/// # let _ = doubler;
/// ```
pub struct FnHandler<F, P, O, E> {
    func: F,
    _marker: PhantomData<fn(P) -> Result<O, E>>,
}

impl<F, P, O, E> FnHandler<F, P, O, E> {
    pub fn new(func: F) -> Self {
        Self { func, _marker: PhantomData }
    }
}

#[async_trait]
impl<F, Fut, P, O, E> TaskHandler for FnHandler<F, P, O, E>
where
    F: Fn(TaskContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    P: Clone + Send + Sync + 'static,
    O: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Payload = P;
    type Output = O;
    type Error = E;

    async fn handle(&self, ctx: TaskContext, payload: &P) -> Result<O, E> {
        (self.func)(ctx, payload.clone()).await
    }
}
