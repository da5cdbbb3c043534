use crate::cancel::CancelSignal;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Error type a task function may return. Anything convertible via `?` works.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The boxed future a task function produces when invoked.
pub type TaskFuture<O> = Pin<Box<dyn Future<Output = Result<O, BoxError>> + Send + 'static>>;

/// A shared reference to a task function.
pub type TaskFn<I, O> = Arc<dyn Fn(I, TaskContext) -> TaskFuture<O> + Send + Sync + 'static>;

/// What a running task can see about itself and its run.
#[derive(Debug, Clone)]
pub struct TaskContext {
  pub(crate) index: usize,
  pub(crate) worker_id: usize,
  pub(crate) cancel: CancelSignal,
}

impl TaskContext {
  /// The submission-order index of this task.
  pub fn index(&self) -> usize {
    self.index
  }

  /// The worker executing this task.
  pub fn worker_id(&self) -> usize {
    self.worker_id
  }

  /// The run's cancellation signal. The runner never interrupts a task that has
  /// started, so long tasks should check this if they want to stop early.
  pub fn cancel_signal(&self) -> &CancelSignal {
    &self.cancel
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }
}

/// A unit of work: an input plus the function to apply to it.
pub struct Task<I, O> {
  pub(crate) input: I,
  pub(crate) func: TaskFn<I, O>,
}

impl<I, O> fmt::Debug for Task<I, O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task").finish_non_exhaustive()
  }
}

impl<I: Send + 'static, O: Send + 'static> Task<I, O> {
  /// Builds a task from a fallible async function of its input.
  pub fn new<F, Fut>(input: I, func: F) -> Self
  where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
  {
    Self::with_context(input, move |input, _ctx| func(input))
  }

  /// Builds a task whose function also receives a [`TaskContext`].
  pub fn with_context<F, Fut>(input: I, func: F) -> Self
  where
    F: Fn(I, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
  {
    let func: TaskFn<I, O> = Arc::new(move |input: I, ctx: TaskContext| Box::pin(func(input, ctx)) as TaskFuture<O>);
    Self { input, func }
  }

  /// Builds a task from an async function that cannot fail (it may still panic).
  pub fn infallible<F, Fut>(input: I, func: F) -> Self
  where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
  {
    Self::with_context(input, move |input, _ctx| {
      let fut = func(input);
      async move { Ok(fut.await) }
    })
  }

  /// Builds a task that shares an existing function reference.
  pub fn from_fn(input: I, func: TaskFn<I, O>) -> Self {
    Self { input, func }
  }

  pub fn input(&self) -> &I {
    &self.input
  }
}

/// A task paired with the slot index it was given at enqueue time.
pub(crate) struct QueuedTask<I, O> {
  pub(crate) index: usize,
  pub(crate) task: Task<I, O>,
}

impl<I, O> fmt::Debug for QueuedTask<I, O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueuedTask")
      .field("index", &self.index)
      .finish_non_exhaustive()
  }
}
