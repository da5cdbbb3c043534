use crate::cancel::CancelSignal;
use crate::error::RunnerError;
use crate::task::QueuedTask;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;

/// A FIFO, multi-producer, multi-consumer queue of tasks.
///
/// Producers go through a cloneable [`QueueProducer`]; every worker holds a
/// clone of the same [`QueueConsumer`]. The receiver sits behind an async mutex
/// so that exactly one worker waits on it at a time, which gives each task to
/// exactly one consumer.
pub(crate) struct TaskQueue;

impl TaskQueue {
  /// Creates the queue and splits it into its producer and consumer halves.
  pub(crate) fn new<I, O>() -> (QueueProducer<I, O>, QueueConsumer<I, O>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    (
      QueueProducer {
        tx: Arc::new(Mutex::new(Some(tx))),
        queued: queued.clone(),
      },
      QueueConsumer {
        rx: Arc::new(AsyncMutex::new(rx)),
        queued,
      },
    )
  }
}

/// The producer handle. Closing it from any clone closes it for all clones.
pub(crate) struct QueueProducer<I, O> {
  tx: Arc<Mutex<Option<UnboundedSender<QueuedTask<I, O>>>>>,
  queued: Arc<AtomicUsize>,
}

impl<I, O> Clone for QueueProducer<I, O> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      queued: self.queued.clone(),
    }
  }
}

impl<I, O> fmt::Debug for QueueProducer<I, O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("queued", &self.len())
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl<I, O> QueueProducer<I, O> {
  /// Appends a task to the back of the queue.
  ///
  /// Never waits: the queue is unbounded, the pool size is what bounds work.
  pub(crate) fn submit(&self, task: QueuedTask<I, O>) -> Result<(), RunnerError> {
    let guard = self.tx.lock();
    let tx = guard.as_ref().ok_or(RunnerError::QueueClosed)?;
    // Counted before the send so a fast consumer never drives the counter below zero.
    self.queued.fetch_add(1, Ordering::SeqCst);
    if tx.send(task).is_err() {
      self.queued.fetch_sub(1, Ordering::SeqCst);
      return Err(RunnerError::QueueClosed);
    }
    Ok(())
  }

  /// Stops accepting tasks. Consumers drain what is left, then see the end of
  /// the queue. Idempotent.
  pub(crate) fn close(&self) {
    self.tx.lock().take();
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.tx.lock().is_none()
  }

  /// Number of tasks waiting to be dequeued.
  pub(crate) fn len(&self) -> usize {
    self.queued.load(Ordering::SeqCst)
  }
}

/// The consumer handle, shared by all workers of a run.
pub(crate) struct QueueConsumer<I, O> {
  rx: Arc<AsyncMutex<UnboundedReceiver<QueuedTask<I, O>>>>,
  queued: Arc<AtomicUsize>,
}

impl<I, O> Clone for QueueConsumer<I, O> {
  fn clone(&self) -> Self {
    Self {
      rx: self.rx.clone(),
      queued: self.queued.clone(),
    }
  }
}

impl<I, O> fmt::Debug for QueueConsumer<I, O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConsumer")
      .field("queued", &self.queued.load(Ordering::SeqCst))
      .finish_non_exhaustive()
  }
}

impl<I, O> QueueConsumer<I, O> {
  /// Waits for the next task.
  ///
  /// Returns `None` when `cancel` fires or when the queue is closed and empty.
  /// If a task is ready and the signal has fired, cancellation wins and the task
  /// stays in the queue.
  pub(crate) async fn dequeue(&self, cancel: &CancelSignal) -> Option<QueuedTask<I, O>> {
    let next = tokio::select! {
      biased;
      _ = cancel.cancelled() => None,
      next = async { self.rx.lock().await.recv().await } => next,
    };
    if next.is_some() {
      self.queued.fetch_sub(1, Ordering::SeqCst);
    }
    next
  }
}
