use crate::cancel::CancelSignal;
use crate::error::RunnerError;
use crate::notifier::{CompletionSender, TaskCompletionInfo, TaskCompletionStatus};
use crate::slots::{ResultSlots, TaskResult};
use crate::task::{QueuedTask, TaskContext};
use crate::task_queue::QueueConsumer;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, error, info_span, trace, warn, Instrument};

/// Everything one worker needs. Each worker gets its own clone.
pub(crate) struct WorkerShared<I, O> {
  pub(crate) run_id: u64,
  pub(crate) run_name: Arc<String>,
  pub(crate) consumer: QueueConsumer<I, O>,
  pub(crate) cancel: CancelSignal,
  pub(crate) slots: Arc<ResultSlots<O>>,
  /// Index of each executing task, mapped to the worker running it.
  pub(crate) in_flight: Arc<DashMap<usize, usize>>,
  pub(crate) completions: CompletionSender,
}

impl<I, O> Clone for WorkerShared<I, O> {
  fn clone(&self) -> Self {
    Self {
      run_id: self.run_id,
      run_name: self.run_name.clone(),
      consumer: self.consumer.clone(),
      cancel: self.cancel.clone(),
      slots: self.slots.clone(),
      in_flight: self.in_flight.clone(),
      completions: self.completions.clone(),
    }
  }
}

/// Dequeue, execute, record; until the queue runs dry or the run is cancelled.
pub(crate) async fn run_worker<I: Send + 'static, O: Send + 'static>(worker_id: usize, mut shared: WorkerShared<I, O>) {
  trace!("Worker started.");
  let mut executed = 0usize;

  loop {
    if shared.cancel.is_cancelled() {
      debug!(reason = ?shared.cancel.reason(), "Cancellation observed before dequeue. Worker exiting.");
      break;
    }

    let Some(queued) = shared.consumer.dequeue(&shared.cancel).await else {
      trace!("Queue closed and drained, or run cancelled while waiting. Worker exiting.");
      break;
    };

    let index = queued.index;
    shared.in_flight.insert(index, worker_id);
    let started = Instant::now();

    let outcome = execute(worker_id, queued, &shared.cancel)
      .instrument(info_span!("task", %index))
      .await;

    shared.in_flight.remove(&index);
    executed += 1;

    let status = TaskCompletionStatus::from(&outcome);
    debug!(%index, ?status, elapsed = ?started.elapsed(), "Task finished.");

    if !shared.slots.fill(index, outcome) {
      warn!(%index, "Result slots already sealed (run timed out). Late outcome discarded.");
      continue;
    }

    shared
      .completions
      .send(TaskCompletionInfo {
        run_id: shared.run_id,
        run_name: shared.run_name.clone(),
        index,
        worker_id: Some(worker_id),
        status,
        completion_time: SystemTime::now(),
      })
      .await;
  }

  trace!(%executed, "Worker stopped.");
}

/// Runs one task, turning a returned error or a panic into a task-level error.
async fn execute<I, O>(worker_id: usize, queued: QueuedTask<I, O>, cancel: &CancelSignal) -> TaskResult<O> {
  let QueuedTask { index, task } = queued;
  let ctx = TaskContext {
    index,
    worker_id,
    cancel: cancel.clone(),
  };

  // The function itself may panic before it hands back a future.
  let func = task.func;
  let input = task.input;
  let future = match std::panic::catch_unwind(AssertUnwindSafe(move || func(input, ctx))) {
    Ok(future) => future,
    Err(payload) => return Err(panicked(index, payload)),
  };

  match AssertUnwindSafe(future).catch_unwind().await {
    Ok(Ok(output)) => {
      trace!(%index, "Task executed successfully.");
      Ok(output)
    }
    Ok(Err(task_error)) => {
      debug!(%index, error = %task_error, "Task returned an error.");
      Err(RunnerError::TaskFailed(task_error.to_string()))
    }
    Err(payload) => Err(panicked(index, payload)),
  }
}

fn panicked(index: usize, payload: Box<dyn Any + Send>) -> RunnerError {
  let message = panic_message(payload.as_ref());
  error!(%index, panic = %message, "Task panicked during execution.");
  RunnerError::TaskPanicked(message)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
