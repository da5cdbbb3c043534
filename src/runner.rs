use crate::cancel::{CancelReason, CancelSignal};
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::notifier::{CompletionNotifier, CompletionSender, TaskCompletionInfo, TaskCompletionStatus};
use crate::slots::{ResultSlots, TaskResult};
use crate::task::{QueuedTask, Task};
use crate::task_queue::{QueueConsumer, QueueProducer, TaskQueue};
use crate::worker::{run_worker, WorkerShared};

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_RUN_ID: AtomicU64 = AtomicU64::new(0);
}

/// Lifecycle of a run. `Completed`, `Cancelled` and `TimedOut` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
  /// Accepting tasks, no worker spawned yet.
  Idle,
  /// Workers are draining the queue.
  Running,
  /// Every submitted task produced an outcome.
  Completed,
  /// Cancelled manually before every task ran.
  Cancelled,
  /// The deadline elapsed before every task ran.
  TimedOut,
}

impl RunState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, RunState::Completed | RunState::Cancelled | RunState::TimedOut)
  }
}

/// What a finished run hands back: one outcome per submitted task, in
/// submission order, plus how the run ended.
#[derive(Debug)]
pub struct RunReport<O> {
  run_id: u64,
  name: Arc<String>,
  state: RunState,
  results: Vec<TaskResult<O>>,
  elapsed: Duration,
}

impl<O> RunReport<O> {
  pub fn run_id(&self) -> u64 {
    self.run_id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> RunState {
    self.state
  }

  /// Time between the start of the run and the moment its results were sealed.
  pub fn elapsed(&self) -> Duration {
    self.elapsed
  }

  pub fn results(&self) -> &[TaskResult<O>] {
    &self.results
  }

  pub fn into_results(self) -> Vec<TaskResult<O>> {
    self.results
  }

  /// The run-level error: `Timeout` for a timed out run, `Cancelled` for a
  /// manually cancelled one, `None` otherwise. Task errors are not included.
  pub fn error(&self) -> Option<RunnerError> {
    match self.state {
      RunState::TimedOut => Some(RunnerError::Timeout),
      RunState::Cancelled => Some(RunnerError::Cancelled),
      _ => None,
    }
  }

  /// Splits into the full result list and the run-level error.
  pub fn into_parts(self) -> (Vec<TaskResult<O>>, Option<RunnerError>) {
    let error = self.error();
    (self.results, error)
  }

  /// All outputs, or the run-level error, or the first task error.
  pub fn into_outputs(self) -> Result<Vec<O>, RunnerError> {
    if let Some(error) = self.error() {
      return Err(error);
    }
    self.results.into_iter().collect()
  }

  /// Number of tasks that ran to an outcome (success or task error).
  pub fn completed_count(&self) -> usize {
    self.results.iter().filter(|r| !matches!(r, Err(RunnerError::Cancelled))).count()
  }

  pub fn cancelled_count(&self) -> usize {
    self.results.len() - self.completed_count()
  }
}

/// Resolves once every worker has exited. Clones can be dropped freely, so an
/// abandoned `finish` leaves the join in place for the next one.
type WorkersDone = Shared<BoxFuture<'static, ()>>;

struct Lifecycle<O> {
  state: RunState,
  finishing: bool,
  started_at: Option<Instant>,
  deadline: Option<tokio::time::Instant>,
  deadline_timer: Option<JoinHandle<()>>,
  workers_done: Option<WorkersDone>,
  completions: Option<CompletionSender>,
  /// Workers outlived the deadline and may still hold completion senders.
  workers_detached: bool,
  /// Sealed report, parked until a `finish` call hands it out.
  report: Option<RunReport<O>>,
}

/// A bounded pool of workers that runs submitted tasks once each and collects
/// their outcomes in submission order.
///
/// A runner drives exactly one run: `Idle → Running → Completed | Cancelled | TimedOut`.
pub struct Runner<I: Send + 'static, O: Send + 'static> {
  run_id: u64,
  name: Arc<String>,
  config: RunnerConfig,
  tokio_handle: TokioHandle,
  producer: QueueProducer<I, O>,
  consumer: QueueConsumer<I, O>,
  cancel: CancelSignal,
  slots: Arc<ResultSlots<O>>,
  in_flight: Arc<DashMap<usize, usize>>,
  notifier: CompletionNotifier,
  lifecycle: Mutex<Lifecycle<O>>,
}

impl<I: Send + 'static, O: Send + 'static> Runner<I, O> {
  /// Creates an idle runner. Workers are spawned on `tokio_handle` by [`Runner::start`].
  pub fn new(config: RunnerConfig, tokio_handle: TokioHandle) -> Result<Arc<Self>, RunnerError> {
    config.validate()?;

    let run_id = NEXT_RUN_ID.fetch_add(1, AtomicOrdering::Relaxed);
    let name = Arc::new(config.name.clone());
    let (producer, consumer) = TaskQueue::new();
    let (notifier, completions) = CompletionNotifier::new(name.clone());

    debug!(run = %*name, %run_id, worker_count = config.worker_count, timeout = ?config.timeout, "Runner created.");

    Ok(Arc::new(Self {
      run_id,
      name,
      config,
      tokio_handle,
      producer,
      consumer,
      cancel: CancelSignal::new(),
      slots: Arc::new(ResultSlots::new()),
      in_flight: Arc::new(DashMap::new()),
      notifier,
      lifecycle: Mutex::new(Lifecycle {
        state: RunState::Idle,
        finishing: false,
        started_at: None,
        deadline: None,
        deadline_timer: None,
        workers_done: None,
        completions: Some(completions),
        workers_detached: false,
        report: None,
      }),
    }))
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn run_id(&self) -> u64 {
    self.run_id
  }

  pub fn worker_count(&self) -> usize {
    self.config.worker_count
  }

  pub fn state(&self) -> RunState {
    self.lifecycle.lock().state
  }

  /// Number of tasks submitted so far.
  pub fn submitted_task_count(&self) -> usize {
    self.slots.len()
  }

  /// Number of tasks waiting in the queue.
  pub fn queued_task_count(&self) -> usize {
    self.producer.len()
  }

  /// Number of tasks currently executing.
  pub fn in_flight_count(&self) -> usize {
    self.in_flight.len()
  }

  /// Indices of the tasks currently executing, ascending.
  pub fn in_flight_indices(&self) -> Vec<usize> {
    let mut indices: Vec<usize> = self.in_flight.iter().map(|entry| *entry.key()).collect();
    indices.sort_unstable();
    indices
  }

  /// A clone of the run's cancellation signal.
  pub fn cancel_signal(&self) -> CancelSignal {
    self.cancel.clone()
  }

  /// Registers a handler called once per task outcome. Register before
  /// [`Runner::start`] to see every event.
  pub fn on_task_complete(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  /// Queues a task and returns its submission index.
  ///
  /// # Errors
  /// `QueueClosed` once the run has been cancelled or `finish` has been called.
  pub fn submit(&self, task: Task<I, O>) -> Result<usize, RunnerError> {
    let lifecycle = self.lifecycle.lock();
    if lifecycle.finishing || lifecycle.state.is_terminal() || self.cancel.is_cancelled() {
      warn!(run = %*self.name, state = ?lifecycle.state, "Submit: run is shutting down or finished, task rejected.");
      return Err(RunnerError::QueueClosed);
    }

    let index = self.slots.reserve()?;
    if let Err(e) = self.producer.submit(QueuedTask { index, task }) {
      self.slots.release(index);
      error!(run = %*self.name, %index, "Submit: failed to enqueue task: {}", e);
      return Err(e);
    }

    trace!(run = %*self.name, %index, "Task queued.");
    Ok(index)
  }

  /// Spawns the workers and arms the deadline. Starting a running run is a no-op.
  ///
  /// # Errors
  /// `RunFinished` if the run is finishing or already finished.
  pub fn start(&self) -> Result<(), RunnerError> {
    let mut lifecycle = self.lifecycle.lock();
    let (state, finishing) = (lifecycle.state, lifecycle.finishing);
    match state {
      RunState::Idle if !finishing => {
        self.start_locked(&mut lifecycle);
        Ok(())
      }
      RunState::Running if !finishing => Ok(()),
      _ => Err(RunnerError::RunFinished),
    }
  }

  fn start_locked(&self, lifecycle: &mut Lifecycle<O>) {
    lifecycle.started_at = Some(Instant::now());
    if let Some(timeout) = self.config.timeout {
      match tokio::time::Instant::now().checked_add(timeout) {
        Some(deadline) => {
          lifecycle.deadline = Some(deadline);
          lifecycle.deadline_timer = Some(self.cancel.arm_deadline(timeout, &self.tokio_handle));
        }
        None => {
          debug!(run = %*self.name, ?timeout, "Timeout exceeds the clock range. Running without a deadline.");
        }
      }
    }

    self.notifier.start(&self.tokio_handle);

    let Some(completions) = lifecycle.completions.clone() else {
      // Only `finish` takes the sender, and it never leaves the run idle.
      error!(run = %*self.name, "Completion sender missing at start.");
      return;
    };
    let shared = WorkerShared {
      run_id: self.run_id,
      run_name: self.name.clone(),
      consumer: self.consumer.clone(),
      cancel: self.cancel.clone(),
      slots: self.slots.clone(),
      in_flight: self.in_flight.clone(),
      completions,
    };

    let workers: Vec<JoinHandle<()>> = (0..self.config.worker_count)
      .map(|worker_id| {
        self.tokio_handle.spawn(
          run_worker(worker_id, shared.clone())
            .instrument(info_span!("runner_worker", run = %*self.name, run_id = self.run_id, worker_id)),
        )
      })
      .collect();
    let run_name = self.name.clone();
    lifecycle.workers_done = Some(
      futures::future::join_all(workers)
        .map(move |joined| {
          for (worker_id, outcome) in joined.into_iter().enumerate() {
            if let Err(join_error) = outcome {
              error!(run = %*run_name, %worker_id, "Worker terminated abnormally: {:?}", join_error);
            }
          }
        })
        .boxed()
        .shared(),
    );
    lifecycle.state = RunState::Running;

    info!(
      run = %*self.name,
      worker_count = self.config.worker_count,
      queued = self.producer.len(),
      timeout = ?self.config.timeout,
      "Run started."
    );
  }

  /// Requests cancellation. Tasks already executing finish; nothing else is dequeued.
  pub fn cancel(&self) {
    if self.cancel.trigger(CancelReason::Manual) {
      info!(run = %*self.name, "Run cancellation requested.");
    } else {
      trace!(run = %*self.name, "Run cancellation requested again, already cancelled.");
    }
  }

  /// Closes the queue, waits for the run to end and returns its report.
  ///
  /// Starts the run first if it is still idle. Returns once every task has an
  /// outcome, once the workers have stopped after a cancellation, or at the
  /// deadline, whichever comes first. At the deadline, tasks still executing
  /// are left to finish in the background and their outcomes are discarded.
  ///
  /// Dropping the returned future before it completes is safe: the next call
  /// picks up where it left off.
  ///
  /// # Errors
  /// `RunFinished` if a previous call already returned the report.
  pub async fn finish(&self) -> Result<RunReport<O>, RunnerError> {
    let waiting = {
      let mut lifecycle = self.lifecycle.lock();
      if lifecycle.state.is_terminal() {
        if lifecycle.report.is_none() {
          return Err(RunnerError::RunFinished);
        }
        None
      } else {
        if lifecycle.state == RunState::Idle {
          self.start_locked(&mut lifecycle);
        }
        if !lifecycle.finishing {
          lifecycle.finishing = true;
          self.producer.close();
          info!(
            run = %*self.name,
            submitted = self.slots.len(),
            done = self.slots.filled(),
            "Queue closed. Waiting for workers."
          );
        }
        Some((lifecycle.workers_done.clone(), lifecycle.deadline))
      }
    };

    if let Some((workers_done, deadline)) = waiting {
      let timed_out = match (workers_done, deadline) {
        (Some(done), Some(at)) => tokio::time::timeout_at(at, done).await.is_err(),
        (Some(done), None) => {
          done.await;
          false
        }
        (None, _) => false,
      };
      self.seal_report(timed_out);
    }

    let detached = self.lifecycle.lock().workers_detached;
    // Detached workers may still hold completion senders; only wait when they are all gone.
    if !detached {
      self.notifier.await_shutdown().await;
    }

    self.lifecycle.lock().report.take().ok_or(RunnerError::RunFinished)
  }

  /// Seals the result slots and parks the report. Runs without awaiting, so
  /// the run is never left half-finished. A no-op if the run already ended.
  fn seal_report(&self, timed_out: bool) {
    let mut lifecycle = self.lifecycle.lock();
    if lifecycle.state.is_terminal() {
      trace!(run = %*self.name, "Run already sealed by a concurrent finish.");
      return;
    }

    if timed_out {
      self.cancel.trigger(CancelReason::Deadline);
      warn!(
        run = %*self.name,
        in_flight = ?self.in_flight_indices(),
        "Deadline elapsed with tasks unfinished. Returning partial results."
      );
    }
    if let Some(timer) = lifecycle.deadline_timer.take() {
      timer.abort();
    }
    lifecycle.workers_done = None;

    let Some((results, unfinished)) = self.slots.seal() else {
      error!(run = %*self.name, "Result slots sealed outside of finish.");
      return;
    };

    let state = if unfinished.is_empty() {
      RunState::Completed
    } else if timed_out || self.cancel.reason() == Some(CancelReason::Deadline) {
      RunState::TimedOut
    } else {
      RunState::Cancelled
    };

    if let Some(mut completions) = lifecycle.completions.take() {
      for &index in &unfinished {
        completions.try_send(TaskCompletionInfo {
          run_id: self.run_id,
          run_name: self.name.clone(),
          index,
          worker_id: None,
          status: TaskCompletionStatus::Cancelled,
          completion_time: SystemTime::now(),
        });
      }
    }

    let elapsed = lifecycle.started_at.map(|at| at.elapsed()).unwrap_or_default();
    lifecycle.state = state;
    lifecycle.workers_detached = timed_out;

    info!(
      run = %*self.name,
      ?state,
      total = results.len(),
      cancelled = unfinished.len(),
      ?elapsed,
      "Run finished."
    );

    lifecycle.report = Some(RunReport {
      run_id: self.run_id,
      name: self.name.clone(),
      state,
      results,
      elapsed,
    });
  }
}

impl<I: Send + 'static, O: Send + 'static> Drop for Runner<I, O> {
  fn drop(&mut self) {
    let state = self.lifecycle.get_mut().state;
    if !state.is_terminal() && !self.cancel.is_cancelled() {
      info!(run = %*self.name, ?state, "Runner dropped before finishing. Cancelling run.");
      self.cancel.trigger(CancelReason::Manual);
    }
    self.producer.close();
  }
}

/// Runs `tasks` on `worker_count` workers with a deadline of `timeout`.
///
/// Must be called from within a Tokio runtime. A timed out run still returns
/// `Ok`: the report holds every outcome and `RunReport::error` is `Timeout`.
///
/// # Errors
/// `InvalidWorkerCount` if `worker_count` is zero.
pub async fn run<I: Send + 'static, O: Send + 'static>(
  tasks: Vec<Task<I, O>>,
  worker_count: usize,
  timeout: Duration,
) -> Result<RunReport<O>, RunnerError> {
  let config = RunnerConfig::new(worker_count).with_name("run").with_timeout(timeout);
  let runner = Runner::new(config, TokioHandle::current())?;
  for task in tasks {
    runner.submit(task)?;
  }
  runner.finish().await
}
