use crate::error::RunnerError;

use fibre::mpsc::{self, UnboundedAsyncReceiver, UnboundedAsyncSender};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Success,
  Failed,
  Panicked,
  Cancelled,
}

impl<O> From<&Result<O, RunnerError>> for TaskCompletionStatus {
  fn from(result: &Result<O, RunnerError>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Success,
      Err(RunnerError::TaskPanicked(_)) => TaskCompletionStatus::Panicked,
      Err(RunnerError::Cancelled) | Err(RunnerError::Timeout) => TaskCompletionStatus::Cancelled,
      Err(_) => TaskCompletionStatus::Failed,
    }
  }
}

/// Delivered to completion handlers once per task.
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub run_id: u64,
  pub run_name: Arc<String>,
  pub index: usize,
  /// `None` for tasks that were cancelled while still queued.
  pub worker_id: Option<usize>,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

pub(crate) type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

/// Sends completion events to the notification loop. Cheap to clone; the loop
/// stops once every sender is dropped.
#[derive(Clone)]
pub(crate) struct CompletionSender {
  tx: UnboundedAsyncSender<TaskCompletionInfo>,
}

impl fmt::Debug for CompletionSender {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionSender").finish_non_exhaustive()
  }
}

impl CompletionSender {
  pub(crate) async fn send(&mut self, info: TaskCompletionInfo) {
    let index = info.index;
    if self.tx.send(info).await.is_err() {
      trace!(%index, "Completion event dropped, notification loop already gone.");
    }
  }

  /// Like [`CompletionSender::send`] but never yields. The channel is
  /// unbounded, so this only fails once the loop is gone.
  pub(crate) fn try_send(&mut self, info: TaskCompletionInfo) {
    let index = info.index;
    if self.tx.try_send(info).is_err() {
      trace!(%index, "Completion event dropped, notification loop already gone.");
    }
  }
}

/// Fans completion events out to the registered handlers.
pub(crate) struct CompletionNotifier {
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  rx: Mutex<Option<UnboundedAsyncReceiver<TaskCompletionInfo>>>,
  worker_join_handle: Mutex<Option<JoinHandle<()>>>,
  run_name: Arc<String>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionNotifier")
      .field("handler_count", &self.handlers.read().len())
      .field("started", &self.rx.lock().is_none())
      .field("run_name", &self.run_name)
      .finish()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(run_name: Arc<String>) -> (Self, CompletionSender) {
    let (tx, rx) = mpsc::unbounded_async();
    let notifier = Self {
      handlers: Arc::new(RwLock::new(Vec::new())),
      rx: Mutex::new(Some(rx)),
      worker_join_handle: Mutex::new(None),
      run_name,
    };
    (notifier, CompletionSender { tx })
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    let mut handlers = self.handlers.write();
    handlers.push(Arc::new(handler));
    debug!(run = %*self.run_name, "Added completion handler. Total handlers: {}", handlers.len());
  }

  /// Spawns the notification loop. Only the first call has an effect.
  pub(crate) fn start(&self, tokio_handle: &TokioHandle) {
    let Some(rx) = self.rx.lock().take() else {
      trace!(run = %*self.run_name, "Notification loop already started.");
      return;
    };
    let handle = tokio_handle.spawn(
      Self::run_notification_loop(rx, self.handlers.clone())
        .instrument(info_span!("notification_loop", run = %*self.run_name)),
    );
    *self.worker_join_handle.lock() = Some(handle);
  }

  async fn run_notification_loop(mut rx: UnboundedAsyncReceiver<TaskCompletionInfo>, handlers: Arc<RwLock<Vec<CompletionHandler>>>) {
    trace!("Notification loop started.");
    loop {
      match rx.recv().await {
        Ok(info) => Self::dispatch(&handlers, info),
        Err(_) => {
          trace!("All completion senders dropped. Notification loop stopping.");
          break;
        }
      }
    }
  }

  fn dispatch(handlers: &RwLock<Vec<CompletionHandler>>, info: TaskCompletionInfo) {
    // Snapshot so a handler can register another handler without deadlocking.
    let snapshot: Vec<CompletionHandler> = handlers.read().clone();
    if snapshot.is_empty() {
      trace!(index = %info.index, "No completion handlers registered, dropping notification.");
      return;
    }
    for handler in snapshot {
      let info = info.clone();
      let index = info.index;
      let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(info)));
      if outcome.is_err() {
        error!(%index, "A completion handler panicked.");
      }
    }
  }

  /// Waits for the notification loop to drain. Only meaningful once every
  /// [`CompletionSender`] has been dropped.
  pub(crate) async fn await_shutdown(&self) {
    let handle = self.worker_join_handle.lock().take();
    if let Some(handle) = handle {
      if let Err(e) = handle.await {
        error!(run = %*self.run_name, "Error joining notification loop: {:?}", e);
      } else {
        info!(run = %*self.run_name, "Notification loop drained.");
      }
    }
  }
}
