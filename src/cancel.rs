use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Why a run's cancellation signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
  /// Triggered explicitly through [`CancelSignal::cancel`] or `Runner::cancel`.
  Manual,
  /// Triggered by the deadline armed with [`CancelSignal::arm_deadline`].
  Deadline,
}

/// A single-shot broadcast shared by every worker of a run.
///
/// Clones observe the same signal. The first trigger wins and records its
/// [`CancelReason`]; later triggers are no-ops.
#[derive(Debug, Clone)]
pub struct CancelSignal {
  token: CancellationToken,
  reason: Arc<OnceLock<CancelReason>>,
}

impl Default for CancelSignal {
  fn default() -> Self {
    Self::new()
  }
}

impl CancelSignal {
  pub fn new() -> Self {
    Self {
      token: CancellationToken::new(),
      reason: Arc::new(OnceLock::new()),
    }
  }

  /// Creates a signal that fires on its own after `timeout` unless triggered first.
  pub fn with_deadline(timeout: Duration, tokio_handle: &TokioHandle) -> Self {
    let signal = Self::new();
    // The timer task ends as soon as the signal fires, so the handle can be dropped.
    drop(signal.arm_deadline(timeout, tokio_handle));
    signal
  }

  /// Spawns a timer that triggers this signal with [`CancelReason::Deadline`].
  pub(crate) fn arm_deadline(&self, timeout: Duration, tokio_handle: &TokioHandle) -> JoinHandle<()> {
    let signal = self.clone();
    tokio_handle.spawn(async move {
      tokio::select! {
        biased;
        _ = signal.token.cancelled() => {
          trace!("Deadline timer stopped, signal already fired.");
        }
        _ = tokio::time::sleep(timeout) => {
          if signal.trigger(CancelReason::Deadline) {
            debug!(?timeout, "Deadline elapsed, cancellation triggered.");
          }
        }
      }
    })
  }

  /// Triggers manual cancellation. Idempotent.
  pub fn cancel(&self) {
    self.trigger(CancelReason::Manual);
  }

  /// Fires the signal with `reason`. Returns `false` if it had already fired.
  pub(crate) fn trigger(&self, reason: CancelReason) -> bool {
    let first = self.reason.set(reason).is_ok();
    if first {
      self.token.cancel();
    }
    first
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// The reason recorded by the first trigger, if any.
  pub fn reason(&self) -> Option<CancelReason> {
    self.reason.get().copied()
  }

  /// Completes once the signal fires. Completes immediately if it already has.
  pub async fn cancelled(&self) {
    self.token.cancelled().await
  }

  /// The underlying token, for tasks that want to `select!` on it directly.
  pub fn token(&self) -> &CancellationToken {
    &self.token
  }
}
