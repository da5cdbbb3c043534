use thiserror::Error;

/// Errors produced by the runner, both per task and for the run as a whole.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
  #[error("Task returned an error: {0}")]
  TaskFailed(String),

  #[error("Task panicked during execution: {0}")]
  TaskPanicked(String),

  #[error("Task was cancelled before it could complete")]
  Cancelled,

  #[error("Run deadline elapsed before all tasks completed")]
  Timeout,

  #[error("Task queue is closed, the run is shutting down or already finished")]
  QueueClosed,

  #[error("Worker count must be at least 1, got {0}")]
  InvalidWorkerCount(usize),

  #[error("Run has already finished or is finishing, it cannot be started or finished again")]
  RunFinished,
}

impl RunnerError {
  /// Returns `true` for errors raised by the task itself (returned error or panic).
  pub fn is_task_error(&self) -> bool {
    matches!(self, RunnerError::TaskFailed(_) | RunnerError::TaskPanicked(_))
  }

  /// Returns `true` if the task never produced an outcome because the run stopped.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, RunnerError::Cancelled)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_task_error_family() {
    assert!(RunnerError::TaskFailed("boom".into()).is_task_error());
    assert!(RunnerError::TaskPanicked("boom".into()).is_task_error());
    assert!(!RunnerError::Cancelled.is_task_error());
    assert!(!RunnerError::Timeout.is_task_error());
    assert!(RunnerError::Cancelled.is_cancelled());
  }

  #[test]
  fn test_display_carries_message() {
    let err = RunnerError::TaskFailed("disk full".into());
    assert_eq!(err.to_string(), "Task returned an error: disk full");
    assert_eq!(
      RunnerError::InvalidWorkerCount(0).to_string(),
      "Worker count must be at least 1, got 0"
    );
  }
}
