use crate::error::RunnerError;

use std::time::Duration;

/// Settings for a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
  /// Used in logs and completion events.
  pub name: String,
  /// Number of workers; must be at least 1.
  pub worker_count: usize,
  /// Deadline for the whole run, counted from `Runner::start`. `None` waits forever.
  pub timeout: Option<Duration>,
}

impl Default for RunnerConfig {
  fn default() -> Self {
    Self {
      name: "runner".to_string(),
      worker_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
      timeout: None,
    }
  }
}

impl RunnerConfig {
  pub fn new(worker_count: usize) -> Self {
    Self {
      worker_count,
      ..Self::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_worker_count(mut self, worker_count: usize) -> Self {
    self.worker_count = worker_count;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn validate(&self) -> Result<(), RunnerError> {
    if self.worker_count == 0 {
      return Err(RunnerError::InvalidWorkerCount(self.worker_count));
    }
    Ok(())
  }
}
