//! A Tokio-based bounded concurrent task runner: a fixed pool of workers drains
//! a shared FIFO queue, outcomes come back in submission order, panics are
//! captured per task, and the run can be cancelled manually or by a deadline.

mod cancel;
mod config;
mod error;
mod notifier;
mod runner;
mod slots;
mod task;
mod task_queue;
mod worker;

pub use cancel::{CancelReason, CancelSignal};
pub use config::RunnerConfig;
pub use error::RunnerError;
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use runner::{run, RunReport, RunState, Runner};
pub use slots::TaskResult;
pub use task::{BoxError, Task, TaskContext, TaskFn, TaskFuture};
