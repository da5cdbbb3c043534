use bounded_runner::{Runner, RunnerConfig, Task};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

fn long_task(id: u64) -> Task<u64, u64> {
  Task::with_context(id, |id, ctx| async move {
    // Check the run's signal between steps so cancellation is noticed early.
    for step in 0..10 {
      if ctx.is_cancelled() {
        info!("Task {} stopping early at step {}", id, step);
        return Ok(step);
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(10)
  })
}

fn waiting_task(id: u64) -> Task<u64, u64> {
  Task::with_context(id, |id, ctx| async move {
    // Or wait on the token directly and race it against the work.
    tokio::select! {
      _ = ctx.cancel_signal().token().cancelled() => {
        info!("Task {} interrupted while waiting", id);
        Ok(0)
      }
      _ = tokio::time::sleep(Duration::from_millis(800)) => Ok(id),
    }
  })
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();
  info!("--- Cancellation Example ---");

  let config = RunnerConfig::new(2)
    .with_name("cancellation_demo")
    .with_timeout(Duration::from_secs(10));
  let runner = Runner::new(config, Handle::current()).expect("Worker count is valid");
  runner.on_task_complete(|event| info!("Task {} finished: {:?}", event.index, event.status));

  for id in 0..6 {
    let task = if id % 2 == 0 { long_task(id) } else { waiting_task(id) };
    info!("Submitting task for input {}", task.input());
    runner.submit(task).expect("Run is accepting tasks");
  }
  runner.start().expect("Run is idle");

  tokio::time::sleep(Duration::from_millis(200)).await;
  info!("Cancelling run with {} tasks in flight", runner.in_flight_count());
  runner.cancel();

  let report = runner.finish().await.expect("finish is called once");
  info!(
    "Run ended as {:?}: {} completed, {} cancelled",
    report.state(),
    report.completed_count(),
    report.cancelled_count()
  );
  for (index, result) in report.results().iter().enumerate() {
    match result {
      Ok(value) => info!("Task {} returned {}", index, value),
      Err(e) if e.is_cancelled() => info!("Task {} never started", index),
      Err(e) => info!("Task {} failed: {}", index, e),
    }
  }
  info!("--- Cancellation Example End ---");
}
