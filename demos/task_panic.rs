use bounded_runner::{run, RunnerError, Task};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Task Panic Example ---");

  let tasks = vec![
    Task::infallible(1u32, |x| async move { x * 10 }),
    Task::infallible(2u32, |x| async move {
      info!("Panicking Task: Starting...");
      tokio::time::sleep(Duration::from_millis(100)).await;
      info!("Panicking Task: About to panic!");
      if x == 2 {
        panic!("This task is designed to panic!");
      }
      x
    }),
    Task::infallible(3u32, |x| async move { x * 10 }),
  ];

  let report = run(tasks, 1, Duration::from_secs(2))
    .await
    .expect("Worker count is valid");

  for (index, result) in report.results().iter().enumerate() {
    match result {
      Ok(value) => info!("Task {} completed with {}", index, value),
      Err(RunnerError::TaskPanicked(message)) => {
        info!("Task {} correctly resulted in TaskPanicked: {}", index, message);
      }
      Err(e) => info!("Task {} resulted in unexpected error: {:?}", index, e),
    }
  }
  info!("--- Task Panic Example End ---");
}
