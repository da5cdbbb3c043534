use bounded_runner::{run, Task};
use std::time::Duration;
use tracing::info;

async fn square_slowly(id: u64, delay_ms: u64) -> u64 {
  info!("Task {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  id * id
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Basic Run Example ---");

  let tasks: Vec<Task<u64, u64>> = (0..6)
    .map(|i| {
      // Later tasks finish first; results still come back in submission order.
      let delay_ms = 600 - i * 100;
      Task::infallible(i, move |id| square_slowly(id, delay_ms))
    })
    .collect();

  let report = match run(tasks, 2, Duration::from_secs(5)).await {
    Ok(report) => report,
    Err(e) => {
      tracing::error!("Run could not start: {}", e);
      return;
    }
  };

  info!("Run finished in {:?} with state {:?}", report.elapsed(), report.state());
  for (index, result) in report.results().iter().enumerate() {
    match result {
      Ok(value) => info!("Result for task {}: {}", index, value),
      Err(e) => info!("Error for task {}: {}", index, e),
    }
  }
  info!("--- Basic Run Example End ---");
}
