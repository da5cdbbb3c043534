use bounded_runner::{run, BoxError, RunState, Runner, RunnerConfig, RunnerError, Task};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle as TokioHandle;
use tokio::time::sleep;

// Helper to build a task that sleeps, then returns `value`.
fn sleepy_task(value: u64, duration_ms: u64, completion_flag: Option<Arc<AtomicBool>>) -> Task<u64, u64> {
  Task::infallible(value, move |value| {
    let completion_flag = completion_flag.clone();
    async move {
      sleep(Duration::from_millis(duration_ms)).await;
      if let Some(flag) = completion_flag {
        flag.store(true, Ordering::SeqCst);
      }
      value
    }
  })
}

fn double(value: u64) -> Task<u64, u64> {
  Task::new(value, |x| async move { Ok(x * 2) })
}

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bounded_runner=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_doubles_in_order() {
  setup_tracing_for_test();
  let report = run(vec![double(1), double(2), double(3)], 2, Duration::from_secs(1))
    .await
    .unwrap();

  assert_eq!(report.state(), RunState::Completed);
  assert_eq!(report.error(), None);
  assert_eq!(report.into_outputs(), Ok(vec![2, 4, 6]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_results_follow_submission_order_not_completion_order() {
  setup_tracing_for_test();
  let mut rng = rand::rng();
  let tasks: Vec<Task<u64, u64>> = (0..24u64)
    .map(|i| sleepy_task(i * i, rng.random_range(1..40), None))
    .collect();

  let report = run(tasks, 4, Duration::from_secs(5)).await.unwrap();

  assert_eq!(report.state(), RunState::Completed);
  let outputs = report.into_outputs().unwrap();
  assert_eq!(outputs, (0..24u64).map(|i| i * i).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_errors_and_panics_are_isolated() {
  setup_tracing_for_test();
  let tasks = vec![
    double(1),
    Task::new(2, |_| async move { Err::<u64, BoxError>("bad input".into()) }),
    Task::infallible(3, |x: u64| async move {
      if x == 3 {
        panic!("task {} intentionally panicked", x);
      }
      x
    }),
    double(4),
  ];

  let report = run(tasks, 2, Duration::from_secs(1)).await.unwrap();

  assert_eq!(report.state(), RunState::Completed);
  assert_eq!(report.error(), None);
  let results = report.into_results();
  assert_eq!(results[0], Ok(2));
  assert_eq!(results[1], Err(RunnerError::TaskFailed("bad input".to_string())));
  assert_eq!(
    results[2],
    Err(RunnerError::TaskPanicked("task 3 intentionally panicked".to_string()))
  );
  assert!(results[2].as_ref().unwrap_err().is_task_error());
  assert_eq!(results[3], Ok(8));
}

#[tokio::test]
async fn test_empty_run_returns_immediately() {
  setup_tracing_for_test();
  let started = Instant::now();
  let report = run(Vec::<Task<u64, u64>>::new(), 3, Duration::from_secs(5)).await.unwrap();

  assert!(report.results().is_empty());
  assert_eq!(report.state(), RunState::Completed);
  assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_zero_workers_is_rejected() {
  setup_tracing_for_test();
  let result = run(vec![double(1)], 0, Duration::from_secs(1)).await;
  assert!(matches!(result, Err(RunnerError::InvalidWorkerCount(0))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_more_workers_than_tasks() {
  setup_tracing_for_test();
  let report = run(vec![double(5), double(6)], 16, Duration::from_secs(1)).await.unwrap();
  assert_eq!(report.into_outputs(), Ok(vec![10, 12]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_before_start_cancels_everything() {
  setup_tracing_for_test();
  let ran = Arc::new(AtomicUsize::new(0));
  let runner = Runner::new(RunnerConfig::new(2).with_name("cancel_before_start"), TokioHandle::current()).unwrap();

  for i in 0..5 {
    let ran = ran.clone();
    runner
      .submit(Task::infallible(i, move |x: u64| {
        ran.fetch_add(1, Ordering::SeqCst);
        async move { x }
      }))
      .unwrap();
  }
  runner.cancel();
  runner.cancel();

  let report = runner.finish().await.unwrap();
  assert_eq!(report.state(), RunState::Cancelled);
  assert_eq!(report.error(), Some(RunnerError::Cancelled));
  assert_eq!(report.cancelled_count(), 5);
  assert!(report.results().iter().all(|r| r == &Err(RunnerError::Cancelled)));
  assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_after_k_tasks_with_single_worker() {
  setup_tracing_for_test();
  const TOTAL: usize = 10;
  const K: usize = 4;
  let runner = Runner::new(RunnerConfig::new(1).with_name("cancel_after_k"), TokioHandle::current()).unwrap();

  for i in 0..TOTAL {
    runner
      .submit(Task::with_context(i, |x, ctx| async move {
        // The K-th task cancels its own run; it still completes.
        if ctx.index() == K - 1 {
          ctx.cancel_signal().cancel();
        }
        Ok(x + 100)
      }))
      .unwrap();
  }

  let report = runner.finish().await.unwrap();
  assert_eq!(report.state(), RunState::Cancelled);
  assert_eq!(report.completed_count(), K);
  assert_eq!(report.cancelled_count(), TOTAL - K);
  let results = report.into_results();
  for (i, result) in results.iter().enumerate() {
    if i < K {
      assert_eq!(result, &Ok(i + 100));
    } else {
      assert_eq!(result, &Err(RunnerError::Cancelled));
    }
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_mid_run_keeps_completed_results() {
  setup_tracing_for_test();
  let runner = Runner::new(RunnerConfig::new(3).with_name("cancel_mid_run"), TokioHandle::current()).unwrap();
  for i in 0..12u64 {
    runner.submit(sleepy_task(i, 50, None)).unwrap();
  }
  runner.start().unwrap();
  assert_eq!(runner.state(), RunState::Running);

  sleep(Duration::from_millis(120)).await;
  runner.cancel();
  assert!(matches!(runner.submit(sleepy_task(99, 1, None)), Err(RunnerError::QueueClosed)));

  let report = runner.finish().await.unwrap();
  assert_eq!(report.state(), RunState::Cancelled);
  assert_eq!(report.results().len(), 12);
  assert!(report.completed_count() > 0);
  assert!(report.cancelled_count() > 0);
  assert_eq!(report.completed_count() + report.cancelled_count(), 12);
  for (i, result) in report.results().iter().enumerate() {
    match result {
      Ok(value) => assert_eq!(*value, i as u64),
      Err(e) => assert_eq!(e, &RunnerError::Cancelled),
    }
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_worker_never_runs_two_tasks_at_once() {
  setup_tracing_for_test();
  let active = Arc::new(AtomicUsize::new(0));
  let max_active = Arc::new(AtomicUsize::new(0));

  let tasks: Vec<Task<u64, u64>> = (0..10u64)
    .map(|i| {
      let active = active.clone();
      let max_active = max_active.clone();
      Task::infallible(i, move |x| {
        let active = active.clone();
        let max_active = max_active.clone();
        async move {
          let now = active.fetch_add(1, Ordering::SeqCst) + 1;
          max_active.fetch_max(now, Ordering::SeqCst);
          sleep(Duration::from_millis(5)).await;
          active.fetch_sub(1, Ordering::SeqCst);
          x
        }
      })
    })
    .collect();

  let report = run(tasks, 1, Duration::from_secs(5)).await.unwrap();
  assert_eq!(report.state(), RunState::Completed);
  assert_eq!(max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_run_in_parallel_up_to_the_limit() {
  setup_tracing_for_test();
  let active = Arc::new(AtomicUsize::new(0));
  let max_active = Arc::new(AtomicUsize::new(0));

  let tasks: Vec<Task<u64, u64>> = (0..8u64)
    .map(|i| {
      let active = active.clone();
      let max_active = max_active.clone();
      Task::infallible(i, move |x| {
        let active = active.clone();
        let max_active = max_active.clone();
        async move {
          let now = active.fetch_add(1, Ordering::SeqCst) + 1;
          max_active.fetch_max(now, Ordering::SeqCst);
          sleep(Duration::from_millis(100)).await;
          active.fetch_sub(1, Ordering::SeqCst);
          x
        }
      })
    })
    .collect();

  let started = Instant::now();
  let report = run(tasks, 4, Duration::from_secs(5)).await.unwrap();
  assert_eq!(report.state(), RunState::Completed);
  assert_eq!(max_active.load(Ordering::SeqCst), 4);
  assert!(
    started.elapsed() < Duration::from_millis(700),
    "Eight 100ms tasks on four workers took {:?}",
    started.elapsed()
  );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_returns_partial_results_early() {
  setup_tracing_for_test();
  let slow_finished = Arc::new(AtomicBool::new(false));
  let tasks = vec![
    sleepy_task(1, 10, None),
    sleepy_task(2, 5_000, Some(slow_finished.clone())),
    sleepy_task(3, 5_000, None),
  ];

  let started = Instant::now();
  let report = run(tasks, 2, Duration::from_millis(300)).await.unwrap();
  let elapsed = started.elapsed();

  assert!(elapsed < Duration::from_secs(2), "Run blocked for {:?} past its deadline", elapsed);
  assert_eq!(report.state(), RunState::TimedOut);
  assert_eq!(report.error(), Some(RunnerError::Timeout));

  let (results, error) = report.into_parts();
  assert_eq!(error, Some(RunnerError::Timeout));
  assert_eq!(results.len(), 3);
  assert_eq!(results[0], Ok(1));
  assert_eq!(results[1], Err(RunnerError::Cancelled));
  assert_eq!(results[2], Err(RunnerError::Cancelled));
  assert!(!slow_finished.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generous_timeout_does_not_fire() {
  setup_tracing_for_test();
  let tasks: Vec<Task<u64, u64>> = (0..4u64).map(|i| sleepy_task(i, 20, None)).collect();
  let report = run(tasks, 2, Duration::from_secs(2)).await.unwrap();
  assert_eq!(report.state(), RunState::Completed);
  assert_eq!(report.into_outputs(), Ok(vec![0, 1, 2, 3]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unrepresentable_timeout_means_no_deadline() {
  setup_tracing_for_test();
  let report = run(vec![double(1), double(2), double(3)], 2, Duration::MAX).await.unwrap();
  assert_eq!(report.state(), RunState::Completed);
  assert_eq!(report.into_outputs(), Ok(vec![2, 4, 6]));

  let report = run(vec![double(4)], 1, Duration::from_secs(u64::MAX / 2)).await.unwrap();
  assert_eq!(report.into_outputs(), Ok(vec![8]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadline_passing_while_workers_idle_still_times_out() {
  setup_tracing_for_test();
  let runner = Runner::new(
    RunnerConfig::new(1)
      .with_name("idle_deadline")
      .with_timeout(Duration::from_millis(30)),
    TokioHandle::current(),
  )
  .unwrap();
  runner.submit(sleepy_task(1, 60, None)).unwrap();
  runner.submit(sleepy_task(2, 10, None)).unwrap();
  runner.start().unwrap();

  // The deadline fires during the first task; the worker finishes it, sees
  // the signal and exits, so `finish` finds every worker already gone.
  sleep(Duration::from_millis(200)).await;
  assert_eq!(runner.in_flight_count(), 0);

  let report = runner.finish().await.unwrap();
  assert_eq!(report.state(), RunState::TimedOut);
  assert_eq!(report.results().len(), 2);
  assert_eq!(report.results()[0], Ok(1));
  assert!(report.results()[1].as_ref().is_err_and(|e| e.is_cancelled()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_finish_can_be_resumed() {
  setup_tracing_for_test();
  let runner = Runner::new(RunnerConfig::new(1).with_name("resumed_finish"), TokioHandle::current()).unwrap();
  runner.submit(sleepy_task(7, 100, None)).unwrap();

  let first = tokio::time::timeout(Duration::from_millis(10), runner.finish()).await;
  assert!(first.is_err(), "finish should still be waiting on the task");
  assert!(matches!(runner.submit(double(1)), Err(RunnerError::QueueClosed)));

  sleep(Duration::from_millis(300)).await;
  assert_eq!(runner.state(), RunState::Running);

  let report = runner.finish().await.unwrap();
  assert_eq!(report.state(), RunState::Completed);
  assert_eq!(report.into_outputs(), Ok(vec![7]));
  assert_eq!(runner.state(), RunState::Completed);
  assert!(matches!(runner.finish().await, Err(RunnerError::RunFinished)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_finish_hands_out_one_report() {
  setup_tracing_for_test();
  let runner = Runner::new(RunnerConfig::new(2).with_name("concurrent_finish"), TokioHandle::current()).unwrap();
  for i in 0..4u64 {
    runner.submit(sleepy_task(i, 30, None)).unwrap();
  }

  let (a, b) = tokio::join!(runner.finish(), runner.finish());
  let (reports, errors): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(Result::is_ok);
  assert_eq!(reports.len(), 1);
  assert!(matches!(errors[0], Err(RunnerError::RunFinished)));
  let report = reports.into_iter().next().unwrap().unwrap();
  assert_eq!(report.into_outputs(), Ok(vec![0, 1, 2, 3]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tasks_can_race_work_against_the_cancellation_token() {
  setup_tracing_for_test();
  let runner = Runner::new(RunnerConfig::new(2).with_name("token_race"), TokioHandle::current()).unwrap();
  let task = Task::with_context(5u64, |x, ctx| async move {
    tokio::select! {
      _ = ctx.cancel_signal().token().cancelled() => Err::<u64, BoxError>("interrupted".into()),
      _ = sleep(Duration::from_secs(5)) => Ok(x),
    }
  });
  assert_eq!(*task.input(), 5);
  runner.submit(task).unwrap();
  runner.start().unwrap();

  sleep(Duration::from_millis(50)).await;
  runner.cancel();
  let report = runner.finish().await.unwrap();

  // The task had started, so its own outcome is kept.
  assert_eq!(report.state(), RunState::Completed);
  assert_eq!(report.results()[0], Err(RunnerError::TaskFailed("interrupted".to_string())));
  assert!(!report.results()[0].as_ref().is_err_and(|e| e.is_cancelled()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifecycle_is_single_use() {
  setup_tracing_for_test();
  let runner = Runner::new(RunnerConfig::new(2).with_name("single_use"), TokioHandle::current()).unwrap();
  assert_eq!(runner.state(), RunState::Idle);
  assert_eq!(runner.submit(double(1)), Ok(0));
  assert_eq!(runner.submit(double(2)), Ok(1));
  assert_eq!(runner.submitted_task_count(), 2);

  runner.start().unwrap();
  runner.start().unwrap();
  assert_eq!(runner.submit(double(3)), Ok(2));

  let report = runner.finish().await.unwrap();
  assert_eq!(report.into_outputs(), Ok(vec![2, 4, 6]));
  assert_eq!(runner.state(), RunState::Completed);

  assert!(matches!(runner.submit(double(4)), Err(RunnerError::QueueClosed)));
  assert!(matches!(runner.start(), Err(RunnerError::RunFinished)));
  assert!(matches!(runner.finish().await, Err(RunnerError::RunFinished)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_flight_and_queued_counts() {
  setup_tracing_for_test();
  let runner = Runner::new(RunnerConfig::new(1).with_name("counts"), TokioHandle::current()).unwrap();
  for i in 0..3u64 {
    runner.submit(sleepy_task(i, 150, None)).unwrap();
  }
  runner.start().unwrap();

  sleep(Duration::from_millis(50)).await;
  assert_eq!(runner.in_flight_count(), 1);
  assert_eq!(runner.in_flight_indices(), vec![0]);
  assert_eq!(runner.queued_task_count(), 2);

  runner.cancel();
  let report = runner.finish().await.unwrap();
  assert_eq!(report.completed_count(), 1);
  assert_eq!(report.cancelled_count(), 2);
  assert_eq!(runner.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drop_cancels_queued_work() {
  setup_tracing_for_test();
  let first_done = Arc::new(AtomicBool::new(false));
  let second_ran = Arc::new(AtomicBool::new(false));

  {
    let runner = Runner::new(RunnerConfig::new(1).with_name("drop_cleanup"), TokioHandle::current()).unwrap();
    runner.submit(sleepy_task(1, 100, Some(first_done.clone()))).unwrap();
    runner.submit(sleepy_task(2, 10, Some(second_ran.clone()))).unwrap();
    runner.start().unwrap();
    sleep(Duration::from_millis(20)).await;
  } // runner is dropped

  sleep(Duration::from_millis(300)).await;
  assert!(first_done.load(Ordering::SeqCst), "A started task runs to completion.");
  assert!(!second_ran.load(Ordering::SeqCst), "Queued task must not start after drop.");
}
