use futures_stagehand::{BackgroundScheduler, SchedulerConfig, SchedulerError, ShutdownMode, TaskOutcome};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

// Helper to create a work body that sleeps, optionally fails, and flags completion.
fn create_work(
  task_label: &'static str,
  duration_ms: u64,
  should_fail: bool,
  completion_flag: Option<Arc<AtomicBool>>,
) -> impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static {
  async move {
    sleep(Duration::from_millis(duration_ms)).await;
    if should_fail {
      tracing::info!("Task {} failing as requested.", task_label);
      anyhow::bail!("task {} failed on purpose", task_label);
    }
    if let Some(flag) = completion_flag {
      flag.store(true, Ordering::SeqCst);
    }
    tracing::info!("Task {} completed successfully.", task_label);
    Ok(())
  }
}

// Helper to initialize tracing for tests (call once per test run, not per test function)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_stagehand=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn scheduler(name: &str, capacity: usize) -> Arc<BackgroundScheduler> {
  BackgroundScheduler::new(
    SchedulerConfig::new(name, capacity),
    tokio::runtime::Handle::current(),
  )
}

#[tokio::test]
async fn test_submit_returns_immediately_and_task_completes() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_submit_basic", 2);
  let done = Arc::new(AtomicBool::new(false));

  let started = Instant::now();
  let handle = scheduler.submit("report:1", create_work("1", 100, false, Some(done.clone())));
  assert!(started.elapsed() < Duration::from_millis(50), "submit must not wait for the work");
  assert_eq!(handle.name(), "report:1");
  assert!(!handle.is_finished());
  assert_eq!(scheduler.tracked_task_count(), 1);

  assert_eq!(handle.wait().await, TaskOutcome::Succeeded);
  assert!(done.load(Ordering::SeqCst));
  assert!(handle.is_finished());
  assert_eq!(scheduler.tracked_task_count(), 0);

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_capacity() {
  setup_tracing_for_test();
  let capacity = 3;
  let scheduler = scheduler("test_capacity_bound", capacity);
  let current = Arc::new(AtomicUsize::new(0));
  let max_observed = Arc::new(AtomicUsize::new(0));

  let durations: Vec<u64> = {
    let mut rng = rand::rng();
    (0..12).map(|_| rng.random_range(5..30)).collect()
  };

  let mut handles = Vec::new();
  for (i, duration_ms) in durations.into_iter().enumerate() {
    let current = current.clone();
    let max_observed = max_observed.clone();
    handles.push(scheduler.submit(format!("bounded:{i}"), async move {
      let now_running = current.fetch_add(1, Ordering::SeqCst) + 1;
      max_observed.fetch_max(now_running, Ordering::SeqCst);
      sleep(Duration::from_millis(duration_ms)).await;
      current.fetch_sub(1, Ordering::SeqCst);
      Ok(())
    }));
  }

  sleep(Duration::from_millis(3)).await;
  assert!(scheduler.running_task_count() <= capacity);

  for handle in handles {
    assert_eq!(handle.wait().await, TaskOutcome::Succeeded);
  }

  let max = max_observed.load(Ordering::SeqCst);
  assert!(max <= capacity, "observed {max} concurrent bodies with capacity {capacity}");
  assert!(max >= 2, "with 12 queued tasks the gate should have admitted more than one at a time");
  assert_eq!(scheduler.running_task_count(), 0);

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_bodies_start_in_submission_order_with_capacity_one() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_fifo_admission", 1);
  let start_log = Arc::new(parking_lot::Mutex::new(Vec::new()));

  let mut handles = Vec::new();
  for i in 0..5usize {
    let start_log = start_log.clone();
    handles.push(scheduler.submit(format!("fifo:{i}"), async move {
      start_log.lock().push((i, Instant::now()));
      // Later submissions finish faster; order must still follow submission.
      sleep(Duration::from_millis(50 - (i as u64 * 8))).await;
      Ok(())
    }));
  }

  sleep(Duration::from_millis(10)).await;
  assert_eq!(scheduler.running_task_count(), 1);
  assert_eq!(scheduler.tracked_task_count(), 5);

  for handle in handles {
    handle.wait().await;
  }

  let log = start_log.lock();
  let order: Vec<usize> = log.iter().map(|(i, _)| *i).collect();
  assert_eq!(order, vec![0, 1, 2, 3, 4], "Bodies should start in submission order.");
  assert!(log.windows(2).all(|pair| pair[0].1 <= pair[1].1));
  drop(log);

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_await_task_with_no_matching_task_returns_immediately() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_await_missing", 1);

  let started = Instant::now();
  let result = scheduler.await_task("does-not-exist", Duration::from_secs(5)).await;
  assert_eq!(result, Ok(()));
  assert!(started.elapsed() < Duration::from_millis(50));

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_await_task_returns_when_task_completes_in_time() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_await_completes", 1);
  let done = Arc::new(AtomicBool::new(false));

  scheduler.submit("export:42", create_work("export", 80, false, Some(done.clone())));
  let result = scheduler.await_task("export:42", Duration::from_secs(1)).await;

  assert_eq!(result, Ok(()));
  assert!(done.load(Ordering::SeqCst));
  assert!(scheduler.find_by_name("export:42").is_empty());

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_await_task_timeout_leaves_task_running() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_await_timeout", 1);
  let done = Arc::new(AtomicBool::new(false));

  let handle = scheduler.submit("slow", create_work("slow", 300, false, Some(done.clone())));
  let result = scheduler.await_task("slow", Duration::from_millis(50)).await;

  match result {
    Err(SchedulerError::Timeout { ref name, task_id, timeout }) => {
      assert_eq!(name, "slow");
      assert_eq!(task_id, handle.id());
      assert_eq!(timeout, Duration::from_millis(50));
    }
    ref other => panic!("Expected Timeout, got {:?}", other),
  }
  assert!(result.unwrap_err().is_timeout());

  // The timeout only stopped the wait.
  assert!(!handle.is_cancellation_requested());
  assert_eq!(scheduler.find_by_name("slow").len(), 1);

  assert_eq!(handle.wait().await, TaskOutcome::Succeeded);
  assert!(done.load(Ordering::SeqCst));
  assert!(scheduler.find_by_name("slow").is_empty());

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_second_task_waits_behind_first_at_capacity_one() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_serialized_scenario", 1);

  scheduler.submit("A", create_work("A", 100, false, None));
  scheduler.submit("B", create_work("B", 10, false, None));

  let started = Instant::now();
  let result = scheduler.await_task("B", Duration::from_secs(1)).await;
  let elapsed = started.elapsed();

  assert_eq!(result, Ok(()));
  assert!(
    elapsed >= Duration::from_millis(110),
    "B must wait for A before starting; waited only {:?}",
    elapsed
  );

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_await_task_applies_timeout_per_matching_task() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_per_task_timeout", 2);

  // A shared 150ms deadline would fail on the second task (done at ~200ms); a fresh
  // window per task starts when the first one finishes (~100ms) and covers it.
  scheduler.submit("dup", create_work("dup-1", 100, false, None));
  scheduler.submit("dup", create_work("dup-2", 200, false, None));
  assert_eq!(scheduler.find_by_name("dup").len(), 2);

  let result = scheduler.await_task("dup", Duration::from_millis(150)).await;
  assert_eq!(result, Ok(()));
  assert!(scheduler.find_by_name("dup").is_empty());

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_failed_work_is_contained() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_failure_contained", 1);

  let failing = scheduler.submit("flaky", create_work("flaky", 20, true, None));
  assert_eq!(scheduler.await_task("flaky", Duration::from_secs(1)).await, Ok(()));

  match failing.wait().await {
    TaskOutcome::Failed { message } => assert!(message.contains("failed on purpose"), "message: {message}"),
    other => panic!("Expected Failed, got {:?}", other),
  }
  assert!(scheduler.find_by_name("flaky").is_empty());

  // Scheduler keeps working afterwards.
  let next = scheduler.submit("after", create_work("after", 10, false, None));
  assert_eq!(next.wait().await, TaskOutcome::Succeeded);

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_panicking_work_is_contained_and_releases_permit() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_panic_contained", 1);

  let should_panic = true;
  let panicking = scheduler.submit("boom", async move {
    sleep(Duration::from_millis(10)).await;
    if should_panic {
      panic!("Task intentionally panicked!");
    }
    Ok(())
  });

  match panicking.wait().await {
    TaskOutcome::Panicked { message } => assert!(message.contains("intentionally panicked")),
    other => panic!("Expected Panicked, got {:?}", other),
  }
  assert!(scheduler.find_by_name("boom").is_empty());

  let next = scheduler.submit("after-panic", create_work("after-panic", 10, false, None));
  assert_eq!(next.wait().await, TaskOutcome::Succeeded);
  assert_eq!(scheduler.running_task_count(), 0);

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_cancel_running_task_via_handle() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_cancel_running", 1);
  let done = Arc::new(AtomicBool::new(false));

  let handle = scheduler.submit("long", create_work("long", 5000, false, Some(done.clone())));
  let queued_done = Arc::new(AtomicBool::new(false));
  let queued = scheduler.submit("next", create_work("next", 10, false, Some(queued_done.clone())));

  sleep(Duration::from_millis(50)).await;
  assert_eq!(scheduler.running_task_count(), 1);
  handle.cancel();

  assert_eq!(handle.wait().await, TaskOutcome::Cancelled);
  assert!(!done.load(Ordering::SeqCst));
  assert!(scheduler.find_by_name("long").is_empty());

  // The permit was released, so the queued task gets to run.
  assert_eq!(queued.wait().await, TaskOutcome::Succeeded);
  assert!(queued_done.load(Ordering::SeqCst));

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_cancel_queued_task_never_runs() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_cancel_queued", 1);
  let ran = Arc::new(AtomicBool::new(false));

  let blocker = scheduler.submit("blocker", create_work("blocker", 200, false, None));
  let queued = scheduler.submit("queued", create_work("queued", 10, false, Some(ran.clone())));

  sleep(Duration::from_millis(20)).await;
  queued.cancel();

  assert_eq!(queued.wait().await, TaskOutcome::Cancelled);
  assert!(scheduler.find_by_name("queued").is_empty());
  assert!(!blocker.is_finished(), "cancelling a queued task must not wait for the running one");

  assert_eq!(blocker.wait().await, TaskOutcome::Succeeded);
  assert!(!ran.load(Ordering::SeqCst), "Cancelled queued task should not have run.");

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_cancel_task_deep_in_queue_resolves_promptly() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_cancel_deep_queue", 1);
  let ran = Arc::new(AtomicBool::new(false));

  let blocker = scheduler.submit("blocker", create_work("blocker", 400, false, None));
  let second = scheduler.submit("second", create_work("second", 400, false, None));
  let third = scheduler.submit("third", create_work("third", 10, false, Some(ran.clone())));

  sleep(Duration::from_millis(20)).await;
  assert_eq!(scheduler.cancel_tasks_by_name("third"), 1);

  let cancelled_at = Instant::now();
  let outcome = tokio::time::timeout(Duration::from_millis(100), third.wait())
    .await
    .expect("a cancelled task must not wait for the tasks queued ahead of it");
  assert_eq!(outcome, TaskOutcome::Cancelled);
  assert!(cancelled_at.elapsed() < Duration::from_millis(100));
  assert!(scheduler.find_by_name("third").is_empty());
  assert!(scheduler.await_task("third", Duration::from_millis(50)).await.is_ok());
  assert!(!blocker.is_finished());
  assert!(!second.is_finished());

  assert_eq!(blocker.wait().await, TaskOutcome::Succeeded);
  assert_eq!(second.wait().await, TaskOutcome::Succeeded);
  assert!(!ran.load(Ordering::SeqCst), "Cancelled queued task should not have run.");
  assert_eq!(scheduler.tracked_task_count(), 0);

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_cancel_by_name() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_cancel_by_name", 3);

  let a1 = scheduler.submit("group_a", create_work("a1", 5000, false, None));
  let a2 = scheduler.submit("group_a", create_work("a2", 5000, false, None));
  let b_done = Arc::new(AtomicBool::new(false));
  let b = scheduler.submit("group_b", create_work("b", 100, false, Some(b_done.clone())));

  sleep(Duration::from_millis(20)).await;
  assert_eq!(scheduler.cancel_tasks_by_name("group_a"), 2);
  assert_eq!(scheduler.cancel_tasks_by_name("nobody"), 0);

  assert_eq!(a1.wait().await, TaskOutcome::Cancelled);
  assert_eq!(a2.wait().await, TaskOutcome::Cancelled);
  assert_eq!(b.wait().await, TaskOutcome::Succeeded);
  assert!(b_done.load(Ordering::SeqCst));

  scheduler.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_shutdown_graceful_drains_queued_and_running_tasks() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_shutdown_graceful", 1);
  let flags: Vec<Arc<AtomicBool>> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();

  let handles: Vec<_> = flags
    .iter()
    .enumerate()
    .map(|(i, flag)| scheduler.submit(format!("drain:{i}"), create_work("drain", 60, false, Some(flag.clone()))))
    .collect();

  sleep(Duration::from_millis(10)).await;
  scheduler.shutdown(ShutdownMode::Graceful).await;

  assert_eq!(scheduler.tracked_task_count(), 0);
  for (handle, flag) in handles.iter().zip(&flags) {
    assert_eq!(handle.outcome(), Some(TaskOutcome::Succeeded));
    assert!(flag.load(Ordering::SeqCst));
  }
  assert!(scheduler.is_shutting_down());
}

#[tokio::test]
async fn test_shutdown_forceful_cancels_running_and_queued_tasks() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_shutdown_forceful", 1);
  let running_done = Arc::new(AtomicBool::new(false));
  let queued_ran = Arc::new(AtomicBool::new(false));

  let running = scheduler.submit("running", create_work("running", 5000, false, Some(running_done.clone())));
  let queued = scheduler.submit("queued", create_work("queued", 10, false, Some(queued_ran.clone())));

  sleep(Duration::from_millis(30)).await;
  let started = Instant::now();
  scheduler.shutdown(ShutdownMode::ForcefulCancel).await;
  assert!(started.elapsed() < Duration::from_secs(2));

  assert_eq!(running.outcome(), Some(TaskOutcome::Cancelled));
  assert_eq!(queued.outcome(), Some(TaskOutcome::Cancelled));
  assert!(!running_done.load(Ordering::SeqCst));
  assert!(!queued_ran.load(Ordering::SeqCst));
  assert_eq!(scheduler.tracked_task_count(), 0);
}

#[tokio::test]
async fn test_submit_after_shutdown_is_cancelled_without_running() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_submit_after_shutdown", 1);
  scheduler.shutdown(ShutdownMode::Graceful).await;

  let ran = Arc::new(AtomicBool::new(false));
  let handle = scheduler.submit("late", create_work("late", 10, false, Some(ran.clone())));

  assert_eq!(handle.outcome(), Some(TaskOutcome::Cancelled));
  assert!(scheduler.find_by_name("late").is_empty());
  sleep(Duration::from_millis(50)).await;
  assert!(!ran.load(Ordering::SeqCst));

  // A second shutdown is harmless.
  scheduler.shutdown(ShutdownMode::ForcefulCancel).await;
}

#[tokio::test]
async fn test_drop_without_shutdown_lets_submitted_tasks_finish() {
  setup_tracing_for_test();
  let done = Arc::new(AtomicBool::new(false));

  let handle = {
    let scheduler = scheduler("test_drop_behavior", 1);
    scheduler.submit("orphan", create_work("orphan", 50, false, Some(done.clone())))
  };

  assert_eq!(handle.wait().await, TaskOutcome::Succeeded);
  assert!(done.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_zero_capacity_is_clamped() {
  setup_tracing_for_test();
  let scheduler = scheduler("test_zero_capacity", 0);
  assert_eq!(scheduler.capacity(), 1);
  assert_eq!(scheduler.name(), "test_zero_capacity");

  let handle = scheduler.submit("still-runs", create_work("still-runs", 10, false, None));
  assert_eq!(handle.wait().await, TaskOutcome::Succeeded);

  scheduler.shutdown(ShutdownMode::Graceful).await;
}
