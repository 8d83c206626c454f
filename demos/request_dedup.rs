use futures_stagehand::{BackgroundScheduler, SchedulerConfig, ShutdownMode, TaskCompletionInfo};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

// Stand-in for the status table a web application keeps for its own jobs.
type StatusTable = Arc<Mutex<HashMap<String, String>>>;

async fn render_report(report_id: u32) -> anyhow::Result<()> {
  info!("Rendering report {} (takes ~300ms)", report_id);
  tokio::time::sleep(Duration::from_millis(300)).await;
  if report_id == 13 {
    anyhow::bail!("template for report {} is missing", report_id);
  }
  Ok(())
}

// What a request handler would do: start the job unless one with the same name is in flight,
// in which case wait briefly for it instead.
async fn handle_request(scheduler: &BackgroundScheduler, report_id: u32) {
  let task_name = format!("report:{report_id}");
  if scheduler.find_by_name(&task_name).is_empty() {
    info!("Request for {}: starting background job.", task_name);
    scheduler.submit(task_name, render_report(report_id));
  } else {
    info!("Request for {}: job already running, waiting up to 1s.", task_name);
    match scheduler.await_task(&task_name, Duration::from_secs(1)).await {
      Ok(()) => info!("Request for {}: in-flight job finished.", task_name),
      Err(e) => info!("Request for {}: gave up waiting: {}", task_name, e),
    }
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Request De-duplication Example ---");

  let config = SchedulerConfig::from_env()
    .unwrap_or_default()
    .with_name("reports");
  let scheduler = BackgroundScheduler::new(config, Handle::current());

  let statuses: StatusTable = Arc::new(Mutex::new(HashMap::new()));
  let statuses_for_handler = statuses.clone();
  scheduler.on_completion(move |info: TaskCompletionInfo| {
    statuses_for_handler
      .lock()
      .unwrap()
      .insert(info.task_name.to_string(), format!("{:?}", info.outcome));
  });

  handle_request(&scheduler, 7).await;
  handle_request(&scheduler, 13).await;
  handle_request(&scheduler, 7).await;

  scheduler.shutdown(ShutdownMode::Graceful).await;
  // Give the notification worker a moment to deliver the last completion.
  tokio::time::sleep(Duration::from_millis(50)).await;

  for (name, status) in statuses.lock().unwrap().iter() {
    info!("{} => {}", name, status);
  }
  info!("--- Request De-duplication Example End ---");
}
