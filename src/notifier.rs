use crate::task::{TaskName, TaskOutcome};

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, Instrument};

// --- Public Event Struct for Handlers ---

/// Delivered to every completion handler once per task, after the task has left the
/// scheduler's registry.
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub scheduler_name: Arc<String>,
  pub task_name: TaskName,
  pub outcome: TaskOutcome,
  pub completion_time: SystemTime,
}

type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

// --- CompletionNotifier Struct ---

pub(crate) struct CompletionNotifier {
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  queue_tx: mpsc::UnboundedSender<TaskCompletionInfo>,
  scheduler_name: Arc<String>,
  // Held so the worker is not detached silently; it ends once every sender is gone.
  _worker_join_handle: JoinHandle<()>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionNotifier")
      .field("scheduler_name", &self.scheduler_name)
      .field("handler_count", &self.handlers.read().len())
      .finish_non_exhaustive()
  }
}

impl CompletionNotifier {
  pub(crate) fn start(tokio_handle: &TokioHandle, scheduler_name: Arc<String>) -> Arc<Self> {
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let handlers: Arc<RwLock<Vec<CompletionHandler>>> = Arc::new(RwLock::new(Vec::new()));

    let worker_join_handle = tokio_handle.spawn(
      Self::run_notification_worker_loop(queue_rx, handlers.clone())
        .instrument(info_span!("notification_worker_loop", scheduler = %*scheduler_name)),
    );

    Arc::new(Self {
      handlers,
      queue_tx,
      scheduler_name,
      _worker_join_handle: worker_join_handle,
    })
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(scheduler = %*self.scheduler_name, "Notifier: Added new completion handler. Total handlers: {}", handlers_guard.len());
  }

  /// Queues a notification without suspending. Dropped when no handler is registered.
  pub(crate) fn notify(&self, info: TaskCompletionInfo) {
    if self.handlers.read().is_empty() {
      trace!(task_id = %info.task_id, "No completion handlers registered, dropping notification.");
      return;
    }
    if self.queue_tx.send(info).is_err() {
      debug!(scheduler = %*self.scheduler_name, "Notifier: worker is gone, notification dropped.");
    }
  }

  async fn run_notification_worker_loop(
    mut queue_rx: mpsc::UnboundedReceiver<TaskCompletionInfo>,
    handlers_list: Arc<RwLock<Vec<CompletionHandler>>>,
  ) {
    info!("Notification worker started.");

    while let Some(info) = queue_rx.recv().await {
      // Clone the list out so a handler may register further handlers without deadlocking.
      let handlers: Vec<CompletionHandler> = handlers_list.read().clone();
      debug!(task_id = %info.task_id, task_name = %info.task_name, "Dispatching notification to {} handlers.", handlers.len());

      for handler in handlers {
        let info_for_handler = info.clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(info_for_handler)));
        if result.is_err() {
          error!(
            "A completion handler panicked during execution. Scheduler: {}, Task ID: {}",
            info.scheduler_name, info.task_id
          );
        }
      }
    }

    info!("Notification worker stopped (all senders dropped).");
  }
}
