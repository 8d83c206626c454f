use crate::task::{TaskName, TaskOutcome};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing;

/// A handle to a background task tracked by the `BackgroundScheduler`.
///
/// Handles are cheap to clone; the scheduler's task registry holds one clone per in-flight
/// task and `submit` hands another to the caller. Any clone can query completion, wait
/// for the terminal outcome, or request cancellation.
#[derive(Debug, Clone)]
pub struct TaskHandle {
  pub(crate) task_id: u64,
  pub(crate) name: TaskName,
  pub(crate) cancellation_token: CancellationToken,
  pub(crate) outcome_rx: watch::Receiver<Option<TaskOutcome>>,
}

impl TaskHandle {
  pub(crate) fn new(
    task_id: u64,
    name: TaskName,
    cancellation_token: CancellationToken,
    outcome_rx: watch::Receiver<Option<TaskOutcome>>,
  ) -> Self {
    Self {
      task_id,
      name,
      cancellation_token,
      outcome_rx,
    }
  }

  /// Returns the scheduler-unique ID of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Returns the caller-assigned name of this task.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Checks if cancellation has been requested for this task.
  pub fn is_cancellation_requested(&self) -> bool {
    self.cancellation_token.is_cancelled()
  }

  /// Requests cancellation of this task.
  ///
  /// A task still waiting for admission never runs. A running task is dropped at its next
  /// suspension point, releasing its admission permit.
  pub fn cancel(&self) {
    tracing::debug!(task_id = %self.task_id, task_name = %self.name, "TaskHandle: Cancellation requested.");
    self.cancellation_token.cancel();
  }

  /// Returns `true` once the task has reached a terminal state.
  pub fn is_finished(&self) -> bool {
    self.outcome_rx.borrow().is_some()
  }

  /// Returns the terminal outcome, or `None` while the task is queued or running.
  pub fn outcome(&self) -> Option<TaskOutcome> {
    self.outcome_rx.borrow().clone()
  }

  /// Waits until the task reaches a terminal state and returns its outcome.
  ///
  /// Never fails: a task that disappears without reporting (for example because the
  /// runtime was shut down underneath it) is reported as [`TaskOutcome::Cancelled`].
  pub async fn wait(&self) -> TaskOutcome {
    let mut outcome_rx = self.outcome_rx.clone();
    let observed = outcome_rx.wait_for(Option::is_some).await.map(|state| (*state).clone());
    match observed {
      Ok(Some(outcome)) => outcome,
      Ok(None) | Err(_) => {
        tracing::warn!(task_id = %self.task_id, task_name = %self.name, "Outcome channel closed before the task reported; treating as cancelled.");
        TaskOutcome::Cancelled
      }
    }
  }
}
