use crate::reporter::PendingCompletion;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

/// The caller-assigned name of a background task. Names are not required to be unique.
pub type TaskName = Arc<str>;

/// The type of future that the scheduler executes.
/// It must be `Send` and `'static`; a returned error is contained and reported, never propagated.
pub type BackgroundWork = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// The terminal state of a background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
  Succeeded,
  /// The work returned an error. `message` is the error with its full context chain.
  Failed { message: String },
  Panicked { message: String },
  /// Cancelled via its handle, by name, by a forceful shutdown, or never run because the
  /// scheduler was already shutting down.
  Cancelled,
}

impl TaskOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, TaskOutcome::Succeeded)
  }
}

/// What the work-running path produced. Matched exhaustively by the completion reporter.
#[derive(Debug)]
pub(crate) enum ExecutionResult {
  Completed,
  Failed(anyhow::Error),
  Panicked(String),
  Cancelled,
  /// Submitted after the scheduler stopped accepting work.
  Rejected,
  /// Dropped before reaching a terminal state, e.g. because the runtime shut down.
  Abandoned,
}

impl From<ExecutionResult> for TaskOutcome {
  fn from(result: ExecutionResult) -> Self {
    match result {
      ExecutionResult::Completed => TaskOutcome::Succeeded,
      ExecutionResult::Failed(err) => TaskOutcome::Failed {
        message: format!("{err:#}"),
      },
      ExecutionResult::Panicked(message) => TaskOutcome::Panicked { message },
      ExecutionResult::Cancelled | ExecutionResult::Rejected | ExecutionResult::Abandoned => TaskOutcome::Cancelled,
    }
  }
}

/// Internal representation of a task waiting in the submission queue.
pub(crate) struct QueuedTask {
  pub(crate) task_id: u64,
  pub(crate) work: BackgroundWork,
  pub(crate) token: CancellationToken,
  pub(crate) submitted_at: Instant,
  pub(crate) completion: PendingCompletion,
}

impl fmt::Debug for QueuedTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueuedTask")
      .field("task_id", &self.task_id)
      .field("name", &self.completion.name())
      .field("cancelled", &self.token.is_cancelled())
      .finish_non_exhaustive()
  }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
