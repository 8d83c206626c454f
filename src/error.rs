use std::time::Duration;

use thiserror::Error;

/// Errors that can be surfaced by the `futures_stagehand` scheduler.
///
/// Failures inside submitted work are never reported through this type; they are
/// contained at the scheduler boundary and observable only through logs, the task's
/// [`TaskOutcome`](crate::TaskOutcome) and completion handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
  #[error("Timed out after {timeout:?} waiting for background task '{name}' (id: {task_id})")]
  Timeout {
    name: String,
    task_id: u64,
    timeout: Duration,
  },

  #[error("Invalid scheduler configuration: {0}")]
  InvalidConfig(String),
}

impl SchedulerError {
  /// Returns `true` if this error is a [`SchedulerError::Timeout`].
  pub fn is_timeout(&self) -> bool {
    matches!(self, SchedulerError::Timeout { .. })
  }
}
