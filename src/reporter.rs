use crate::notifier::{CompletionNotifier, TaskCompletionInfo};
use crate::registry::TaskRegistry;
use crate::task::{ExecutionResult, TaskName, TaskOutcome};

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// The completion path shared by the submit, dispatch and execution stages.
#[derive(Debug, Clone)]
pub(crate) struct CompletionReporter {
  scheduler_name: Arc<String>,
  registry: Arc<TaskRegistry>,
  notifier: Arc<CompletionNotifier>,
}

impl CompletionReporter {
  pub(crate) fn new(scheduler_name: Arc<String>, registry: Arc<TaskRegistry>, notifier: Arc<CompletionNotifier>) -> Self {
    Self {
      scheduler_name,
      registry,
      notifier,
    }
  }

  /// Unregisters, logs, notifies and finally publishes the outcome, in that order:
  /// anyone woken by the outcome must already be unable to find the task by name.
  fn complete(&self, task_id: u64, task_name: &TaskName, outcome_tx: &watch::Sender<Option<TaskOutcome>>, result: ExecutionResult) {
    let was_tracked = self.registry.unregister(task_id);
    self.report(task_id, task_name, &result);

    let outcome = TaskOutcome::from(result);
    self.notifier.notify(TaskCompletionInfo {
      task_id,
      scheduler_name: self.scheduler_name.clone(),
      task_name: task_name.clone(),
      outcome: outcome.clone(),
      completion_time: SystemTime::now(),
    });
    outcome_tx.send_replace(Some(outcome));

    debug!(
      scheduler = %*self.scheduler_name,
      %task_id,
      %task_name,
      was_tracked,
      "Background task finished processing, removed from registry."
    );
  }

  fn report(&self, task_id: u64, task_name: &TaskName, result: &ExecutionResult) {
    let scheduler = &*self.scheduler_name;
    match result {
      ExecutionResult::Completed => {
        debug!(%scheduler, %task_id, %task_name, "Background task completed successfully.");
      }
      ExecutionResult::Failed(err) => {
        warn!(%scheduler, %task_id, %task_name, error = ?err, "Background task failed.");
      }
      ExecutionResult::Panicked(message) => {
        error!(%scheduler, %task_id, %task_name, panic = %message, "Background task panicked during execution.");
      }
      ExecutionResult::Cancelled => {
        warn!(%scheduler, %task_id, %task_name, "Background task was cancelled.");
      }
      ExecutionResult::Rejected => {
        warn!(%scheduler, %task_id, %task_name, "Background task rejected: scheduler is shutting down. It will not run.");
      }
      ExecutionResult::Abandoned => {
        warn!(%scheduler, %task_id, %task_name, "Background task was dropped before completing (runtime shutting down?).");
      }
    }
  }
}

/// Travels with a task from submission to its terminal state and completes it exactly once.
///
/// If dropped without an explicit [`CompletionGuard::complete`], the task is completed as
/// abandoned.
#[derive(Debug)]
pub(crate) struct CompletionGuard {
  reporter: CompletionReporter,
  task_id: u64,
  name: TaskName,
  outcome_tx: watch::Sender<Option<TaskOutcome>>,
  completed: bool,
}

impl CompletionGuard {
  pub(crate) fn new(reporter: CompletionReporter, task_id: u64, name: TaskName, outcome_tx: watch::Sender<Option<TaskOutcome>>) -> Self {
    Self {
      reporter,
      task_id,
      name,
      outcome_tx,
      completed: false,
    }
  }

  pub(crate) fn name(&self) -> &TaskName {
    &self.name
  }

  pub(crate) fn complete(mut self, result: ExecutionResult) {
    self.completed = true;
    self.reporter.complete(self.task_id, &self.name, &self.outcome_tx, result);
  }
}

impl Drop for CompletionGuard {
  fn drop(&mut self) {
    if !self.completed {
      self.completed = true;
      self.reporter.complete(self.task_id, &self.name, &self.outcome_tx, ExecutionResult::Abandoned);
    }
  }
}

/// The completion of a task still waiting in the submission queue.
///
/// Claimed by whichever happens first: the dispatcher admitting the task, or the task's
/// cancellation. A task cancelled deep in the queue is thus resolved at once instead of
/// when it reaches the head.
#[derive(Debug)]
pub(crate) struct PendingCompletion {
  name: TaskName,
  slot: Arc<Mutex<Option<CompletionGuard>>>,
  cancel_watcher: Option<AbortHandle>,
}

impl PendingCompletion {
  pub(crate) fn new(guard: CompletionGuard) -> Self {
    Self {
      name: guard.name().clone(),
      slot: Arc::new(Mutex::new(Some(guard))),
      cancel_watcher: None,
    }
  }

  pub(crate) fn name(&self) -> &TaskName {
    &self.name
  }

  /// Completes the task as cancelled as soon as `token` fires, unless it was claimed first.
  pub(crate) fn watch_cancellation(&mut self, tokio_handle: &TokioHandle, token: CancellationToken) {
    let slot = self.slot.clone();
    let watcher = tokio_handle.spawn(async move {
      token.cancelled().await;
      let claimed = slot.lock().take();
      if let Some(guard) = claimed {
        trace!(task_name = %guard.name(), "Queued task cancelled; resolving without waiting for admission.");
        guard.complete(ExecutionResult::Cancelled);
      }
    });
    self.cancel_watcher = Some(watcher.abort_handle());
  }

  /// Takes the completion out of the queue. `None` if cancellation already resolved it.
  pub(crate) fn claim(mut self) -> Option<CompletionGuard> {
    if let Some(watcher) = self.cancel_watcher.take() {
      watcher.abort();
    }
    self.slot.lock().take()
  }

  /// Resolves the task as cancelled unless something else already did.
  pub(crate) fn cancel(self) {
    if let Some(guard) = self.claim() {
      guard.complete(ExecutionResult::Cancelled);
    }
  }

  pub(crate) fn reject(self) {
    if let Some(guard) = self.claim() {
      guard.complete(ExecutionResult::Rejected);
    }
  }
}

impl Drop for PendingCompletion {
  fn drop(&mut self) {
    // Once the watcher is gone the slot's guard drops with the last reference and
    // completes the task as abandoned.
    if let Some(watcher) = self.cancel_watcher.take() {
      watcher.abort();
    }
  }
}
