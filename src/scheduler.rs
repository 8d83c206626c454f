use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::gate::{AdmissionGate, AdmissionPermit};
use crate::handle::TaskHandle;
use crate::notifier::{CompletionNotifier, TaskCompletionInfo};
use crate::registry::TaskRegistry;
use crate::reporter::{CompletionGuard, CompletionReporter, PendingCompletion};
use crate::task::{panic_message, BackgroundWork, ExecutionResult, QueuedTask, TaskName};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{self, debug, error, info, info_span, trace, warn, Instrument};

/// Defines how the scheduler should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stops accepting work and lets every already-submitted task, queued or running,
  /// run to completion.
  Graceful,
  /// Stops accepting work and cancels every tracked task. Queued tasks never run.
  ForcefulCancel,
}

/// In-process background task scheduler with a bounded number of concurrently running
/// bodies and name-based lookup of in-flight work.
///
/// Construct one per process with [`BackgroundScheduler::new`] inside the runtime that
/// will drive it, and share the returned `Arc` with request-handling code.
pub struct BackgroundScheduler {
  scheduler_name: Arc<String>,
  gate: AdmissionGate,
  registry: Arc<TaskRegistry>,
  notifier: Arc<CompletionNotifier>,
  reporter: CompletionReporter,
  queue_tx: Mutex<Option<mpsc::UnboundedSender<QueuedTask>>>,
  shutdown_token: CancellationToken,
  next_task_id: AtomicU64,
  dispatcher_join_handle: Mutex<Option<JoinHandle<()>>>,
  tokio_handle: TokioHandle,
}

impl BackgroundScheduler {
  pub fn new(config: SchedulerConfig, tokio_handle: TokioHandle) -> Arc<Self> {
    let scheduler_name = Arc::new(config.name);
    if config.max_concurrent_tasks == 0 {
      warn!(scheduler = %*scheduler_name, "max_concurrent_tasks of 0 would never admit work; using 1.");
    } else if config.max_concurrent_tasks > Semaphore::MAX_PERMITS {
      warn!(
        scheduler = %*scheduler_name,
        requested = config.max_concurrent_tasks,
        limit = Semaphore::MAX_PERMITS,
        "max_concurrent_tasks exceeds the admission gate's limit; clamping."
      );
    }

    let gate = AdmissionGate::new(config.max_concurrent_tasks);
    let registry = Arc::new(TaskRegistry::new());
    let notifier = CompletionNotifier::start(&tokio_handle, scheduler_name.clone());
    let reporter = CompletionReporter::new(scheduler_name.clone(), registry.clone(), notifier.clone());
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();

    let dispatcher_join_handle = tokio_handle.spawn(
      Self::run_dispatch_loop(scheduler_name.clone(), gate.clone(), queue_rx, tokio_handle.clone())
        .instrument(info_span!("background_dispatch_loop", scheduler = %*scheduler_name)),
    );

    info!(scheduler = %*scheduler_name, capacity = gate.capacity(), "Background scheduler started.");

    Arc::new(Self {
      scheduler_name,
      gate,
      registry,
      notifier,
      reporter,
      queue_tx: Mutex::new(Some(queue_tx)),
      shutdown_token: CancellationToken::new(),
      next_task_id: AtomicU64::new(0),
      dispatcher_join_handle: Mutex::new(Some(dispatcher_join_handle)),
      tokio_handle,
    })
  }

  /// Shorthand for a scheduler with the given capacity on the current runtime.
  ///
  /// # Panics
  /// Panics if called outside of a Tokio runtime.
  pub fn with_capacity(max_concurrent_tasks: usize) -> Arc<Self> {
    Self::new(
      SchedulerConfig::default().with_max_concurrent_tasks(max_concurrent_tasks),
      TokioHandle::current(),
    )
  }

  pub fn name(&self) -> &str {
    &self.scheduler_name
  }

  /// Maximum number of task bodies that may run at once.
  pub fn capacity(&self) -> usize {
    self.gate.capacity()
  }

  /// Number of task bodies currently past the admission gate.
  pub fn running_task_count(&self) -> usize {
    self.gate.in_use()
  }

  /// Number of tasks queued or running, i.e. not yet in a terminal state.
  pub fn tracked_task_count(&self) -> usize {
    self.registry.len()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.queue_tx.lock().is_none()
  }

  /// Schedules `work` to run in the background under `name` and returns immediately.
  ///
  /// The task is tracked from this moment until it reaches a terminal state. Bodies are
  /// admitted in submission order, at most [`capacity`](Self::capacity) at a time. Whatever
  /// the work returns, panics included, is contained here and reported through logs, the
  /// returned handle and completion handlers. If the scheduler is shutting down the task
  /// completes immediately as cancelled without running.
  pub fn submit<F>(&self, name: impl Into<TaskName>, work: F) -> TaskHandle
  where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    let name: TaskName = name.into();
    let task_id = self.next_task_id.fetch_add(1, AtomicOrdering::Relaxed);
    let token = self.shutdown_token.child_token();
    let (outcome_tx, outcome_rx) = watch::channel(None);
    let handle = TaskHandle::new(task_id, name.clone(), token.clone(), outcome_rx);

    let mut completion = PendingCompletion::new(CompletionGuard::new(self.reporter.clone(), task_id, name.clone(), outcome_tx));

    let queue_guard = self.queue_tx.lock();
    let Some(queue_tx) = queue_guard.as_ref() else {
      drop(queue_guard);
      completion.reject();
      return handle;
    };

    // Registered under the queue lock so a concurrent shutdown always sees it.
    self.registry.register(handle.clone());
    completion.watch_cancellation(&self.tokio_handle, token.clone());
    let queued = QueuedTask {
      task_id,
      work: Box::pin(work) as BackgroundWork,
      token,
      submitted_at: Instant::now(),
      completion,
    };
    match queue_tx.send(queued) {
      Ok(()) => {
        debug!(scheduler = %self.scheduler_name, %task_id, task_name = %name, "Accepted background task.");
      }
      Err(send_error) => {
        drop(queue_guard);
        error!(
          scheduler = %self.scheduler_name,
          %task_id,
          task_name = %name,
          "Submit: dispatcher is no longer running; task will not run."
        );
        send_error.0.completion.reject();
      }
    }

    handle
  }

  /// Returns a snapshot of the in-flight tasks named `name`, in submission order.
  pub fn find_by_name(&self, name: &str) -> Vec<TaskHandle> {
    self.registry.find_by_name(name)
  }

  /// Waits for every in-flight task named `name` to reach a terminal state.
  ///
  /// Matching tasks are waited on one after another and each gets its own `timeout`,
  /// measured from when waiting on that task begins; there is no shared deadline across
  /// tasks sharing a name. Returns immediately when nothing matches. A timeout does not
  /// affect the task, which keeps running and cleans itself up when it finishes.
  ///
  /// # Errors
  /// Returns `SchedulerError::Timeout` for the first matching task still running after its
  /// window. Failures inside the work itself are never surfaced here.
  pub async fn await_task(&self, name: &str, timeout: Duration) -> Result<(), SchedulerError> {
    let matching = self.registry.find_by_name(name);
    if matching.is_empty() {
      trace!(scheduler = %self.scheduler_name, task_name = %name, "await_task: no in-flight task with this name.");
      return Ok(());
    }

    debug!(scheduler = %self.scheduler_name, task_name = %name, count = matching.len(), ?timeout, "Waiting for in-flight tasks.");
    for handle in matching {
      match tokio::time::timeout(timeout, handle.wait()).await {
        Ok(outcome) => {
          trace!(scheduler = %self.scheduler_name, task_id = %handle.id(), ?outcome, "await_task: task reached terminal state.");
        }
        Err(_elapsed) => {
          warn!(scheduler = %self.scheduler_name, task_id = %handle.id(), task_name = %name, ?timeout, "await_task: timed out waiting for task.");
          return Err(SchedulerError::Timeout {
            name: name.to_string(),
            task_id: handle.id(),
            timeout,
          });
        }
      }
    }
    Ok(())
  }

  /// Requests cancellation of every in-flight task named `name`. Returns how many were signalled.
  pub fn cancel_tasks_by_name(&self, name: &str) -> usize {
    let matching = self.registry.find_by_name(name);
    if !matching.is_empty() {
      info!(scheduler = %self.scheduler_name, task_name = %name, count = matching.len(), "Requesting cancellation for tasks by name.");
    }
    for handle in &matching {
      handle.cancel();
    }
    matching.len()
  }

  /// Registers a handler invoked once for every task that reaches a terminal state.
  ///
  /// Handlers run on a dedicated notification task, in registration order. A panicking
  /// handler is logged and does not affect the others.
  pub fn on_completion(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  /// Stops accepting work and waits until no task remains tracked.
  pub async fn shutdown(&self, mode: ShutdownMode) {
    let closed_sender = self.queue_tx.lock().take();
    let initiated_here = closed_sender.is_some();
    drop(closed_sender);

    if initiated_here {
      info!(scheduler = %self.scheduler_name, "Initiating scheduler shutdown (mode: {:?}).", mode);
    } else {
      info!(scheduler = %self.scheduler_name, "Shutdown already in progress or initiated by another call.");
    }

    if mode == ShutdownMode::ForcefulCancel {
      info!(scheduler = %self.scheduler_name, tracked = self.registry.len(), "Forceful shutdown: Cancelling all tracked tasks.");
      self.shutdown_token.cancel();
      self.gate.close();
    } else {
      info!(scheduler = %self.scheduler_name, tracked = self.registry.len(), "Graceful shutdown: Draining tracked tasks.");
    }

    let handle_to_await: Option<JoinHandle<()>> = self.dispatcher_join_handle.lock().take();
    if let Some(handle) = handle_to_await {
      match handle.await {
        Ok(()) => debug!(scheduler = %self.scheduler_name, "Dispatch loop successfully joined."),
        Err(join_error) => {
          error!(scheduler = %self.scheduler_name, "Error joining dispatch loop during shutdown: {:?}.", join_error);
        }
      }
    }

    // Every queued task has now been admitted or resolved; wait for the running bodies.
    for handle in self.registry.snapshot() {
      handle.wait().await;
    }

    if initiated_here {
      info!(scheduler = %self.scheduler_name, "Scheduler shutdown completed.");
    }
  }

  async fn run_dispatch_loop(
    scheduler_name: Arc<String>,
    gate: AdmissionGate,
    mut queue_rx: mpsc::UnboundedReceiver<QueuedTask>,
    tasks_tokio_handle: TokioHandle,
  ) {
    info!(scheduler = %*scheduler_name, "Dispatch loop started.");

    while let Some(queued) = queue_rx.recv().await {
      let QueuedTask {
        task_id,
        work,
        token,
        submitted_at,
        completion,
      } = queued;

      if token.is_cancelled() {
        debug!(scheduler = %*scheduler_name, %task_id, "Dequeued task already cancelled.");
        completion.cancel();
        continue;
      }

      let acquired = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        acquired = gate.acquire() => Some(acquired),
      };

      let permit = match acquired {
        Some(Some(permit)) => permit,
        Some(None) => {
          debug!(scheduler = %*scheduler_name, %task_id, "Admission gate closed; task will not run.");
          completion.cancel();
          continue;
        }
        None => {
          debug!(scheduler = %*scheduler_name, %task_id, "Task cancelled while waiting for admission.");
          completion.cancel();
          continue;
        }
      };

      let task_name = completion.name().clone();
      let Some(completion) = completion.claim() else {
        // Cancelled in the queue and already resolved; the permit goes straight back.
        trace!(scheduler = %*scheduler_name, %task_id, %task_name, "Admitted task was already resolved as cancelled.");
        continue;
      };

      debug!(
        scheduler = %*scheduler_name,
        %task_id,
        %task_name,
        waited = ?submitted_at.elapsed(),
        available_permits = gate.available_permits(),
        "Admitted task past the gate."
      );

      tasks_tokio_handle.spawn(
        async move {
          let result = run_guarded(permit, token, work).await;
          completion.complete(result);
        }
        .instrument(info_span!(
          "background_task",
          scheduler = %*scheduler_name,
          %task_id,
          %task_name
        )),
      );
    }

    info!(scheduler = %*scheduler_name, "Dispatch loop stopped: submission queue closed and drained.");
  }
}

/// Runs one body while holding its admission permit.
///
/// The permit lives in this future, so it is released when the body returns, panics, is
/// cancelled via `token`, or when the future itself is dropped.
async fn run_guarded(_permit: AdmissionPermit, token: CancellationToken, work: BackgroundWork) -> ExecutionResult {
  tokio::select! {
    biased;
    _ = token.cancelled() => ExecutionResult::Cancelled,
    outcome = AssertUnwindSafe(work).catch_unwind() => match outcome {
      Ok(Ok(())) => ExecutionResult::Completed,
      Ok(Err(err)) => ExecutionResult::Failed(err),
      Err(panic_payload) => ExecutionResult::Panicked(panic_message(panic_payload.as_ref())),
    },
  }
}

impl Drop for BackgroundScheduler {
  fn drop(&mut self) {
    if self.queue_tx.get_mut().take().is_some() {
      info!(
        scheduler = %*self.scheduler_name,
        tracked = self.registry.len(),
        "BackgroundScheduler dropped without explicit shutdown. Closing submission; already-submitted tasks keep running."
      );
    } else {
      tracing::trace!(scheduler = %*self.scheduler_name, "Drop: Shutdown already in progress or completed.");
    }
  }
}
