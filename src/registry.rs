use crate::handle::TaskHandle;

use dashmap::DashMap;
use tracing::trace;

/// The set of tracked tasks that have not yet reached a terminal state.
///
/// Inserted into by `submit`, removed from by each task's completion path.
#[derive(Debug, Default)]
pub(crate) struct TaskRegistry {
  tasks: DashMap<u64, TaskHandle>,
}

impl TaskRegistry {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn register(&self, handle: TaskHandle) {
    trace!(task_id = %handle.id(), task_name = %handle.name(), "Registry: tracking task.");
    self.tasks.insert(handle.id(), handle);
  }

  /// Removes the task if present. Returns whether it was still tracked.
  pub(crate) fn unregister(&self, task_id: u64) -> bool {
    self.tasks.remove(&task_id).is_some()
  }

  /// Copies out every tracked task with the given name, in submission order.
  pub(crate) fn find_by_name(&self, name: &str) -> Vec<TaskHandle> {
    let mut matching: Vec<TaskHandle> = self
      .tasks
      .iter()
      .filter(|entry| entry.value().name() == name)
      .map(|entry| entry.value().clone())
      .collect();
    matching.sort_by_key(TaskHandle::id);
    matching
  }

  pub(crate) fn snapshot(&self) -> Vec<TaskHandle> {
    let mut all: Vec<TaskHandle> = self.tasks.iter().map(|entry| entry.value().clone()).collect();
    all.sort_by_key(TaskHandle::id);
    all
  }

  pub(crate) fn len(&self) -> usize {
    self.tasks.len()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }
}
