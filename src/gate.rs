use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting permit pool bounding how many task bodies run at once.
///
/// Capacity is fixed at construction. Waiters are resumed in the order they started
/// waiting (Tokio's semaphore queue is FIFO).
#[derive(Debug, Clone)]
pub(crate) struct AdmissionGate {
  semaphore: Arc<Semaphore>,
  capacity: usize,
}

/// A permit held while a task body executes. Dropping it releases the slot.
#[derive(Debug)]
pub(crate) struct AdmissionPermit {
  _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
  pub(crate) fn new(capacity: usize) -> Self {
    let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
    Self {
      semaphore: Arc::new(Semaphore::new(capacity)),
      capacity,
    }
  }

  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }

  pub(crate) fn available_permits(&self) -> usize {
    self.semaphore.available_permits()
  }

  /// Number of permits currently held, i.e. task bodies past the gate.
  pub(crate) fn in_use(&self) -> usize {
    self.capacity.saturating_sub(self.available_permits())
  }

  /// Waits for a free slot. `None` once the gate has been closed.
  pub(crate) async fn acquire(&self) -> Option<AdmissionPermit> {
    let permit = self.semaphore.clone().acquire_owned().await.ok()?;
    Some(AdmissionPermit { _permit: permit })
  }

  /// Stops admitting. Current waiters and later callers get `None`; held permits stay valid.
  pub(crate) fn close(&self) {
    self.semaphore.close();
  }
}
