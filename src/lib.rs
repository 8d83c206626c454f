//! A Tokio-based background task scheduler for request-serving processes: bounded
//! concurrency, FIFO admission, name-based lookup of in-flight work and waiting with a
//! timeout.

mod config;
mod error;
mod gate;
mod handle;
mod notifier;
mod registry;
mod reporter;
mod scheduler;
mod task;

pub use config::{SchedulerConfig, MAX_CONCURRENT_TASKS_ENV};
pub use error::SchedulerError;
pub use handle::TaskHandle;
pub use notifier::TaskCompletionInfo;
pub use scheduler::{BackgroundScheduler, ShutdownMode};
pub use task::{BackgroundWork, TaskName, TaskOutcome};
