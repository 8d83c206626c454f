//! Scheduler configuration.

use crate::error::SchedulerError;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Environment variable holding the admission gate's capacity.
pub const MAX_CONCURRENT_TASKS_ENV: &str = "MAX_CONCURRENT_TASKS";

const DEFAULT_SCHEDULER_NAME: &str = "background";
const DEFAULT_MAX_CONCURRENT_TASKS: usize = 1;

/// Configuration for a [`BackgroundScheduler`](crate::BackgroundScheduler), fixed at process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  /// Name used in log fields and completion notifications.
  pub name: String,
  /// Maximum number of task bodies executing at once. Defaults to 1 (strictly serial).
  pub max_concurrent_tasks: usize,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      name: DEFAULT_SCHEDULER_NAME.to_string(),
      max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
    }
  }
}

impl SchedulerConfig {
  pub fn new(name: impl Into<String>, max_concurrent_tasks: usize) -> Self {
    Self {
      name: name.into(),
      max_concurrent_tasks,
    }
  }

  /// Builds a configuration from the process environment (and a `.env` file, if present).
  ///
  /// `MAX_CONCURRENT_TASKS` falls back to the default when unset.
  pub fn from_env() -> Result<Self, SchedulerError> {
    let mut config = Self::default();
    if let Ok(raw) = dotenvy::var(MAX_CONCURRENT_TASKS_ENV) {
      config.max_concurrent_tasks = parse_max_concurrent_tasks(&raw)?;
    }
    config.validate()?;
    Ok(config)
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
    self.max_concurrent_tasks = max_concurrent_tasks;
    self
  }

  pub fn validate(&self) -> Result<(), SchedulerError> {
    if self.max_concurrent_tasks == 0 {
      return Err(SchedulerError::InvalidConfig(
        "max_concurrent_tasks must be greater than 0".into(),
      ));
    }
    if self.max_concurrent_tasks > Semaphore::MAX_PERMITS {
      return Err(SchedulerError::InvalidConfig(format!(
        "max_concurrent_tasks must be at most {}, got {}",
        Semaphore::MAX_PERMITS,
        self.max_concurrent_tasks
      )));
    }
    Ok(())
  }
}

pub(crate) fn parse_max_concurrent_tasks(raw: &str) -> Result<usize, SchedulerError> {
  raw.trim().parse::<usize>().map_err(|err| {
    SchedulerError::InvalidConfig(format!("{MAX_CONCURRENT_TASKS_ENV}={raw:?} is not a valid task count: {err}"))
  })
}
