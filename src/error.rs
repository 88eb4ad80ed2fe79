use std::time::Duration;

use thiserror::Error;

/// Errors raised by the named worker pools and the submission service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  #[error("Pool [{pool}] is saturated and rejected the task")]
  Rejected { pool: String },

  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,

  #[error("Pool [{0}] has not been defined")]
  UnknownPool(String),

  #[error("Pool [{0}] has terminated and the caller was interrupted")]
  PoolTerminated(String),

  #[error("Submitted task panicked")]
  TaskPanicked,

  #[error("Task was cancelled")]
  TaskCancelled,

  #[error("Pool worker loop for [{0}] failed to join")]
  WorkerLoopFailed(String),

  #[error("Errors occurred shutting down pools: {0:?}")]
  ShutdownFailed(Vec<String>),
}

impl PoolError {
  /// True when a submission was refused at call time (saturated or shutting down pool).
  pub fn is_rejection(&self) -> bool {
    matches!(self, PoolError::Rejected { .. } | PoolError::PoolShuttingDown)
  }
}

/// Errors raised when resolving named caches.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
  #[error("Cache [{0}] does not exist")]
  NotFound(String),

  #[error("Cache [{name}] exists with a different value type")]
  IncompatibleType { name: String },

  #[error("Cache [{0}] reference was lost and no cache manager is attached to resolve it")]
  Detached(String),
}

/// Errors surfaced through a [`crate::TaskFuture`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
  #[error(transparent)]
  Pool(#[from] PoolError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error("Timed out after {0:?} waiting for the task result")]
  Timeout(Duration),
}

/// Errors raised by the service invocation helper.
///
/// Action failures never appear here; they are captured in a [`crate::ResultHolder`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error("Unable to start the service call: {0}")]
  Rejected(PoolError),

  #[error("Execution state for cache [{cache}] and key [{key}] was lost")]
  LostExecution { cache: String, key: String },

  #[error("Execution for cache [{cache}] and key [{key}] was cancelled")]
  Cancelled { cache: String, key: String },

  #[error(transparent)]
  Task(#[from] TaskError),

  #[error(transparent)]
  Cache(#[from] CacheError),
}

impl From<PoolError> for ServiceError {
  fn from(error: PoolError) -> Self {
    match error {
      PoolError::UnknownPool(_) => ServiceError::InvalidArgument(error.to_string()),
      other => ServiceError::Rejected(other),
    }
  }
}

/// Errors raised by a [`crate::LogicalThreadPool`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogicalPoolError {
  #[error("Logical pool [{0}] is shutdown for processing")]
  Shutdown(String),

  #[error("Maximum attempts ({attempts}) to get a slot in logical pool [{name}] exceeded")]
  WaitExhausted { name: String, attempts: u32 },
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read configuration file: {0}")]
  Io(#[from] std::io::Error),

  #[error("Failed to parse configuration: {0}")]
  Parse(#[from] toml::de::Error),
}
