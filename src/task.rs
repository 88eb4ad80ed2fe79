use crate::error::PoolError;
use crate::task_queue::AdmissionPermit;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
}

/// Allocates a process-unique task id.
pub(crate) fn next_task_id() -> u64 {
  NEXT_TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// The type of future that a worker pool executes.
/// A job publishes its own successful outcome; the pool only reports aborts.
pub type TaskToExecute = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receives the outcome of a task that did not run to completion.
pub(crate) trait CompletionSink: Send + Sync {
  /// Records `error` unless an outcome was already recorded.
  fn abort(&self, error: PoolError);

  /// Records `TaskCancelled` unless the task already claimed its outcome.
  fn cancel(&self);
}

/// Reports an abort to its sink at most once.
///
/// If the guard is dropped without an explicit abort (e.g. the task was still
/// queued when its pool shut down) the sink sees `PoolShuttingDown`. Sinks are
/// write-once, so the drop is harmless after a successful completion.
pub(crate) struct CompletionGuard {
  sink: Option<Arc<dyn CompletionSink>>,
}

impl CompletionGuard {
  pub(crate) fn new(sink: Arc<dyn CompletionSink>) -> Self {
    Self { sink: Some(sink) }
  }

  pub(crate) fn abort(mut self, error: PoolError) {
    if let Some(sink) = self.sink.take() {
      sink.abort(error);
    }
  }

  /// Reports a cancellation while keeping the guard, so a later panic can
  /// still be reported if the task claimed its outcome first.
  pub(crate) fn cancel(&self) {
    if let Some(sink) = &self.sink {
      sink.cancel();
    }
  }

  /// The job published its own outcome; nothing left to report.
  pub(crate) fn finish(mut self) {
    self.sink.take();
  }
}

impl Drop for CompletionGuard {
  fn drop(&mut self) {
    if let Some(sink) = self.sink.take() {
      sink.abort(PoolError::PoolShuttingDown);
    }
  }
}

/// Internal representation of a task managed by a pool.
pub(crate) struct ManagedTaskInternal {
  pub(crate) task_id: u64,
  pub(crate) future: TaskToExecute,
  pub(crate) token: CancellationToken,
  pub(crate) completion: CompletionGuard,
  /// Holds one admission slot of the pool until the task finishes.
  pub(crate) admission: AdmissionPermit,
}
