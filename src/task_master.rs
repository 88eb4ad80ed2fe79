use crate::config::TaskMasterConfig;
use crate::error::PoolError;
use crate::future::{PoolFuture, TaskFuture, TaskState};
use crate::registry::PoolRegistry;
use crate::result::{ResultCarrier, ResultHolder};

use std::sync::Arc;

use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A write-once slot that a background task fills in and then hands back as
/// its output.
pub trait ResultSlot: Send + 'static {
  type Output: Clone + Send + Sync + 'static;

  fn into_output(self) -> Self::Output;
}

impl<M, T> ResultSlot for ResultCarrier<M, T>
where
  M: Clone + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
{
  type Output = ResultHolder<M, T>;

  fn into_output(self) -> Self::Output {
    self.into_holder()
  }
}

/// Submits work to named pools and owns their shutdown.
#[derive(Debug, Clone)]
pub struct TaskMaster {
  registry: Arc<PoolRegistry>,
}

impl TaskMaster {
  pub fn new(config: TaskMasterConfig, tokio_handle: TokioHandle) -> Self {
    Self::with_registry(Arc::new(PoolRegistry::new(config, tokio_handle)))
  }

  pub fn with_registry(registry: Arc<PoolRegistry>) -> Self {
    Self { registry }
  }

  pub fn registry(&self) -> &Arc<PoolRegistry> {
    &self.registry
  }

  /// Runs `work` against `carrier` on the named pool (the default pool for `None`).
  ///
  /// Never waits for room in the pool: a saturated pool rejects at once. A
  /// pool name that is not configured is an error rather than a fallback.
  pub fn submit<C, F>(&self, work: F, carrier: C, pool: Option<&str>) -> Result<TaskFuture<C::Output>, PoolError>
  where
    C: ResultSlot,
    F: FnOnce(&mut C) + Send + 'static,
  {
    self
      .submit_with_completion(work, carrier, pool, |_: &C::Output| {})
      .map(TaskFuture::PoolBacked)
  }

  /// Like [`TaskMaster::submit`], and runs `on_complete` with the output on
  /// the worker thread before the future is completed.
  ///
  /// `on_complete` is skipped if the task was cancelled or the work panicked.
  /// Once it has started, [`PoolFuture::cancel`] reports false.
  pub fn submit_with_completion<C, F, H>(
    &self,
    work: F,
    carrier: C,
    pool: Option<&str>,
    on_complete: H,
  ) -> Result<PoolFuture<C::Output>, PoolError>
  where
    C: ResultSlot,
    F: FnOnce(&mut C) + Send + 'static,
    H: FnOnce(&C::Output) + Send + 'static,
  {
    let worker_pool = match pool.map(str::trim) {
      Some(name) if !name.is_empty() && !self.registry.is_defined(name) => {
        warn!(pool_name = %name, "Submit: Pool has not been defined.");
        return Err(PoolError::UnknownPool(name.to_string()));
      }
      name => self.registry.get_pool(name)?,
    };

    let state = TaskState::<C::Output>::new();
    let token = CancellationToken::new();

    let job_state = state.clone();
    let job = async move {
      let claim_state = job_state.clone();
      let blocking = tokio::task::spawn_blocking(move || {
        let mut carrier = carrier;
        work(&mut carrier);
        let output = carrier.into_output();
        // Losing the claim means the task was cancelled; the output is discarded.
        if !claim_state.claim() {
          return None;
        }
        on_complete(&output);
        Some(output)
      });
      match blocking.await {
        Ok(Some(output)) => {
          job_state.complete(Ok(output));
        }
        Ok(None) => {
          trace!("Cancelled task returned. Output discarded.");
        }
        Err(join_error) if join_error.is_panic() => std::panic::resume_unwind(join_error.into_panic()),
        Err(_) => {
          job_state.complete(Err(PoolError::TaskCancelled));
        }
      }
    };

    let task_id = worker_pool.try_submit(Box::pin(job), token.clone(), state.clone())?;
    debug!(pool_name = %worker_pool.name(), %task_id, "Task submitted.");
    Ok(PoolFuture::new(task_id, Arc::new(worker_pool.name().to_string()), token, state))
  }

  /// Gracefully shuts down every pool.
  pub async fn shutdown(&self) -> Result<(), PoolError> {
    trace!("TaskMaster: graceful shutdown requested.");
    self.registry.shutdown().await
  }

  /// Shuts down every pool and cancels running tasks.
  pub async fn shutdown_now(&self) -> Result<(), PoolError> {
    trace!("TaskMaster: forceful shutdown requested.");
    self.registry.shutdown_now().await
  }
}
