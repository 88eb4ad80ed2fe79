use crate::config::{PoolDescriptor, PoolKind};
use crate::error::PoolError;
use crate::task::{next_task_id, CompletionGuard, CompletionSink, ManagedTaskInternal, TaskToExecute};
use crate::task_queue::{AdmissionGate, QueueConsumer, QueueProducer, TaskQueue};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, Instrument};

/// Defines how the pool should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Waits for currently active tasks to complete.
  /// Queued tasks that haven't started will not be processed.
  Graceful,
  /// Cancels all active tasks: their futures report `TaskCancelled` at once,
  /// and shutdown still waits for work already on a blocking thread to return.
  /// Queued tasks that haven't started will not be processed.
  ForcefulCancel,
}

/// One named worker pool.
///
/// A single worker loop pulls tasks off the queue in FIFO order and spawns each
/// one under a semaphore permit, so the semaphore bounds how many run at once.
/// The admission gate bounds running plus queued tasks and is checked at
/// submission time, which is what makes a saturated pool reject instead of buffer.
pub struct WorkerPool {
  descriptor: PoolDescriptor,
  pool_name: Arc<String>,
  semaphore: Arc<Semaphore>,
  gate: Arc<AdmissionGate>,
  task_queue_tx: QueueProducer,
  active_task_info: Arc<DashMap<u64, CancellationToken>>,
  idle_notify: Arc<Notify>,
  shutdown_token: CancellationToken,
  worker_finished: Arc<AtomicBool>,
  worker_join_handle_internal: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerPool")
      .field("descriptor", &self.descriptor)
      .field("active", &self.active_task_info.len())
      .field("queued", &self.task_queue_tx.len())
      .field("shutdown", &self.shutdown_token.is_cancelled())
      .finish()
  }
}

impl WorkerPool {
  pub fn new(descriptor: PoolDescriptor, tokio_handle: TokioHandle) -> Arc<Self> {
    let concurrency_limit = match descriptor.kind {
      PoolKind::Cached => Semaphore::MAX_PERMITS,
      _ => descriptor
        .max_threads
        .unwrap_or(Semaphore::MAX_PERMITS)
        .clamp(1, Semaphore::MAX_PERMITS),
    };
    let (tx, rx) = TaskQueue::new();
    let shutdown_token = CancellationToken::new();
    let pool_name = Arc::new(descriptor.name.clone());

    let pool = Arc::new(Self {
      gate: AdmissionGate::new(descriptor.admission_limit()),
      descriptor,
      pool_name: pool_name.clone(),
      semaphore: Arc::new(Semaphore::new(concurrency_limit)),
      task_queue_tx: tx,
      active_task_info: Arc::new(DashMap::new()),
      idle_notify: Arc::new(Notify::new()),
      shutdown_token: shutdown_token.clone(),
      worker_finished: Arc::new(AtomicBool::new(false)),
      worker_join_handle_internal: Mutex::new(None),
    });

    let worker = WorkerContext {
      pool_name: pool_name.clone(),
      semaphore: pool.semaphore.clone(),
      tasks_tokio_handle: tokio_handle.clone(),
      active_task_info: pool.active_task_info.clone(),
      idle_notify: pool.idle_notify.clone(),
      shutdown_token,
      worker_finished: pool.worker_finished.clone(),
    };
    let worker_loop_join_handle = tokio_handle.spawn(
      worker
        .run_worker_loop(rx)
        .instrument(info_span!("pool_worker_loop", name = %pool_name)),
    );
    *pool.worker_join_handle_internal.lock() = Some(worker_loop_join_handle);

    info!(pool_name = %pool.pool_name, kind = ?pool.descriptor.kind, max_threads = ?pool.descriptor.max_threads, queue = ?pool.descriptor.queue, "Pool created.");
    pool
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn descriptor(&self) -> &PoolDescriptor {
    &self.descriptor
  }

  pub fn active_task_count(&self) -> usize {
    self.active_task_info.len()
  }

  /// Returns the current number of tasks in the pending queue.
  pub fn queued_task_count(&self) -> usize {
    self.task_queue_tx.len()
  }

  /// Tasks admitted and not yet finished (running plus queued).
  pub fn admitted_task_count(&self) -> usize {
    self.gate.admitted()
  }

  pub fn is_shutdown(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Shut down, worker loop stopped and no task still running.
  pub fn is_terminated(&self) -> bool {
    self.is_shutdown() && self.worker_finished.load(Ordering::Acquire) && self.active_task_info.is_empty()
  }

  /// Enqueues a task without waiting.
  ///
  /// Returns the task id. Fails with `Rejected` when the pool is saturated and
  /// with `PoolShuttingDown` once shutdown began. Cancelling `token` cancels the
  /// task. `sink` hears about cancellation, panics and shutdown.
  pub(crate) fn try_submit(
    &self,
    task_future: TaskToExecute,
    token: CancellationToken,
    sink: Arc<dyn CompletionSink>,
  ) -> Result<u64, PoolError> {
    if self.shutdown_token.is_cancelled() || self.task_queue_tx.is_closed() {
      debug!(pool_name = %self.pool_name, "Submit: Attempted to submit task to a pool that is shutting down or closed.");
      return Err(PoolError::PoolShuttingDown);
    }

    let Some(admission) = self.gate.try_admit() else {
      debug!(pool_name = %self.pool_name, admitted = self.gate.admitted(), "Submit: Pool saturated, rejecting task.");
      return Err(PoolError::Rejected {
        pool: self.pool_name.to_string(),
      });
    };

    let task_id = next_task_id();
    let managed_task_internal = ManagedTaskInternal {
      task_id,
      future: task_future,
      token,
      completion: CompletionGuard::new(sink),
      admission,
    };

    trace!(pool_name = %self.pool_name, %task_id, "Submitting task to queue.");
    self.task_queue_tx.send(managed_task_internal, &self.shutdown_token)?;
    Ok(task_id)
  }

  pub async fn shutdown(self: Arc<Self>, mode: ShutdownMode) -> Result<(), PoolError> {
    let already_initiating_shutdown = self.shutdown_token.is_cancelled();

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Initiating explicit pool shutdown (mode: {:?}).", mode);
      self.shutdown_token.cancel();
      self.task_queue_tx.close();

      if mode == ShutdownMode::ForcefulCancel {
        let tasks_to_cancel: Vec<(u64, CancellationToken)> = self
          .active_task_info
          .iter()
          .map(|entry| (*entry.key(), entry.value().clone()))
          .collect();
        info!(pool_name = %self.pool_name, "Forceful shutdown: Cancelling {} active tasks.", tasks_to_cancel.len());
        for (task_id, token) in tasks_to_cancel {
          debug!(pool_name = %self.pool_name, %task_id, "Forcefully cancelling active task during shutdown.");
          token.cancel();
        }
      } else {
        info!(pool_name = %self.pool_name, "Graceful shutdown: Allowing active tasks to complete.");
      }
    } else {
      info!(pool_name = %self.pool_name, "Shutdown already in progress or initiated by another call/Drop.");
    }

    let handle_to_await = self.worker_join_handle_internal.lock().take();

    let mut outcome = Ok(());
    if let Some(handle) = handle_to_await {
      debug!(pool_name = %self.pool_name, "Waiting for worker loop to join.");
      if let Err(join_error) = handle.await {
        error!(pool_name = %self.pool_name, "Error joining worker loop during shutdown: {:?}.", join_error);
        // The loop never got to flag itself.
        self.worker_finished.store(true, Ordering::Release);
        outcome = Err(PoolError::WorkerLoopFailed(self.pool_name.to_string()));
      }
    } else {
      trace!(pool_name = %self.pool_name, "Worker join handle already taken (concurrent shutdown call).");
    }

    self.wait_for_idle().await;

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Pool shutdown process completed by this call.");
    }
    outcome
  }

  async fn wait_for_idle(&self) {
    loop {
      let notified = self.idle_notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.active_task_info.is_empty() {
        return;
      }
      notified.await;
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(pool_name = %self.pool_name, "WorkerPool dropped. Initiating implicit shutdown.");
      // Stops the worker loop and refuses further submissions. Running tasks are
      // not awaited here.
      self.shutdown_token.cancel();
      self.task_queue_tx.close();
    } else {
      trace!(pool_name = %self.pool_name, "Drop: Shutdown already in progress or completed.");
    }
  }
}

/// Everything the worker loop needs, detached from the pool itself so that
/// dropping the last pool handle can still stop the loop.
struct WorkerContext {
  pool_name: Arc<String>,
  semaphore: Arc<Semaphore>,
  tasks_tokio_handle: TokioHandle,
  active_task_info: Arc<DashMap<u64, CancellationToken>>,
  idle_notify: Arc<Notify>,
  shutdown_token: CancellationToken,
  worker_finished: Arc<AtomicBool>,
}

impl WorkerContext {
  async fn run_worker_loop(self, mut task_queue_rx: QueueConsumer) {
    let pool_name = self.pool_name.clone();
    info!(name = %*pool_name, "Worker loop started.");

    loop {
      tokio::select! {
        biased;

        _ = self.shutdown_token.cancelled() => {
          info!(name = %*pool_name, "Shutdown signal (token) received. Worker loop terminating.");
          break;
        }

        permit_acquisition_result = self.semaphore.clone().acquire_owned() => {
          let permit_initial = match permit_acquisition_result {
            Ok(p) => p,
            Err(_) => {
              error!(name = %*pool_name, "Semaphore closed. Worker loop exiting.");
              break;
            }
          };
          trace!(name = %*pool_name, "Acquired semaphore permit. Available: {}", self.semaphore.available_permits());

          let task_and_permit_option: Option<(ManagedTaskInternal, OwnedSemaphorePermit)> = tokio::select! {
            biased;
            _ = self.shutdown_token.cancelled() => {
              info!(name = %*pool_name, "Shutdown signal received while waiting for a task. Releasing permit.");
              None
            }
            task = task_queue_rx.recv() => {
              if task.is_none() {
                info!(name = %*pool_name, "Task queue closed and empty. Releasing permit.");
              }
              task.map(|task| (task, permit_initial))
            }
          };

          match task_and_permit_option {
            Some((managed_task, permit_for_task)) => self.spawn_task(managed_task, permit_for_task),
            None => break,
          }
        }
      }
    }

    // Remaining queued tasks are dropped with the receiver; their guards report the shutdown.
    drop(task_queue_rx);
    self.worker_finished.store(true, Ordering::Release);
    info!(
      name = %*pool_name,
      "Worker loop stopped. Active tasks remaining: {}",
      self.active_task_info.len()
    );
  }

  fn spawn_task(&self, managed_task: ManagedTaskInternal, permit_for_task: OwnedSemaphorePermit) {
    let ManagedTaskInternal {
      task_id,
      future: task_future,
      token: task_specific_token,
      completion,
      admission,
    } = managed_task;

    if task_specific_token.is_cancelled() {
      debug!(name = %*self.pool_name, %task_id, "Dequeued task already cancelled (task's own token).");
      completion.abort(PoolError::TaskCancelled);
      return;
    }
    if self.shutdown_token.is_cancelled() {
      debug!(name = %*self.pool_name, %task_id, "Dequeued task after shutdown began. Not starting it.");
      completion.abort(PoolError::PoolShuttingDown);
      return;
    }

    self.active_task_info.insert(task_id, task_specific_token.clone());
    debug!(name = %*self.pool_name, %task_id, "Dequeued task. Spawning with permit.");

    let pool_name = self.pool_name.clone();
    let pool_name_for_instrument_span = self.pool_name.clone();
    let active_task_info_cleanup = self.active_task_info.clone();
    let idle_notify = self.idle_notify.clone();

    self.tasks_tokio_handle.spawn(
      async move {
        let mut execution = AssertUnwindSafe(task_future).catch_unwind();

        let finished = tokio::select! {
          biased;
          _ = task_specific_token.cancelled() => {
            debug!(pool_name = %*pool_name, %task_id, "Task execution cancelled by its specific token.");
            completion.cancel();
            None
          },
          task_result = &mut execution => Some(task_result),
        };

        // Blocking work cannot be interrupted: the slot stays taken until it returns.
        let task_result = match finished {
          Some(task_result) => task_result,
          None => execution.await,
        };
        match task_result {
          Ok(()) => {
            trace!(pool_name = %*pool_name, %task_id, "Task executed successfully.");
            completion.finish();
          }
          Err(_panic_payload) => {
            error!(pool_name = %*pool_name, %task_id, "Task panicked during execution.");
            completion.abort(PoolError::TaskPanicked);
          }
        }
        drop(permit_for_task);
        drop(admission);

        active_task_info_cleanup.remove(&task_id);
        if active_task_info_cleanup.is_empty() {
          idle_notify.notify_waiters();
        }
        trace!(name = %*pool_name, %task_id, "Managed task finished processing, removed active info.");
      }
      .instrument(info_span!("managed_task", pool_name = %*pool_name_for_instrument_span, %task_id)),
    );
  }
}
