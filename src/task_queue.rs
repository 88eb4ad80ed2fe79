use crate::error::PoolError;
use crate::task::ManagedTaskInternal;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// Lock-free admission counter for a pool.
///
/// A bounded gate admits at most `limit` tasks at once, counting both running
/// and queued tasks. An unbounded gate only keeps the count.
#[derive(Debug)]
pub(crate) struct AdmissionGate {
  limit: Option<usize>,
  admitted: AtomicUsize,
}

impl AdmissionGate {
  pub(crate) fn new(limit: Option<usize>) -> Arc<Self> {
    Arc::new(Self {
      limit,
      admitted: AtomicUsize::new(0),
    })
  }

  /// Takes a slot without waiting. `None` means the gate is full.
  pub(crate) fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
    match self.limit {
      None => {
        self.admitted.fetch_add(1, Ordering::AcqRel);
      }
      Some(limit) => {
        self
          .admitted
          .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current < limit).then_some(current + 1)
          })
          .ok()?;
      }
    }
    Some(AdmissionPermit { gate: self.clone() })
  }

  pub(crate) fn admitted(&self) -> usize {
    self.admitted.load(Ordering::Acquire)
  }

  fn release(&self) {
    self.admitted.fetch_sub(1, Ordering::AcqRel);
  }
}

/// One admitted slot. Its `Drop` releases the slot back to the gate.
#[derive(Debug)]
pub(crate) struct AdmissionPermit {
  gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionPermit {
  fn drop(&mut self) {
    self.gate.release();
  }
}

/// A non-blocking, multi-producer, single-consumer queue of pool tasks.
///
/// The channel itself is unbounded; capacity is enforced by the pool's
/// [`AdmissionGate`] before a task is built, so `send` never waits.
pub(crate) struct TaskQueue;

impl TaskQueue {
  pub(crate) fn new() -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    (
      QueueProducer {
        tx: Mutex::new(Some(tx)),
        queued: queued.clone(),
      },
      QueueConsumer { rx, queued },
    )
  }
}

/// The producer half. Closing it lets the consumer drain and stop.
pub(crate) struct QueueProducer {
  tx: Mutex<Option<UnboundedSender<ManagedTaskInternal>>>,
  queued: Arc<AtomicUsize>,
}

impl fmt::Debug for QueueProducer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl QueueProducer {
  /// Enqueues a task. Fails only if the queue is closed or the pool is shutting down.
  pub(crate) fn send(&self, task: ManagedTaskInternal, shutdown_token: &CancellationToken) -> Result<(), PoolError> {
    if shutdown_token.is_cancelled() {
      return Err(PoolError::PoolShuttingDown);
    }
    let guard = self.tx.lock();
    let Some(tx) = guard.as_ref() else {
      return Err(PoolError::PoolShuttingDown);
    };
    self.queued.fetch_add(1, Ordering::AcqRel);
    if tx.send(task).is_err() {
      // Receiver is gone; the returned task is dropped here and its guard reports the shutdown.
      self.queued.fetch_sub(1, Ordering::AcqRel);
      return Err(PoolError::PoolShuttingDown);
    }
    Ok(())
  }

  pub(crate) fn close(&self) {
    self.tx.lock().take();
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.tx.lock().as_ref().map_or(true, |tx| tx.is_closed())
  }

  /// Number of tasks waiting to be picked up by the worker loop.
  pub(crate) fn len(&self) -> usize {
    self.queued.load(Ordering::Acquire)
  }
}

/// The consumer half, owned by the pool's worker loop.
#[derive(Debug)]
pub(crate) struct QueueConsumer {
  rx: UnboundedReceiver<ManagedTaskInternal>,
  queued: Arc<AtomicUsize>,
}

impl QueueConsumer {
  /// Receives the next task in FIFO order. `None` once closed and drained.
  pub(crate) async fn recv(&mut self) -> Option<ManagedTaskInternal> {
    let task = self.rx.recv().await?;
    self.queued.fetch_sub(1, Ordering::AcqRel);
    Some(task)
  }
}
