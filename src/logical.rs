//! Semaphore based admission control that is independent of any worker pool.

use crate::config::{LogicalPoolSettings, DEFAULT_POOL_NAME};
use crate::error::LogicalPoolError;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

/// A named admission gate with a fixed number of slots.
///
/// Capacity 0 means unlimited: every acquire succeeds at once. Otherwise
/// waiters are admitted in FIFO order. A slot taken with any `acquire` call is
/// given back with [`LogicalThreadPool::release`].
#[derive(Debug)]
pub struct LogicalThreadPool {
  name: String,
  max: usize,
  semaphore: Semaphore,
  in_use: AtomicUsize,
  shutdown: AtomicBool,
  settings: LogicalPoolSettings,
}

impl Default for LogicalThreadPool {
  fn default() -> Self {
    Self::new(None, 0)
  }
}

impl LogicalThreadPool {
  /// A `None` or empty name becomes "default"; a negative capacity becomes 0.
  /// Capacities above [`Semaphore::MAX_PERMITS`] are capped to it.
  pub fn new(name: Option<&str>, max: i64) -> Self {
    Self::with_settings(name, max, LogicalPoolSettings::default())
  }

  pub fn with_settings(name: Option<&str>, max: i64, settings: LogicalPoolSettings) -> Self {
    let name = match name.map(str::trim) {
      None | Some("") => DEFAULT_POOL_NAME.to_string(),
      Some(name) => name.to_string(),
    };
    // Anything beyond what a semaphore can hold is capped there.
    let max = usize::try_from(max).unwrap_or(0).min(Semaphore::MAX_PERMITS);
    Self {
      name,
      max,
      semaphore: Semaphore::new(max),
      in_use: AtomicUsize::new(0),
      shutdown: AtomicBool::new(false),
      settings,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn max(&self) -> usize {
    self.max
  }

  /// Slots currently held. Always 0 for an unlimited pool.
  pub fn current(&self) -> usize {
    self.in_use.load(Ordering::Acquire)
  }

  pub fn is_shutdown(&self) -> bool {
    self.shutdown.load(Ordering::Acquire)
  }

  /// Makes every following acquire fail until [`LogicalThreadPool::start_pool`].
  pub fn shutdown_pool(&self) {
    debug!(pool_name = %self.name, "Logical pool shut down for processing.");
    self.shutdown.store(true, Ordering::Release);
  }

  pub fn start_pool(&self) {
    debug!(pool_name = %self.name, "Logical pool started.");
    self.shutdown.store(false, Ordering::Release);
  }

  fn check_pool_status(&self) -> Result<(), LogicalPoolError> {
    if self.is_shutdown() {
      return Err(LogicalPoolError::Shutdown(self.name.clone()));
    }
    Ok(())
  }

  /// Takes a slot if one is free right now.
  pub fn try_acquire(&self) -> Result<bool, LogicalPoolError> {
    self.check_pool_status()?;
    if self.max == 0 {
      return Ok(true);
    }
    match self.semaphore.try_acquire() {
      Ok(permit) => {
        permit.forget();
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(true)
      }
      Err(_) => Ok(false),
    }
  }

  /// Waits up to `timeout` for a slot.
  pub async fn acquire_timeout(&self, timeout: Duration) -> Result<bool, LogicalPoolError> {
    self.check_pool_status()?;
    if self.max == 0 {
      return Ok(true);
    }
    match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
      Ok(Ok(permit)) => {
        permit.forget();
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(true)
      }
      Ok(Err(_)) => Err(LogicalPoolError::Shutdown(self.name.clone())),
      Err(_) => Ok(false),
    }
  }

  /// Gives a slot back. Does nothing if no slot is held.
  pub fn release(&self) {
    if self.max == 0 {
      return;
    }
    let released = self
      .in_use
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(1))
      .is_ok();
    if released {
      self.semaphore.add_permits(1);
      trace!(pool_name = %self.name, current = self.current(), "Logical pool slot released.");
    } else {
      trace!(pool_name = %self.name, "Release with no slot held. Ignored.");
    }
  }

  /// Waits for a slot using the configured interval and attempt budget.
  pub async fn wait_access(&self) -> Result<(), LogicalPoolError> {
    self
      .wait_access_with(self.settings.wait_interval(), self.settings.max_wait_intervals)
      .await
  }

  /// Retries [`LogicalThreadPool::acquire_timeout`] every `interval`.
  ///
  /// Running out of attempts is an error: callers treat this gate as mandatory.
  pub async fn wait_access_with(&self, interval: Duration, max_attempts: u32) -> Result<(), LogicalPoolError> {
    self.check_pool_status()?;
    let mut attempts: u32 = 0;
    while !self.acquire_timeout(interval).await? {
      attempts += 1;
      debug!(pool_name = %self.name, max = self.max, current = self.current(), attempts, "Waiting for logical pool.");
      if attempts >= max_attempts {
        warn!(pool_name = %self.name, attempts, "Maximum attempts to get a slot exceeded.");
        return Err(LogicalPoolError::WaitExhausted {
          name: self.name.clone(),
          attempts,
        });
      }
    }
    trace!(pool_name = %self.name, "Slot is available in logical pool.");
    Ok(())
  }
}
