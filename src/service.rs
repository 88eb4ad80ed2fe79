//! Service invocation helper.
//!
//! Wraps a caller supplied action in one of four policies: synchronous or
//! asynchronous, cached or not. Asynchronous cached calls are deduplicated
//! through an in-progress marker kept in a second cache under
//! `"{cache-name}-{key}"`.

use crate::cache::{CacheManager, SharedCache};
use crate::config::ServiceSettings;
use crate::error::{CacheError, PoolError, ServiceError, TaskError};
use crate::future::{CachePollingFuture, PoolFuture, TaskFuture, TrackedTask};
use crate::result::{ResultCarrier, ResultHolder, ServiceFailure};
use crate::task_master::TaskMaster;

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

/// Name of the result cache used when the caller does not pick one.
pub const DEFAULT_RESULT_CACHE_NAME: &str = "service-result-holder";
/// Name of the cache holding in-progress markers.
pub const IN_PROGRESS_CACHE_NAME: &str = "service-in-progress";

lazy_static::lazy_static! {
  static ref NEXT_EXECUTION_ID: AtomicU64 = AtomicU64::new(1);
}

/// The unit of work the helper runs on behalf of a caller.
pub trait ServiceAction<S, T>: Send + Sync + 'static {
  type Error: StdError + Send + Sync + 'static;

  fn service(&self, criteria: &S) -> Result<T, Self::Error>;
}

impl<S, T, E, F> ServiceAction<S, T> for F
where
  F: Fn(&S) -> Result<T, E> + Send + Sync + 'static,
  E: StdError + Send + Sync + 'static,
{
  type Error = E;

  fn service(&self, criteria: &S) -> Result<T, E> {
    self(criteria)
  }
}

/// Selects the policy used by [`ServiceHelper::call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
  Sync,
  Async,
  /// Evicts the cached entry, then behaves like `Sync`.
  SyncRefresh,
  /// Evicts the cached entry, then behaves like `Async`.
  AsyncRefresh,
}

impl CallType {
  pub fn is_async(&self) -> bool {
    matches!(self, CallType::Async | CallType::AsyncRefresh)
  }

  pub fn is_refresh(&self) -> bool {
    matches!(self, CallType::SyncRefresh | CallType::AsyncRefresh)
  }
}

/// Per-call options: which pool runs asynchronous work and whether failures
/// are cached like successes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
  pool: Option<String>,
  cache_failures: bool,
}

impl CallOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_pool(mut self, pool: &str) -> Self {
    self.pool = Some(pool.to_string());
    self
  }

  pub fn with_cache_failures(mut self, cache_failures: bool) -> Self {
    self.cache_failures = cache_failures;
    self
  }

  pub fn pool(&self) -> Option<&str> {
    self.pool.as_deref()
  }

  pub fn cache_failures(&self) -> bool {
    self.cache_failures
  }
}

/// Records that an execution for a (cache, key) pair is in flight.
#[derive(Clone)]
pub struct InProgressMarker {
  execution_id: u64,
  task: Arc<dyn TrackedTask>,
  future: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for InProgressMarker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InProgressMarker")
      .field("execution_id", &self.execution_id)
      .field("task_id", &self.task.task_id())
      .field("done", &self.task.is_done())
      .finish()
  }
}

impl InProgressMarker {
  fn new<S, T>(execution_id: u64, future: PoolFuture<ResultHolder<S, T>>) -> Self
  where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
  {
    Self {
      execution_id,
      task: Arc::new(future.clone()),
      future: Arc::new(future),
    }
  }

  pub fn execution_id(&self) -> u64 {
    self.execution_id
  }

  pub fn task(&self) -> &Arc<dyn TrackedTask> {
    &self.task
  }

  fn future<S, T>(&self) -> Option<&PoolFuture<ResultHolder<S, T>>>
  where
    S: 'static,
    T: 'static,
  {
    self.future.downcast_ref::<PoolFuture<ResultHolder<S, T>>>()
  }
}

/// Key of the in-progress marker for `key` in the cache called `cache_name`.
pub fn processing_key(cache_name: &str, key: &str) -> String {
  format!("{}-{}", cache_name, key)
}

fn require_key(key: &str) -> Result<(), ServiceError> {
  if key.trim().is_empty() {
    return Err(ServiceError::InvalidArgument("A cache key must be provided.".to_string()));
  }
  Ok(())
}

/// Runs service actions under the sync/async and cached/uncached policies.
pub struct ServiceHelper {
  task_master: TaskMaster,
  caches: Arc<CacheManager>,
  settings: ServiceSettings,
  in_progress: SharedCache<InProgressMarker>,
  // Guards check-marker/submit/write-marker, the completion side-effect and
  // the poll accessor so they never interleave.
  coordination: Arc<Mutex<()>>,
}

impl fmt::Debug for ServiceHelper {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServiceHelper")
      .field("settings", &self.settings)
      .field("in_progress", &self.in_progress.len())
      .finish()
  }
}

impl ServiceHelper {
  pub fn new(task_master: TaskMaster, caches: Arc<CacheManager>, settings: ServiceSettings) -> Result<Self, CacheError> {
    let in_progress =
      caches.get_or_create::<InProgressMarker>(IN_PROGRESS_CACHE_NAME, settings.in_progress_duration.as_duration())?;
    Ok(Self {
      task_master,
      caches,
      settings,
      in_progress,
      coordination: Arc::new(Mutex::new(())),
    })
  }

  pub fn task_master(&self) -> &TaskMaster {
    &self.task_master
  }

  pub fn cache_manager(&self) -> &Arc<CacheManager> {
    &self.caches
  }

  pub fn settings(&self) -> &ServiceSettings {
    &self.settings
  }

  pub fn in_progress_cache(&self) -> &SharedCache<InProgressMarker> {
    &self.in_progress
  }

  /// The shared default result cache, with the configured result duration.
  ///
  /// A cache name is bound to one holder type; use [`ServiceHelper::result_cache`]
  /// for other criteria or value types.
  pub fn default_result_cache<S, T>(&self) -> Result<SharedCache<ResultHolder<S, T>>, ServiceError>
  where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
  {
    self.result_cache(DEFAULT_RESULT_CACHE_NAME)
  }

  pub fn result_cache<S, T>(&self, name: &str) -> Result<SharedCache<ResultHolder<S, T>>, ServiceError>
  where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
  {
    self.result_cache_with_duration(name, self.settings.result_cache_duration.as_duration())
  }

  pub fn result_cache_with_duration<S, T>(
    &self,
    name: &str,
    duration: Duration,
  ) -> Result<SharedCache<ResultHolder<S, T>>, ServiceError>
  where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
  {
    if name.trim().is_empty() {
      return Err(ServiceError::InvalidArgument("A cache name must be provided.".to_string()));
    }
    Ok(self.caches.get_or_create::<ResultHolder<S, T>>(name, duration)?)
  }

  fn run_action<S, T, A>(action: &A, criteria: &S) -> Result<T, ServiceFailure>
  where
    A: ServiceAction<S, T>,
  {
    match std::panic::catch_unwind(AssertUnwindSafe(|| action.service(criteria))) {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(error)) => Err(ServiceFailure::from_error(error)),
      Err(payload) => Err(ServiceFailure::from_panic(payload)),
    }
  }

  /// Runs `action` inline. Failures and panics come back inside the holder.
  pub fn invoke<S, T, A>(&self, criteria: S, action: &A) -> ResultHolder<S, T>
  where
    A: ServiceAction<S, T>,
  {
    match Self::run_action(action, &criteria) {
      Ok(value) => ResultHolder::success(criteria, value),
      Err(failure) => {
        debug!(failure = %failure, "Service action failed.");
        ResultHolder::failure(criteria, failure)
      }
    }
  }

  /// Returns a usable cached holder for `key`, or runs `action` inline and
  /// caches the outcome when it is usable.
  pub fn invoke_cached<S, T, A>(
    &self,
    cache: &SharedCache<ResultHolder<S, T>>,
    key: &str,
    criteria: S,
    action: &A,
    cache_failures: bool,
  ) -> Result<ResultHolder<S, T>, ServiceError>
  where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    A: ServiceAction<S, T>,
  {
    require_key(key)?;
    if let Some(cached) = cache.get(key).filter(|holder| holder.is_cacheable(cache_failures)) {
      debug!(cache = %cache.name(), %key, "Cached service call already in cache.");
      return Ok(cached);
    }

    let holder = self.invoke(criteria, action);
    if holder.is_cacheable(cache_failures) {
      cache.put(key, holder.clone());
    }
    Ok(holder)
  }

  fn carrier_work<S, T, A>(action: A) -> impl FnOnce(&mut ResultCarrier<S, T>) + Send + 'static
  where
    S: Send + 'static,
    T: Send + 'static,
    A: ServiceAction<S, T>,
  {
    move |carrier: &mut ResultCarrier<S, T>| {
      let outcome = Self::run_action(&action, carrier.meta());
      match outcome {
        Ok(value) => {
          carrier.set_result(value);
        }
        Err(failure) => {
          carrier.set_failure(failure);
        }
      }
    }
  }

  /// Submits `action` to a pool and returns its future right away.
  pub fn submit_async<S, T, A>(
    &self,
    criteria: S,
    action: A,
    pool: Option<&str>,
  ) -> Result<TaskFuture<ResultHolder<S, T>>, ServiceError>
  where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    A: ServiceAction<S, T>,
  {
    let carrier = ResultCarrier::new(criteria);
    Ok(self.task_master.submit(Self::carrier_work(action), carrier, pool)?)
  }

  /// Asynchronous cached call with deduplication.
  ///
  /// Returns an `Immediate` future for a usable cached holder, a
  /// `CachePolling` future when deduplication is on and another execution for
  /// the key is still running, and otherwise a `PoolBacked` future for a new
  /// execution. The new execution publishes its holder to `cache` (when
  /// usable) before its future completes.
  pub fn submit_async_cached<S, T, A>(
    &self,
    cache: &SharedCache<ResultHolder<S, T>>,
    key: &str,
    criteria: S,
    action: A,
    options: &CallOptions,
  ) -> Result<TaskFuture<ResultHolder<S, T>>, ServiceError>
  where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    A: ServiceAction<S, T>,
  {
    require_key(key)?;
    let cache_failures = options.cache_failures();
    if let Some(cached) = self.usable_cached(cache, key, cache_failures) {
      return Ok(TaskFuture::Immediate(cached));
    }

    let processing_key = processing_key(cache.name(), key);
    let _guard = self.coordination.lock();

    // An execution may have published while we waited for the lock.
    if let Some(cached) = self.usable_cached(cache, key, cache_failures) {
      return Ok(TaskFuture::Immediate(cached));
    }

    if let Some(marker) = self.in_progress.get(&processing_key) {
      if !marker.task.is_done() {
        if self.settings.in_progress_enabled {
          debug!(cache = %cache.name(), %key, execution_id = marker.execution_id, "Async service call is already processing. Polling the cache instead.");
          return Ok(TaskFuture::CachePolling(CachePollingFuture::new(
            cache.clone(),
            key,
            Some(self.caches.clone()),
          )));
        }
      } else {
        debug!(cache = %cache.name(), %key, execution_id = marker.execution_id, "Clearing marker of a finished execution.");
        self.in_progress.remove(&processing_key);
      }
    }

    let execution_id = NEXT_EXECUTION_ID.fetch_add(1, Ordering::Relaxed);
    let on_complete = {
      let cache = cache.clone();
      let in_progress = self.in_progress.clone();
      let coordination = self.coordination.clone();
      let key = key.to_string();
      let processing_key = processing_key.clone();
      move |holder: &ResultHolder<S, T>| {
        let _guard = coordination.lock();
        if holder.is_cacheable(cache_failures) {
          cache.put(&key, holder.clone());
          in_progress.remove_if(&processing_key, &|marker: &InProgressMarker| marker.execution_id == execution_id);
          trace!(cache = %cache.name(), %key, execution_id, "Published result and cleared marker.");
        } else {
          // Left for the poll accessor to hand out.
          trace!(cache = %cache.name(), %key, execution_id, "Result not cacheable. Marker kept for polling.");
        }
      }
    };

    let carrier = ResultCarrier::new(criteria);
    let future =
      self
        .task_master
        .submit_with_completion(Self::carrier_work(action), carrier, options.pool(), on_complete)?;
    self
      .in_progress
      .put(&processing_key, InProgressMarker::new(execution_id, future.clone()));
    debug!(cache = %cache.name(), %key, execution_id, task_id = future.id(), "Async service call submitted.");
    Ok(TaskFuture::PoolBacked(future))
  }

  fn usable_cached<S, T>(
    &self,
    cache: &SharedCache<ResultHolder<S, T>>,
    key: &str,
    cache_failures: bool,
  ) -> Option<ResultHolder<S, T>>
  where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
  {
    let cached = cache.get(key)?;
    if cached.is_cacheable(cache_failures) {
      debug!(cache = %cache.name(), %key, "Async service call already in cache.");
      Some(cached)
    } else {
      None
    }
  }

  /// Dispatches on `call_type`. Refresh variants evict the cached entry first.
  /// Synchronous results come back as `Immediate` futures.
  pub fn call<S, T, A>(
    &self,
    cache: &SharedCache<ResultHolder<S, T>>,
    key: &str,
    criteria: S,
    action: A,
    call_type: CallType,
    options: &CallOptions,
  ) -> Result<TaskFuture<ResultHolder<S, T>>, ServiceError>
  where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    A: ServiceAction<S, T>,
  {
    require_key(key)?;
    if call_type.is_refresh() {
      trace!(cache = %cache.name(), %key, "Refresh requested. Evicting cached entry.");
      cache.remove(key);
    }
    if call_type.is_async() {
      self.submit_async_cached(cache, key, criteria, action, options)
    } else {
      let holder = self.invoke_cached(cache, key, criteria, &action, options.cache_failures())?;
      Ok(TaskFuture::Immediate(holder))
    }
  }

  /// Polls the outcome of an asynchronous cached call by key.
  ///
  /// `Ok(None)` means still running. A finished execution's holder is handed
  /// out once: it is published (when usable) and its marker cleared in the
  /// same critical section. With no marker and nothing cached the execution
  /// state was lost, which is an error rather than "pending".
  pub fn check_async_result<S, T>(
    &self,
    cache: &SharedCache<ResultHolder<S, T>>,
    key: &str,
    cache_failures: bool,
  ) -> Result<Option<ResultHolder<S, T>>, ServiceError>
  where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
  {
    require_key(key)?;
    let processing_key = processing_key(cache.name(), key);
    let _guard = self.coordination.lock();

    let Some(marker) = self.in_progress.get(&processing_key) else {
      return match cache.get(key) {
        Some(cached) => Ok(Some(cached)),
        None => Err(ServiceError::LostExecution {
          cache: cache.name().to_string(),
          key: key.to_string(),
        }),
      };
    };

    if !marker.task.is_done() {
      trace!(cache = %cache.name(), %key, "Async service call still processing.");
      return Ok(None);
    }

    self.in_progress.remove(&processing_key);
    if marker.task.is_cancelled() {
      debug!(cache = %cache.name(), %key, "Async service call was cancelled.");
      return Err(ServiceError::Cancelled {
        cache: cache.name().to_string(),
        key: key.to_string(),
      });
    }

    let future = marker.future::<S, T>().ok_or_else(|| CacheError::IncompatibleType {
      name: cache.name().to_string(),
    })?;
    let holder = match future.try_get() {
      Some(Ok(holder)) => holder,
      Some(Err(error)) => return Err(TaskError::from(error).into()),
      None => return Err(TaskError::from(PoolError::TaskCancelled).into()),
    };
    if holder.is_cacheable(cache_failures) {
      cache.put_if_absent(key, holder.clone());
    }
    Ok(Some(holder))
  }

  /// Submits unless a result or execution already exists, then reports what is
  /// known now: the holder if one is available, `None` while still running.
  pub fn fetch_async_cached<S, T, A>(
    &self,
    cache: &SharedCache<ResultHolder<S, T>>,
    key: &str,
    criteria: S,
    action: A,
    options: &CallOptions,
  ) -> Result<Option<ResultHolder<S, T>>, ServiceError>
  where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    A: ServiceAction<S, T>,
  {
    match self.submit_async_cached(cache, key, criteria, action, options)? {
      TaskFuture::Immediate(holder) => Ok(Some(holder)),
      TaskFuture::CachePolling(_) => self.check_async_result(cache, key, options.cache_failures()),
      TaskFuture::PoolBacked(_) => Ok(None),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_call_type_flags() {
    assert!(CallType::AsyncRefresh.is_async());
    assert!(CallType::AsyncRefresh.is_refresh());
    assert!(!CallType::Sync.is_async());
    assert!(!CallType::Async.is_refresh());
    assert!(CallType::SyncRefresh.is_refresh());
  }

  #[test]
  fn test_processing_key_format() {
    assert_eq!(processing_key("orders", "K1"), "orders-K1");
  }

  #[test]
  fn test_call_options_builder() {
    let options = CallOptions::new().with_pool("reports").with_cache_failures(true);
    assert_eq!(options.pool(), Some("reports"));
    assert!(options.cache_failures());
    assert_eq!(CallOptions::default().pool(), None);
  }
}
