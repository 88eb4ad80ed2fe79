use crate::cache::{CacheManager, SharedCache};
use crate::error::{CacheError, PoolError, TaskError};
use crate::task::CompletionSink;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Single-assignment outcome slot shared between a running task and its futures.
///
/// Cancellation and a normal completion race through [`TaskState::claim`]:
/// only the winner may publish, so a cancelled task never runs its completion
/// side effect and a completing task cannot be reported as cancelled.
pub(crate) struct TaskState<T> {
  claimed: AtomicBool,
  outcome: OnceLock<Result<T, PoolError>>,
  notify: Notify,
}

impl<T: Clone + Send + Sync + 'static> TaskState<T> {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      claimed: AtomicBool::new(false),
      outcome: OnceLock::new(),
      notify: Notify::new(),
    })
  }

  /// Reserves the right to publish the outcome. True for the first caller only.
  pub(crate) fn claim(&self) -> bool {
    self
      .claimed
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  /// Publishes the outcome. Later calls are ignored. Returns true if this call won.
  ///
  /// Also takes the claim, so a completed task can no longer be cancelled.
  pub(crate) fn complete(&self, outcome: Result<T, PoolError>) -> bool {
    self.claimed.store(true, Ordering::Release);
    let won = self.outcome.set(outcome).is_ok();
    if won {
      self.notify.notify_waiters();
    }
    won
  }

  fn peek(&self) -> Option<&Result<T, PoolError>> {
    self.outcome.get()
  }

  async fn wait(&self) -> Result<T, PoolError> {
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if let Some(outcome) = self.peek() {
        return outcome.clone();
      }
      notified.await;
    }
  }
}

impl<T: Clone + Send + Sync + 'static> CompletionSink for TaskState<T> {
  fn abort(&self, error: PoolError) {
    self.complete(Err(error));
  }

  fn cancel(&self) {
    if self.claim() {
      self.complete(Err(PoolError::TaskCancelled));
    }
  }
}

/// Minimal view of an in-flight task, used by in-progress markers.
pub trait TrackedTask: Send + Sync {
  fn task_id(&self) -> u64;
  fn is_done(&self) -> bool;
  fn is_cancelled(&self) -> bool;
  fn cancel(&self) -> bool;
}

/// Future for a task running in a named worker pool.
pub struct PoolFuture<T> {
  task_id: u64,
  pool_name: Arc<String>,
  token: CancellationToken,
  state: Arc<TaskState<T>>,
}

impl<T> Clone for PoolFuture<T> {
  fn clone(&self) -> Self {
    Self {
      task_id: self.task_id,
      pool_name: self.pool_name.clone(),
      token: self.token.clone(),
      state: self.state.clone(),
    }
  }
}

impl<T> fmt::Debug for PoolFuture<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolFuture")
      .field("task_id", &self.task_id)
      .field("pool_name", &self.pool_name)
      .field("done", &self.state.outcome.get().is_some())
      .finish()
  }
}

impl<T: Clone + Send + Sync + 'static> PoolFuture<T> {
  pub(crate) fn new(task_id: u64, pool_name: Arc<String>, token: CancellationToken, state: Arc<TaskState<T>>) -> Self {
    Self {
      task_id,
      pool_name,
      token,
      state,
    }
  }

  pub fn id(&self) -> u64 {
    self.task_id
  }

  pub fn pool_name(&self) -> &str {
    &self.pool_name
  }

  /// Requests cancellation. Returns false if the task already completed or
  /// is publishing its outcome.
  ///
  /// Cancellation is best-effort: the future reports `TaskCancelled` at once,
  /// but work already running on a blocking thread keeps its pool slot until
  /// it returns, and its outcome is discarded.
  pub fn cancel(&self) -> bool {
    if !self.state.claim() {
      return false;
    }
    debug!(pool_name = %self.pool_name, task_id = %self.task_id, "PoolFuture: Cancellation requested.");
    self.state.complete(Err(PoolError::TaskCancelled));
    self.token.cancel();
    true
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self.state.peek(), Some(Err(PoolError::TaskCancelled)))
  }

  pub fn is_done(&self) -> bool {
    self.state.peek().is_some()
  }

  /// The outcome if the task has finished, without waiting.
  pub fn try_get(&self) -> Option<Result<T, PoolError>> {
    self.state.peek().cloned()
  }

  /// Waits for the task and returns its value or the cause of its failure.
  pub async fn get(&self) -> Result<T, PoolError> {
    self.state.wait().await
  }

  pub async fn get_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
    match tokio::time::timeout(timeout, self.state.wait()).await {
      Ok(outcome) => Ok(outcome?),
      Err(_) => Err(TaskError::Timeout(timeout)),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> TrackedTask for PoolFuture<T> {
  fn task_id(&self) -> u64 {
    self.task_id
  }

  fn is_done(&self) -> bool {
    PoolFuture::is_done(self)
  }

  fn is_cancelled(&self) -> bool {
    PoolFuture::is_cancelled(self)
  }

  fn cancel(&self) -> bool {
    PoolFuture::cancel(self)
  }
}

/// Future that waits for another caller's execution to publish into a cache.
///
/// It refers to its cache by name. The live handle and the resolver are not
/// serialized; after deserialization call [`CachePollingFuture::attach`] and the
/// cache is looked up by name on first use. The cache must already exist with
/// the same value type; it is never created here.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct CachePollingFuture<T> {
  cache_name: String,
  key: String,
  #[serde(skip)]
  resolver: Option<Arc<CacheManager>>,
  #[serde(skip)]
  cache: OnceLock<SharedCache<T>>,
  #[serde(skip)]
  result: OnceLock<T>,
}

impl<T: Clone> Clone for CachePollingFuture<T> {
  fn clone(&self) -> Self {
    Self {
      cache_name: self.cache_name.clone(),
      key: self.key.clone(),
      resolver: self.resolver.clone(),
      cache: self.cache.clone(),
      result: self.result.clone(),
    }
  }
}

impl<T> fmt::Debug for CachePollingFuture<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CachePollingFuture")
      .field("cache_name", &self.cache_name)
      .field("key", &self.key)
      .field("attached", &(self.resolver.is_some() || self.cache.get().is_some()))
      .field("done", &self.result.get().is_some())
      .finish()
  }
}

impl<T: Clone + Send + Sync + 'static> CachePollingFuture<T> {
  pub fn new(cache: SharedCache<T>, key: &str, resolver: Option<Arc<CacheManager>>) -> Self {
    let cache_name = cache.name().to_string();
    let cell = OnceLock::new();
    let _ = cell.set(cache);
    Self {
      cache_name,
      key: key.to_string(),
      resolver,
      cache: cell,
      result: OnceLock::new(),
    }
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  /// Supplies the manager used to find the cache again after a boundary crossing.
  pub fn attach(&mut self, resolver: Arc<CacheManager>) {
    self.resolver = Some(resolver);
  }

  fn resolve_cache(&self) -> Result<&SharedCache<T>, CacheError> {
    if let Some(cache) = self.cache.get() {
      return Ok(cache);
    }
    let resolver = self
      .resolver
      .as_ref()
      .ok_or_else(|| CacheError::Detached(self.cache_name.clone()))?;
    trace!(cache = %self.cache_name, "Re-acquiring cache handle by name.");
    let cache = resolver.existing::<T>(&self.cache_name)?;
    Ok(self.cache.get_or_init(|| cache))
  }

  /// Polls the cache. `Ok(None)` means nothing has been published yet.
  pub fn try_get(&self) -> Result<Option<T>, CacheError> {
    if let Some(result) = self.result.get() {
      return Ok(Some(result.clone()));
    }
    let cache = self.resolve_cache()?;
    match cache.get(&self.key) {
      Some(value) => Ok(Some(self.result.get_or_init(|| value).clone())),
      None => Ok(None),
    }
  }

  pub fn is_done(&self) -> bool {
    matches!(self.try_get(), Ok(Some(_)))
  }
}

/// Poll/wait/cancel handle for asynchronous work.
///
/// All variants share one contract; they differ in where the value comes from.
#[derive(Clone)]
pub enum TaskFuture<T> {
  /// A value known up front, e.g. a cache hit.
  Immediate(T),
  /// Work running in a named pool.
  PoolBacked(PoolFuture<T>),
  /// Work running elsewhere whose result will be published to a cache.
  CachePolling(CachePollingFuture<T>),
}

impl<T> fmt::Debug for TaskFuture<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskFuture::Immediate(_) => f.write_str("TaskFuture::Immediate"),
      TaskFuture::PoolBacked(future) => f.debug_tuple("TaskFuture::PoolBacked").field(future).finish(),
      TaskFuture::CachePolling(future) => f.debug_tuple("TaskFuture::CachePolling").field(future).finish(),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> TaskFuture<T> {
  /// Only pool-backed work can be cancelled; other variants always return false.
  pub fn cancel(&self) -> bool {
    match self {
      TaskFuture::PoolBacked(future) => future.cancel(),
      TaskFuture::Immediate(_) | TaskFuture::CachePolling(_) => false,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    match self {
      TaskFuture::PoolBacked(future) => future.is_cancelled(),
      TaskFuture::Immediate(_) | TaskFuture::CachePolling(_) => false,
    }
  }

  pub fn is_done(&self) -> bool {
    match self {
      TaskFuture::Immediate(_) => true,
      TaskFuture::PoolBacked(future) => future.is_done(),
      TaskFuture::CachePolling(future) => future.is_done(),
    }
  }

  /// Returns the value if it is available now, without waiting.
  pub fn try_get(&self) -> Result<Option<T>, TaskError> {
    match self {
      TaskFuture::Immediate(value) => Ok(Some(value.clone())),
      TaskFuture::PoolBacked(future) => Ok(future.try_get().transpose()?),
      TaskFuture::CachePolling(future) => Ok(future.try_get()?),
    }
  }

  /// Waits for pool-backed work; polls once for the other variants.
  ///
  /// `Ok(None)` is only returned by a cache-polling future whose result has
  /// not been published yet.
  pub async fn get(&self) -> Result<Option<T>, TaskError> {
    match self {
      TaskFuture::PoolBacked(future) => Ok(Some(future.get().await?)),
      _ => self.try_get(),
    }
  }

  /// Like [`TaskFuture::get`] but gives up on pool-backed work after `timeout`.
  pub async fn get_timeout(&self, timeout: Duration) -> Result<Option<T>, TaskError> {
    match self {
      TaskFuture::PoolBacked(future) => Ok(Some(future.get_timeout(timeout).await?)),
      _ => self.try_get(),
    }
  }

  pub fn as_pool_future(&self) -> Option<&PoolFuture<T>> {
    match self {
      TaskFuture::PoolBacked(future) => Some(future),
      _ => None,
    }
  }

  pub fn is_immediate(&self) -> bool {
    matches!(self, TaskFuture::Immediate(_))
  }

  pub fn is_pool_backed(&self) -> bool {
    matches!(self, TaskFuture::PoolBacked(_))
  }

  pub fn is_cache_polling(&self) -> bool {
    matches!(self, TaskFuture::CachePolling(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pool_future(state: Arc<TaskState<u32>>) -> PoolFuture<u32> {
    PoolFuture::new(7, Arc::new("unit".to_string()), CancellationToken::new(), state)
  }

  #[tokio::test]
  async fn test_pool_future_waits_for_outcome() {
    let state = TaskState::<u32>::new();
    let future = pool_future(state.clone());
    assert!(!future.is_done());
    assert_eq!(future.try_get(), None);

    let waiter = {
      let future = future.clone();
      tokio::spawn(async move { future.get().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(state.complete(Ok(42)));
    assert!(!state.complete(Ok(43)));

    assert_eq!(waiter.await.unwrap(), Ok(42));
    assert!(future.is_done());
    assert!(!future.cancel());
  }

  #[tokio::test]
  async fn test_pool_future_cancel_and_timeout() {
    let future = pool_future(TaskState::new());
    assert_eq!(
      future.get_timeout(Duration::from_millis(10)).await,
      Err(TaskError::Timeout(Duration::from_millis(10)))
    );
    assert!(future.cancel());
    assert!(future.is_cancelled());
    assert!(future.is_done());
    assert_eq!(future.get().await, Err(PoolError::TaskCancelled));
  }

  #[tokio::test]
  async fn test_cancel_and_completion_share_one_claim() {
    let publishing = TaskState::<u32>::new();
    let future = pool_future(publishing.clone());
    assert!(publishing.claim());
    assert!(!future.cancel(), "A publishing task cannot be cancelled");
    assert!(!future.is_done());
    assert!(publishing.complete(Ok(5)));
    assert_eq!(future.get().await, Ok(5));

    let cancelled = TaskState::<u32>::new();
    let future = pool_future(cancelled.clone());
    assert!(future.cancel());
    assert!(!cancelled.claim(), "A cancelled task must not publish");
    CompletionSink::cancel(cancelled.as_ref());
    assert_eq!(future.get().await, Err(PoolError::TaskCancelled));
  }

  #[tokio::test]
  async fn test_immediate_never_cancels() {
    let future = TaskFuture::Immediate("ready".to_string());
    assert!(future.is_done());
    assert!(!future.cancel());
    assert!(!future.is_cancelled());
    assert_eq!(future.get().await, Ok(Some("ready".to_string())));
  }

  #[tokio::test]
  async fn test_cache_polling_survives_serialization() {
    let manager = Arc::new(CacheManager::default());
    let cache = manager.get_or_create::<String>("polled", Duration::from_secs(60)).unwrap();
    let original = CachePollingFuture::new(cache.clone(), "k", Some(manager.clone()));
    assert!(!original.is_done());

    let json = serde_json::to_string(&original).unwrap();
    let mut restored: CachePollingFuture<String> = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.try_get(), Err(CacheError::Detached("polled".to_string())));

    restored.attach(manager.clone());
    let future = TaskFuture::CachePolling(restored);
    assert_eq!(future.get().await, Ok(None));
    assert!(!future.cancel());

    cache.put("k", "published".to_string());
    assert!(future.is_done());
    assert_eq!(future.get().await, Ok(Some("published".to_string())));
  }

  #[test]
  fn test_cache_polling_never_creates_cache() {
    let manager = Arc::new(CacheManager::default());
    let json = r#"{"cache_name":"absent","key":"k"}"#;
    let mut restored: CachePollingFuture<String> = serde_json::from_str(json).unwrap();
    restored.attach(manager.clone());
    assert_eq!(restored.try_get(), Err(CacheError::NotFound("absent".to_string())));
    assert!(!manager.contains("absent"));
  }
}
