//! Named Tokio-backed worker pools with cached, deduplicated service
//! invocation and semaphore based logical pools.
//!
//! [`ServiceRuntime`] wires everything from one [`TaskMasterConfig`]:
//! a [`TaskMaster`] over a [`PoolRegistry`] of [`WorkerPool`]s, a
//! [`CacheManager`] of named TTL caches, and a [`ServiceHelper`] that runs
//! [`ServiceAction`]s synchronously or asynchronously, cached or not.

mod cache;
mod config;
mod error;
mod future;
mod logical;
mod pool;
mod registry;
mod result;
mod runtime;
mod service;
mod task;
mod task_master;
mod task_queue;

pub use cache::{CacheManager, CacheStore, SharedCache, TtlCache};
pub use config::{
  CacheSettings, DurationSetting, LogicalPoolSettings, NamedCacheSettings, PoolDescriptor, PoolKind, PoolSettings,
  QueuePolicy, ServiceSettings, TaskMasterConfig, TimeUnit, DEFAULT_MAX_THREADS, DEFAULT_POOL_NAME,
};
pub use error::{CacheError, ConfigError, LogicalPoolError, PoolError, ServiceError, TaskError};
pub use future::{CachePollingFuture, PoolFuture, TaskFuture, TrackedTask};
pub use logical::LogicalThreadPool;
pub use pool::{ShutdownMode, WorkerPool};
pub use registry::PoolRegistry;
pub use result::{ResultCarrier, ResultHolder, ServiceFailure};
pub use runtime::ServiceRuntime;
pub use service::{
  processing_key, CallOptions, CallType, InProgressMarker, ServiceAction, ServiceHelper, DEFAULT_RESULT_CACHE_NAME,
  IN_PROGRESS_CACHE_NAME,
};
pub use task_master::{ResultSlot, TaskMaster};
