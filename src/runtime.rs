use crate::cache::CacheManager;
use crate::config::TaskMasterConfig;
use crate::error::{CacheError, PoolError};
use crate::logical::LogicalThreadPool;
use crate::registry::PoolRegistry;
use crate::service::ServiceHelper;
use crate::task_master::TaskMaster;

use std::sync::Arc;

use tokio::runtime::Handle as TokioHandle;
use tracing::info;

/// The process-wide context: pools, caches and the service helper built from
/// one configuration.
///
/// Hosts that want to swap a part can build [`TaskMaster`], [`CacheManager`]
/// and [`ServiceHelper`] themselves instead.
#[derive(Debug)]
pub struct ServiceRuntime {
  config: TaskMasterConfig,
  task_master: TaskMaster,
  caches: Arc<CacheManager>,
  service: ServiceHelper,
}

impl ServiceRuntime {
  pub fn new(config: TaskMasterConfig, tokio_handle: TokioHandle) -> Result<Self, CacheError> {
    let registry = Arc::new(PoolRegistry::new(config.clone(), tokio_handle));
    let task_master = TaskMaster::with_registry(registry);
    let caches = Arc::new(CacheManager::new(config.caches.clone()));
    let service = ServiceHelper::new(task_master.clone(), caches.clone(), config.service.clone())?;
    info!(pools = ?task_master.registry().pool_names(), in_progress_enabled = config.service.in_progress_enabled, "Service runtime ready.");
    Ok(Self {
      config,
      task_master,
      caches,
      service,
    })
  }

  pub fn config(&self) -> &TaskMasterConfig {
    &self.config
  }

  pub fn task_master(&self) -> &TaskMaster {
    &self.task_master
  }

  pub fn registry(&self) -> &Arc<PoolRegistry> {
    self.task_master.registry()
  }

  pub fn caches(&self) -> &Arc<CacheManager> {
    &self.caches
  }

  pub fn service(&self) -> &ServiceHelper {
    &self.service
  }

  /// A logical pool using the configured wait interval and attempt budget.
  pub fn logical_pool(&self, name: Option<&str>, max: i64) -> LogicalThreadPool {
    LogicalThreadPool::with_settings(name, max, self.config.logical.clone())
  }

  /// Gracefully shuts down every pool, then releases every cache.
  pub async fn shutdown(&self) -> Result<(), PoolError> {
    let outcome = self.task_master.shutdown().await;
    self.caches.release();
    outcome
  }

  /// Cancels running tasks while shutting down, then releases every cache.
  pub async fn shutdown_now(&self) -> Result<(), PoolError> {
    let outcome = self.task_master.shutdown_now().await;
    self.caches.release();
    outcome
  }
}
