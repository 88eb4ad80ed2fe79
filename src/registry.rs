//! Named pool registry.

use crate::config::TaskMasterConfig;
use crate::error::PoolError;
use crate::pool::{ShutdownMode, WorkerPool};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owns every named pool of the process and rebuilds pools that terminated.
pub struct PoolRegistry {
  config: TaskMasterConfig,
  tokio_handle: TokioHandle,
  pools: Mutex<HashMap<String, Arc<WorkerPool>>>,
}

impl std::fmt::Debug for PoolRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PoolRegistry")
      .field("default_pool", &self.config.default_pool)
      .field("pools", &self.pool_names())
      .finish()
  }
}

impl PoolRegistry {
  /// Builds every configured pool (the listed names plus the default pool).
  pub fn new(config: TaskMasterConfig, tokio_handle: TokioHandle) -> Self {
    let mut pools = HashMap::new();
    for name in config.configured_pools() {
      let pool = WorkerPool::new(config.descriptor(&name), tokio_handle.clone());
      pools.insert(name, pool);
    }
    info!(default_pool = %config.default_pool, count = pools.len(), "Pool registry initialized.");
    Self {
      config,
      tokio_handle,
      pools: Mutex::new(pools),
    }
  }

  pub fn config(&self) -> &TaskMasterConfig {
    &self.config
  }

  pub fn default_pool_name(&self) -> &str {
    &self.config.default_pool
  }

  /// True if `name` is one of the configured pools.
  pub fn is_defined(&self, name: &str) -> bool {
    self.pools.lock().contains_key(name)
  }

  pub fn pool_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.pools.lock().keys().cloned().collect();
    names.sort();
    names
  }

  /// Looks up a pool, rebuilding it first if it has terminated.
  ///
  /// `None`, an empty name, or a name that was never configured resolve to the
  /// default pool.
  pub fn get_pool(&self, name: Option<&str>) -> Result<Arc<WorkerPool>, PoolError> {
    self.lookup(name, None)
  }

  /// Like [`PoolRegistry::get_pool`], but a cancelled `interrupt` token makes a
  /// terminated pool fail fast with `PoolTerminated` instead of being rebuilt.
  pub fn get_pool_interruptible(
    &self,
    name: Option<&str>,
    interrupt: &CancellationToken,
  ) -> Result<Arc<WorkerPool>, PoolError> {
    self.lookup(name, Some(interrupt))
  }

  fn lookup(&self, name: Option<&str>, interrupt: Option<&CancellationToken>) -> Result<Arc<WorkerPool>, PoolError> {
    let mut pools = self.pools.lock();
    let resolved = self.resolve_name(&pools, name);

    let pool = match pools.get(&resolved) {
      Some(pool) => pool.clone(),
      None => {
        // The default pool is always built at startup, so this only happens if
        // it was removed from under us.
        let pool = WorkerPool::new(self.config.descriptor(&resolved), self.tokio_handle.clone());
        pools.insert(resolved.clone(), pool.clone());
        return Ok(pool);
      }
    };

    if !pool.is_terminated() {
      return Ok(pool);
    }

    if interrupt.is_some_and(|token| token.is_cancelled()) {
      warn!(pool_name = %resolved, "Pool is terminated and the caller was interrupted. Not rebuilding.");
      return Err(PoolError::PoolTerminated(resolved));
    }

    info!(pool_name = %resolved, "Pool found terminated. Rebuilding.");
    let rebuilt = WorkerPool::new(pool.descriptor().clone(), self.tokio_handle.clone());
    pools.insert(resolved, rebuilt.clone());
    Ok(rebuilt)
  }

  fn resolve_name(&self, pools: &HashMap<String, Arc<WorkerPool>>, name: Option<&str>) -> String {
    match name.map(str::trim) {
      None | Some("") => self.config.default_pool.clone(),
      Some(name) if pools.contains_key(name) => name.to_string(),
      Some(name) => {
        warn!(pool_name = %name, default_pool = %self.config.default_pool, "Pool has not been defined. Using the default pool.");
        self.config.default_pool.clone()
      }
    }
  }

  /// Gracefully shuts down every pool: running tasks finish, queued tasks are dropped.
  pub async fn shutdown(&self) -> Result<(), PoolError> {
    self.shutdown_all(ShutdownMode::Graceful).await
  }

  /// Shuts down every pool and cancels running tasks.
  pub async fn shutdown_now(&self) -> Result<(), PoolError> {
    self.shutdown_all(ShutdownMode::ForcefulCancel).await
  }

  async fn shutdown_all(&self, mode: ShutdownMode) -> Result<(), PoolError> {
    let pools: Vec<Arc<WorkerPool>> = self.pools.lock().values().cloned().collect();
    info!("Shutting down {} pools (mode: {:?}).", pools.len(), mode);

    let mut failures = Vec::new();
    for pool in pools {
      let name = pool.name().to_string();
      match pool.shutdown(mode).await {
        Ok(()) => debug!(pool_name = %name, "Pool shut down."),
        Err(e) => {
          error!(pool_name = %name, "Failed to shut down pool: {}", e);
          failures.push(format!("{}: {}", name, e));
        }
      }
    }

    if failures.is_empty() {
      Ok(())
    } else {
      Err(PoolError::ShutdownFailed(failures))
    }
  }
}
