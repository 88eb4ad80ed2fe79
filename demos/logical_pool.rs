use service_orchestra::{LogicalPoolSettings, LogicalThreadPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Logical Pool Example (3 slots) ---");

  let settings = LogicalPoolSettings {
    wait_interval_ms: 100,
    max_wait_intervals: 20,
  };
  let pool = Arc::new(LogicalThreadPool::with_settings(Some("imports"), 3, settings));

  let mut joins = Vec::new();
  for i in 0..6 {
    let pool = pool.clone();
    joins.push(tokio::spawn(async move {
      match pool.wait_access().await {
        Ok(()) => {
          info!("Worker {} admitted ({} of {} slots in use)", i, pool.current(), pool.max());
          tokio::time::sleep(Duration::from_millis(300)).await;
          pool.release();
        }
        Err(e) => info!("Worker {} gave up: {}", i, e),
      }
    }));
  }
  for join in joins {
    let _ = join.await;
  }

  pool.shutdown_pool();
  info!("After shutdown, try_acquire: {:?}", pool.try_acquire());
  pool.start_pool();
  info!("After restart, try_acquire: {:?}", pool.try_acquire());
  pool.release();

  info!("--- Logical Pool Example End ---");
}
