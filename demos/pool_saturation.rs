use service_orchestra::{PoolSettings, ResultCarrier, TaskMaster, TaskMasterConfig};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

type Carrier = ResultCarrier<usize, String>;

fn long_task(id: usize) -> impl FnOnce(&mut Carrier) + Send + 'static {
  move |carrier: &mut Carrier| {
    info!("Task {} starting (should take 1s)", id);
    std::thread::sleep(Duration::from_secs(1));
    carrier.set_result(format!("Task {} finished", id));
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Pool Saturation Example (2 workers, queue of 1) ---");

  let config = TaskMasterConfig::default()
    .with_pool("narrow", PoolSettings::fixed(2, 1))
    .with_pool("serial", PoolSettings::single());
  let master = TaskMaster::new(config, Handle::current());

  // Two run, one waits in the queue and the rest are rejected.
  let mut futures = Vec::new();
  for i in 0..5 {
    match master.submit(long_task(i), Carrier::new(i), Some("narrow")) {
      Ok(future) => {
        info!("Submitted task {}", i);
        futures.push(future);
      }
      Err(e) if e.is_rejection() => info!("Task {} rejected: {}", i, e),
      Err(e) => tracing::error!("Failed to submit task {}: {:?}", i, e),
    }
  }

  for future in futures {
    match future.get().await {
      Ok(Some(holder)) => info!("Result: {:?}", holder.value()),
      Ok(None) => info!("No result"),
      Err(e) => info!("Error: {}", e),
    }
  }

  // An unknown pool name is a configuration error, not a fallback.
  if let Err(e) = master.submit(long_task(99), Carrier::new(99), Some("missing")) {
    info!("Unknown pool: {}", e);
  }

  // A pool that was shut down is rebuilt on the next submission.
  let serial = master.registry().get_pool(Some("serial")).expect("Pool lookup failed");
  master.shutdown_now().await.expect("Shutdown failed");
  info!("Old serial pool terminated: {}", serial.is_terminated());
  let future = master
    .submit(long_task(100), Carrier::new(100), Some("serial"))
    .expect("Submission after shutdown failed");
  info!("Rebuilt pool result: {:?}", future.get().await.map(|h| h.and_then(|h| h.value().cloned())));

  master.shutdown().await.expect("Shutdown failed");
  info!("--- Pool Saturation Example End ---");
}
