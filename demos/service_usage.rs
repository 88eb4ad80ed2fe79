use service_orchestra::{CallOptions, CallType, ServiceRuntime, TaskMasterConfig};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

const CONFIG: &str = r#"
  pool_names = ["quotes"]

  [pools.quotes]
  kind = "fixed"
  max_threads = 2
  queue = 4

  [service]
  result_cache_duration = { amount = 10, unit = "m" }
  in_progress_enabled = true
"#;

// A slow blocking lookup standing in for a remote service.
fn quote_lookup(calls: Arc<AtomicUsize>) -> impl Fn(&String) -> Result<f64, io::Error> + Send + Sync + 'static {
  move |symbol: &String| {
    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
    info!("Looking up quote for {} (call #{})", symbol, call);
    std::thread::sleep(Duration::from_millis(400));
    match symbol.as_str() {
      "ACME" => Ok(42.5),
      "INITECH" => Ok(7.25),
      other => Err(io::Error::new(io::ErrorKind::NotFound, format!("unknown symbol {}", other))),
    }
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Service Usage Example ---");

  let config = TaskMasterConfig::from_toml_str(CONFIG).expect("Invalid configuration");
  let runtime = ServiceRuntime::new(config, Handle::current()).expect("Failed to build runtime");
  let service = runtime.service();
  let quotes = service
    .result_cache::<String, f64>("quotes")
    .expect("Failed to open result cache");
  let calls = Arc::new(AtomicUsize::new(0));
  let options = CallOptions::new().with_pool("quotes");

  // Synchronous cached call: the second call is served from the cache.
  for _ in 0..2 {
    let future = service
      .call(&quotes, "ACME", "ACME".to_string(), quote_lookup(calls.clone()), CallType::Sync, &options)
      .expect("Sync call failed");
    let holder = future.get().await.expect("Immediate future failed");
    info!("Sync call returned {:?}", holder.and_then(|h| h.value().copied()));
  }

  // Concurrent asynchronous calls for one key share a single execution.
  let mut futures = Vec::new();
  for _ in 0..4 {
    let future = service
      .submit_async_cached(
        &quotes,
        "INITECH",
        "INITECH".to_string(),
        quote_lookup(calls.clone()),
        &options,
      )
      .expect("Async call failed");
    info!(
      "Async call returned a {} future",
      if future.is_pool_backed() {
        "pool backed"
      } else if future.is_cache_polling() {
        "cache polling"
      } else {
        "immediate"
      }
    );
    futures.push(future);
  }

  loop {
    match service.check_async_result(&quotes, "INITECH", false) {
      Ok(Some(holder)) => {
        info!("Polled result: {:?}", holder.value());
        break;
      }
      Ok(None) => {
        info!("Still processing...");
        tokio::time::sleep(Duration::from_millis(100)).await;
      }
      Err(e) => {
        tracing::error!("Polling failed: {}", e);
        break;
      }
    }
  }
  for future in &futures {
    let outcome = future.get_timeout(Duration::from_secs(2)).await;
    info!("Future outcome: {:?}", outcome.map(|h| h.and_then(|h| h.value().copied())));
  }

  // Failures are returned in the holder and, by default, not cached.
  let holder = service.invoke("NOPE".to_string(), &quote_lookup(calls.clone()));
  info!(
    "Failed call: {:?}",
    holder.failure_ref().map(|failure| failure.message().to_string())
  );

  info!("Underlying service ran {} times.", calls.load(Ordering::SeqCst));
  runtime.shutdown().await.expect("Runtime shutdown failed");
  info!("--- Service Usage Example End ---");
}
