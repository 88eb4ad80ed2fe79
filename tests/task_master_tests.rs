use rand::Rng;
use service_orchestra::{
  PoolError, PoolSettings, ResultCarrier, ResultHolder, ServiceFailure, TaskError, TaskMaster, TaskMasterConfig,
  WorkerPool,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::sleep;

type Carrier = ResultCarrier<String, u32>;

// Helper to initialize tracing for tests. Once ensures it runs once per test binary.
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,service_orchestra=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn test_config() -> TaskMasterConfig {
  TaskMasterConfig::default()
    .with_pool("fixed2", PoolSettings::fixed(2, 0))
    .with_pool("fixed3", PoolSettings::fixed(3, -1))
    .with_pool("single", PoolSettings::single())
    .with_pool("buffered", PoolSettings::fixed(1, 1))
    .with_pool("huge", PoolSettings::fixed(i64::MAX, -1))
}

// Waits until the pool has released every admission slot.
async fn wait_until_drained(pool: &WorkerPool) {
  for _ in 0..200 {
    if pool.admitted_task_count() == 0 {
      return;
    }
    sleep(Duration::from_millis(10)).await;
  }
  panic!("Pool {} still holds {} admitted tasks", pool.name(), pool.admitted_task_count());
}

// Work that blocks its worker thread until the returned sender fires (or is dropped).
fn gated_work(value: u32) -> (mpsc::Sender<()>, impl FnOnce(&mut Carrier) + Send + 'static) {
  let (tx, rx) = mpsc::channel::<()>();
  let work = move |carrier: &mut Carrier| {
    let _ = rx.recv_timeout(Duration::from_secs(5));
    carrier.set_result(value);
  };
  (tx, work)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_and_await_basic_task() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());

  let future = master
    .submit(
      |carrier: &mut Carrier| {
        carrier.set_result(7);
      },
      Carrier::new("criteria".to_string()),
      None,
    )
    .unwrap();
  assert!(future.is_pool_backed());

  let holder = future.get().await.unwrap();
  assert_eq!(holder, Some(ResultHolder::success("criteria".to_string(), 7)));
  assert!(future.is_done());
  assert!(!future.is_cancelled());

  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_recorded_in_carrier() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());

  let future = master
    .submit(
      |carrier: &mut Carrier| {
        carrier.set_failure(ServiceFailure::new("upstream down", "UpstreamError"));
      },
      Carrier::new("c".to_string()),
      Some("single"),
    )
    .unwrap();

  let holder = future.get().await.unwrap().unwrap();
  assert!(holder.is_failure());
  assert_eq!(holder.failure_ref().unwrap().message(), "upstream down");
  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_panics_are_handled() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());

  let panicking = master
    .submit(
      |_carrier: &mut Carrier| panic!("Task intentionally panicked!"),
      Carrier::new("c".to_string()),
      Some("single"),
    )
    .unwrap();
  assert_eq!(panicking.get().await, Err(TaskError::Pool(PoolError::TaskPanicked)));

  // The pool keeps working after a panic.
  let normal = master
    .submit(
      |carrier: &mut Carrier| {
        carrier.set_result(2);
      },
      Carrier::new("c".to_string()),
      Some("single"),
    )
    .unwrap();
  assert_eq!(normal.get().await.unwrap().unwrap().value(), Some(&2));

  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_cancellation_via_future() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());
  let pool = master.registry().get_pool(Some("fixed2")).unwrap();

  let (release, work) = gated_work(1);
  let future = master.submit(work, Carrier::new("c".to_string()), Some("fixed2")).unwrap();
  sleep(Duration::from_millis(50)).await;

  assert!(future.cancel());
  assert!(future.is_cancelled());
  assert!(future.is_done());
  assert!(!future.cancel(), "Second cancel must report false");
  assert_eq!(future.get().await, Err(TaskError::Pool(PoolError::TaskCancelled)));

  // The blocked work still owns its slot.
  sleep(Duration::from_millis(50)).await;
  assert_eq!(pool.admitted_task_count(), 1);

  release.send(()).unwrap();
  wait_until_drained(&pool).await;
  assert_eq!(future.try_get(), Err(TaskError::Pool(PoolError::TaskCancelled)));
  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_work_keeps_its_worker_slot() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());
  let pool = master.registry().get_pool(Some("fixed2")).unwrap();
  let running = Arc::new(AtomicUsize::new(0));
  let max_seen = Arc::new(AtomicUsize::new(0));

  let tracked_work = |rx: mpsc::Receiver<()>, value: u32| {
    let running = running.clone();
    let max_seen = max_seen.clone();
    move |carrier: &mut Carrier| {
      let now = running.fetch_add(1, Ordering::SeqCst) + 1;
      max_seen.fetch_max(now, Ordering::SeqCst);
      let _ = rx.recv_timeout(Duration::from_secs(5));
      running.fetch_sub(1, Ordering::SeqCst);
      carrier.set_result(value);
    }
  };

  let (release_a, rx_a) = mpsc::channel();
  let (release_b, rx_b) = mpsc::channel();
  let first = master
    .submit(tracked_work(rx_a, 1), Carrier::new("a".to_string()), Some("fixed2"))
    .unwrap();
  let second = master
    .submit(tracked_work(rx_b, 2), Carrier::new("b".to_string()), Some("fixed2"))
    .unwrap();
  sleep(Duration::from_millis(50)).await;
  assert!(first.cancel());
  assert!(second.cancel());

  // Both actions are still running, so the hand-off pool stays full.
  let (_release_c, rx_c) = mpsc::channel();
  assert_eq!(
    master
      .submit(tracked_work(rx_c, 3), Carrier::new("c".to_string()), Some("fixed2"))
      .unwrap_err(),
    PoolError::Rejected {
      pool: "fixed2".to_string()
    }
  );

  release_a.send(()).unwrap();
  release_b.send(()).unwrap();
  wait_until_drained(&pool).await;

  let (release_d, rx_d) = mpsc::channel();
  let fourth = master
    .submit(tracked_work(rx_d, 4), Carrier::new("d".to_string()), Some("fixed2"))
    .unwrap();
  release_d.send(()).unwrap();
  assert_eq!(fourth.get().await.unwrap().unwrap().value(), Some(&4));
  assert!(max_seen.load(Ordering::SeqCst) <= 2);
  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bounded_queue_buffers_then_rejects() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());
  let order = Arc::new(Mutex::new(Vec::new()));

  let ordered_work = |rx: mpsc::Receiver<()>, value: u32| {
    let order = order.clone();
    move |carrier: &mut Carrier| {
      let _ = rx.recv_timeout(Duration::from_secs(5));
      order.lock().unwrap().push(value);
      carrier.set_result(value);
    }
  };

  let (release_first, rx_first) = mpsc::channel();
  let (release_second, rx_second) = mpsc::channel();
  let first = master
    .submit(ordered_work(rx_first, 1), Carrier::new("a".to_string()), Some("buffered"))
    .unwrap();
  sleep(Duration::from_millis(50)).await;
  let second = master
    .submit(ordered_work(rx_second, 2), Carrier::new("b".to_string()), Some("buffered"))
    .unwrap();

  let (_release_third, rx_third) = mpsc::channel();
  assert_eq!(
    master
      .submit(ordered_work(rx_third, 3), Carrier::new("c".to_string()), Some("buffered"))
      .unwrap_err(),
    PoolError::Rejected {
      pool: "buffered".to_string()
    }
  );

  // The buffered task waits for the only worker.
  sleep(Duration::from_millis(50)).await;
  assert!(!second.is_done());

  release_second.send(()).unwrap();
  release_first.send(()).unwrap();
  assert_eq!(first.get().await.unwrap().unwrap().value(), Some(&1));
  assert_eq!(second.get().await.unwrap().unwrap().value(), Some(&2));
  assert_eq!(*order.lock().unwrap(), vec![1, 2]);
  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_pool_is_capped() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());

  let future = master
    .submit(
      |carrier: &mut Carrier| {
        carrier.set_result(11);
      },
      Carrier::new("c".to_string()),
      Some("huge"),
    )
    .unwrap();
  assert_eq!(future.get().await.unwrap().unwrap().value(), Some(&11));
  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_timeout_then_get() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());

  let (release, work) = gated_work(5);
  let future = master.submit(work, Carrier::new("c".to_string()), None).unwrap();

  let timeout = Duration::from_millis(20);
  assert_eq!(future.get_timeout(timeout).await, Err(TaskError::Timeout(timeout)));
  assert!(!future.is_done());

  release.send(()).unwrap();
  let holder = future.get_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
  assert_eq!(holder.value(), Some(&5));
  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_synchronous_handoff_pool_rejects_third_submission() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());

  let (release_a, work_a) = gated_work(1);
  let (release_b, work_b) = gated_work(2);
  let first = master.submit(work_a, Carrier::new("a".to_string()), Some("fixed2")).unwrap();
  let second = master.submit(work_b, Carrier::new("b".to_string()), Some("fixed2")).unwrap();

  let (_release_c, work_c) = gated_work(3);
  let rejected = master
    .submit(work_c, Carrier::new("c".to_string()), Some("fixed2"))
    .unwrap_err();
  assert_eq!(
    rejected,
    PoolError::Rejected {
      pool: "fixed2".to_string()
    }
  );
  assert!(rejected.is_rejection());

  release_a.send(()).unwrap();
  release_b.send(()).unwrap();
  assert_eq!(first.get().await.unwrap().unwrap().value(), Some(&1));
  assert_eq!(second.get().await.unwrap().unwrap().value(), Some(&2));

  // Capacity is back once the running tasks finished.
  let (release_d, work_d) = gated_work(4);
  let fourth = master.submit(work_d, Carrier::new("d".to_string()), Some("fixed2")).unwrap();
  release_d.send(()).unwrap();
  assert_eq!(fourth.get().await.unwrap().unwrap().value(), Some(&4));

  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_pool_is_a_configuration_error() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());

  let error = master
    .submit(
      |carrier: &mut Carrier| {
        carrier.set_result(1);
      },
      Carrier::new("c".to_string()),
      Some("no-such-pool"),
    )
    .unwrap_err();
  assert_eq!(error, PoolError::UnknownPool("no-such-pool".to_string()));
  assert!(!error.is_rejection());

  // An empty name means the default pool.
  let future = master
    .submit(
      |carrier: &mut Carrier| {
        carrier.set_result(1);
      },
      Carrier::new("c".to_string()),
      Some(""),
    )
    .unwrap();
  assert_eq!(future.as_pool_future().unwrap().pool_name(), "default");
  future.get().await.unwrap();

  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_pool_runs_in_fifo_order() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());
  let order = Arc::new(Mutex::new(Vec::new()));

  let mut futures = Vec::new();
  for index in 0..5u32 {
    let order = order.clone();
    let future = master
      .submit(
        move |carrier: &mut Carrier| {
          std::thread::sleep(Duration::from_millis(10));
          order.lock().unwrap().push(index);
          carrier.set_result(index);
        },
        Carrier::new(format!("task-{}", index)),
        Some("single"),
      )
      .unwrap();
    futures.push(future);
  }
  for future in &futures {
    future.get().await.unwrap();
  }

  assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fixed_pool_limits_concurrency() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());
  let running = Arc::new(AtomicUsize::new(0));
  let max_seen = Arc::new(AtomicUsize::new(0));

  let mut futures = Vec::new();
  for index in 0..10u32 {
    let running = running.clone();
    let max_seen = max_seen.clone();
    let pause = Duration::from_millis(rand::rng().random_range(10..40));
    let future = master
      .submit(
        move |carrier: &mut Carrier| {
          let now = running.fetch_add(1, Ordering::SeqCst) + 1;
          max_seen.fetch_max(now, Ordering::SeqCst);
          std::thread::sleep(pause);
          running.fetch_sub(1, Ordering::SeqCst);
          carrier.set_result(index);
        },
        Carrier::new(format!("task-{}", index)),
        Some("fixed3"),
      )
      .unwrap();
    futures.push(future);
  }
  for future in &futures {
    assert!(future.get().await.unwrap().unwrap().is_success());
  }

  let max_seen = max_seen.load(Ordering::SeqCst);
  assert!(max_seen <= 3, "At most 3 tasks may run at once, saw {}", max_seen);
  assert!(max_seen >= 1);
  master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_shutdown_lets_running_task_finish() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());

  let future = master
    .submit(
      |carrier: &mut Carrier| {
        std::thread::sleep(Duration::from_millis(150));
        carrier.set_result(9);
      },
      Carrier::new("c".to_string()),
      Some("single"),
    )
    .unwrap();
  sleep(Duration::from_millis(50)).await;

  master.shutdown().await.unwrap();
  assert!(future.is_done());
  assert_eq!(future.try_get().unwrap().unwrap().value(), Some(&9));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forceful_shutdown_cancels_running_and_drops_queued() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());

  let (release_running, running_work) = gated_work(1);
  let (_release_queued, queued_work) = gated_work(2);
  let running = master.submit(running_work, Carrier::new("r".to_string()), Some("single")).unwrap();
  sleep(Duration::from_millis(50)).await;
  let queued = master.submit(queued_work, Carrier::new("q".to_string()), Some("single")).unwrap();

  let shutdown = tokio::spawn({
    let master = master.clone();
    async move { master.shutdown_now().await }
  });

  assert_eq!(running.get().await, Err(TaskError::Pool(PoolError::TaskCancelled)));
  assert_eq!(queued.get().await, Err(TaskError::Pool(PoolError::PoolShuttingDown)));

  // Shutdown waits for the blocked work to return.
  sleep(Duration::from_millis(50)).await;
  assert!(!shutdown.is_finished());
  release_running.send(()).unwrap();
  shutdown.await.unwrap().unwrap();
  assert_eq!(running.try_get(), Err(TaskError::Pool(PoolError::TaskCancelled)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submission_after_shutdown_rebuilds_pool() {
  setup_tracing_for_test();
  let master = TaskMaster::new(test_config(), Handle::current());
  master.shutdown().await.unwrap();

  let future = master
    .submit(
      |carrier: &mut Carrier| {
        carrier.set_result(3);
      },
      Carrier::new("c".to_string()),
      Some("fixed2"),
    )
    .unwrap();
  assert_eq!(future.get().await.unwrap().unwrap().value(), Some(&3));
  master.shutdown().await.unwrap();
}
