use thread_orchestra::{as_completed, wait_for, wait_for_timeout, PoolError, ShutdownMode, TaskFuture, WaitMode, WorkerPool};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,thread_orchestra=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

// Mirrors a page fetch: sleeps `tenths` * 100ms and returns the url.
fn get_url(url: String, tenths: u64) -> String {
  sleep(Duration::from_millis(tenths * 100));
  tracing::info!("Fetched page: {} ({})", url, tenths);
  url
}

#[derive(Debug)]
struct Boom;

impl fmt::Display for Boom {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "boom")
  }
}

impl std::error::Error for Boom {}

#[test]
fn test_as_completed_yields_in_completion_order() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(4, "test_as_completed_order").unwrap();
  let durations = [3u64, 1, 4, 2];
  let futures: Vec<TaskFuture<String>> = durations
    .iter()
    .enumerate()
    .map(|(i, &d)| pool.submit(move || get_url(format!("http://example.com/{}", i), d)).unwrap())
    .collect();

  let yielded: Vec<String> = as_completed(futures.clone()).map(|f| f.result(None).unwrap()).collect();
  assert_eq!(
    yielded,
    vec![
      "http://example.com/1".to_string(),
      "http://example.com/3".to_string(),
      "http://example.com/0".to_string(),
      "http://example.com/2".to_string(),
    ]
  );
  pool.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_as_completed_yields_each_future_once() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(3, "test_as_completed_once").unwrap();
  let futures: Vec<_> = (0..7).map(|i| pool.submit(move || i).unwrap()).collect();

  // Duplicates collapse onto one entry.
  let mut input = futures.clone();
  input.push(futures[0].clone());
  input.push(futures[3].clone());

  let iter = as_completed(input);
  assert_eq!(iter.remaining(), 7);
  let ids: Vec<u64> = iter.map(|f| f.id()).collect();
  assert_eq!(ids.len(), 7);
  let unique: HashSet<u64> = ids.iter().copied().collect();
  assert_eq!(unique, futures.iter().map(|f| f.id()).collect::<HashSet<_>>());
  pool.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_as_completed_includes_cancelled_futures() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, "test_as_completed_cancelled").unwrap();
  let blocker = pool.submit(|| get_url("blocker".to_string(), 2)).unwrap();
  let queued = pool.submit(|| get_url("queued".to_string(), 1)).unwrap();

  let mut iter = as_completed(vec![blocker.clone(), queued.clone()]);
  assert!(queued.cancel());
  assert_eq!(iter.next().unwrap(), queued);
  assert_eq!(iter.next().unwrap(), blocker);
  assert!(iter.next().is_none());
  pool.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_as_completed_next_timeout() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, "test_as_completed_timeout").unwrap();
  let slow = pool.submit(|| get_url("slow".to_string(), 3)).unwrap();

  let mut iter = as_completed(vec![slow.clone()]);
  assert!(matches!(iter.next_timeout(Duration::from_millis(50)), Err(PoolError::Timeout(_))));
  let done = iter.next_timeout(Duration::from_secs(2)).unwrap().unwrap();
  assert_eq!(done, slow);
  assert!(matches!(iter.next_timeout(Duration::from_millis(1)), Ok(None)));
  pool.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_map_preserves_input_order() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(4, "test_map_order").unwrap();
  // Earlier inputs sleep longer, so completion order is the reverse of input order.
  let inputs: Vec<u64> = (0..8).collect();
  let results: Vec<u64> = pool
    .map(
      |i: u64| {
        sleep(Duration::from_millis((8 - i) * 15));
        i * 10
      },
      inputs.clone(),
    )
    .map(|r| r.unwrap())
    .collect();
  assert_eq!(results, inputs.iter().map(|i| i * 10).collect::<Vec<_>>());
  pool.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_map_is_lazy_and_bounded_by_buffer() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(2, "test_map_lazy").unwrap();
  let started = Arc::new(AtomicUsize::new(0));
  let counter = started.clone();

  let mut results = pool
    .map_buffered(
      move |i: usize| {
        counter.fetch_add(1, Ordering::SeqCst);
        i
      },
      0..100,
      3,
    )
    .unwrap();
  sleep(Duration::from_millis(30));
  assert_eq!(started.load(Ordering::SeqCst), 0, "nothing is submitted before the first next()");

  assert_eq!(results.next().unwrap().unwrap(), 0);
  assert!(results.in_flight() <= 2);
  sleep(Duration::from_millis(30));
  assert!(started.load(Ordering::SeqCst) <= 3);

  let rest: Vec<usize> = results.map(|r| r.unwrap()).collect();
  assert_eq!(rest, (1..100).collect::<Vec<_>>());
  assert_eq!(started.load(Ordering::SeqCst), 100);
  assert!(matches!(pool.map_buffered(|i: usize| i, 0..1, 0), Err(PoolError::InvalidArgument(_))));
  pool.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_try_map_reports_errors_per_item() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(3, "test_try_map").unwrap();
  let results: Vec<Result<u32, PoolError>> = pool
    .try_map(|i: u32| if i == 2 { Err(Boom) } else { Ok(i) }, 0..5)
    .collect();
  assert_eq!(results.len(), 5);
  for (i, result) in results.iter().enumerate() {
    match result {
      Ok(v) => assert_eq!(*v as usize, i),
      Err(PoolError::TaskFailed(e)) => {
        assert_eq!(i, 2);
        assert!(e.downcast_ref::<Boom>().is_some());
      }
      Err(other) => panic!("unexpected error {:?}", other),
    }
  }
  pool.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_map_after_shutdown_yields_single_error() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, "test_map_shutdown").unwrap();
  pool.shutdown(ShutdownMode::Graceful);
  let results: Vec<_> = pool.map(|i: u8| i, 0..5).collect();
  assert_eq!(results.len(), 1);
  assert!(matches!(results[0], Err(PoolError::PoolShuttingDown)));
}

#[test]
fn test_dropping_map_cancels_unstarted_tasks() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, "test_map_drop").unwrap();
  let ran = Arc::new(AtomicUsize::new(0));
  let counter = ran.clone();
  {
    let mut results = pool
      .map_buffered(
        move |i: u64| {
          counter.fetch_add(1, Ordering::SeqCst);
          sleep(Duration::from_millis(50));
          i
        },
        0..10,
        5,
      )
      .unwrap();
    assert_eq!(results.next().unwrap().unwrap(), 0);
  }
  pool.shutdown(ShutdownMode::Graceful);
  // The first item plus at most the one already running when the iterator was dropped.
  assert!(ran.load(Ordering::SeqCst) <= 2, "ran {} tasks", ran.load(Ordering::SeqCst));
}

#[test]
fn test_wait_all_completed_blocks_for_every_future() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(2, "test_wait_all").unwrap();
  let futures: Vec<_> = (0..5).map(|i| pool.submit(move || get_url(format!("u{}", i), i)).unwrap()).collect();

  let started = Instant::now();
  let split = wait_for(vec![futures[0].clone(), futures[3].clone()], WaitMode::AllCompleted);
  assert!(started.elapsed() >= Duration::from_millis(250));
  assert_eq!(split.done.len(), 2);
  assert!(split.not_done.is_empty());
  assert!(futures[0].is_done() && futures[3].is_done());
  pool.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_wait_first_completed_returns_early() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(2, "test_wait_first").unwrap();
  // Two workers: f0 (100ms) and f1 (500ms) start first; f3 cannot start before 300ms.
  let futures: Vec<_> = [1u64, 5, 2, 4]
    .iter()
    .enumerate()
    .map(|(i, &d)| pool.submit(move || get_url(format!("u{}", i), d)).unwrap())
    .collect();

  let split = wait_for(vec![futures[0].clone(), futures[3].clone()], WaitMode::FirstCompleted);
  assert!(split.done.contains(&futures[0]));
  assert!(split.not_done.contains(&futures[3]));
  assert!(!futures[3].is_done());
  pool.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_wait_first_error_stops_on_failure() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(3, "test_wait_first_error").unwrap();
  let failing = pool
    .try_submit(|| -> Result<u8, Boom> {
      sleep(Duration::from_millis(30));
      Err(Boom)
    })
    .unwrap();
  let slow = pool
    .try_submit(|| -> Result<u8, Boom> {
      sleep(Duration::from_millis(400));
      Ok(1)
    })
    .unwrap();

  let split = wait_for(vec![failing.clone(), slow.clone()], WaitMode::FirstError);
  assert!(split.done.contains(&failing));
  assert!(split.not_done.contains(&slow));

  // With no failures FirstError behaves like AllCompleted.
  let a = pool.submit(|| 1u8).unwrap();
  let b = pool.submit(|| 2u8).unwrap();
  let split = wait_for(vec![a, b], WaitMode::FirstError);
  assert_eq!(split.done.len(), 2);
  pool.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_wait_for_timeout_returns_partial_split() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, "test_wait_timeout").unwrap();
  let slow = pool.submit(|| get_url("slow".to_string(), 4)).unwrap();

  let started = Instant::now();
  let split = wait_for_timeout(vec![slow.clone()], WaitMode::AllCompleted, Duration::from_millis(50));
  assert!(started.elapsed() < Duration::from_millis(300));
  assert!(split.done.is_empty());
  assert!(split.not_done.contains(&slow));

  let empty = wait_for(Vec::<TaskFuture<String>>::new(), WaitMode::AllCompleted);
  assert!(empty.done.is_empty() && empty.not_done.is_empty());
  pool.shutdown(ShutdownMode::Graceful);
}
