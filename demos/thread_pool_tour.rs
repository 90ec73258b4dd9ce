use thread_orchestra::{as_completed, wait_for, ShutdownMode, WaitMode, WorkerPool};
use std::thread::sleep;
use std::time::Duration;
use tracing::info;

fn get_url(url: String, secs: u64) -> String {
  sleep(Duration::from_secs(secs));
  info!("Fetched page: {} ({}s)", url, secs);
  "success".to_string()
}

fn url(i: u64) -> String {
  format!("http://www.example.com/{}", i)
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  let pool = WorkerPool::new(5, "tour_pool").expect("Failed to create pool");

  info!("--- 1. submit (non-blocking) ---");
  let e1 = pool.submit(|| get_url(url(1), 2)).expect("submit failed");
  let e2 = pool.submit(|| get_url(url(2), 3)).expect("submit failed");

  info!("--- 2. done ---");
  info!("e1 done: {}", e1.is_done());
  info!("e2 done: {}", e2.is_done());
  sleep(Duration::from_secs(3) + Duration::from_millis(100));
  info!("e1 done: {}", e1.is_done());
  info!("e2 done: {}", e2.is_done());

  info!("--- 3. result (blocking) ---");
  info!("e1 result: {:?}", e1.result(None));

  info!("--- 4. cancel ---");
  let single = WorkerPool::new(1, "tour_single").expect("Failed to create pool");
  let _ee1 = single.submit(|| get_url(url(1), 2)).expect("submit failed");
  let ee2 = single.submit(|| get_url(url(5), 3)).expect("submit failed");
  info!("Cancelled page 5? {}", ee2.cancel());

  info!("--- 5. as_completed ---");
  let all: Vec<_> = (0..7u64)
    .map(|i| pool.submit(move || get_url(url(i), 2)).expect("submit failed"))
    .collect();
  for future in as_completed(all) {
    info!("{:?} finished", future.result(None));
  }

  info!("--- 6. map ---");
  for result in pool.map(|i: u64| get_url(url(i), 2), 0..7) {
    info!("{:?} finished", result);
  }

  info!("--- 7.1. wait (all completed) ---");
  let two = WorkerPool::new(2, "tour_wait").expect("Failed to create pool");
  let all: Vec<_> = (0..5u64)
    .map(|i| two.submit(move || get_url(url(i), i)).expect("submit failed"))
    .collect();
  wait_for([all[0].clone(), all[3].clone()], WaitMode::AllCompleted);
  info!("main continues");

  info!("--- 7.2. wait (first completed) ---");
  let two_more = WorkerPool::new(2, "tour_wait_first").expect("Failed to create pool");
  let all: Vec<_> = (0..5u64)
    .map(|i| two_more.submit(move || get_url(url(i), i)).expect("submit failed"))
    .collect();
  wait_for([all[0].clone(), all[3].clone()], WaitMode::FirstCompleted);
  info!("main continues");

  for p in [&pool, &single, &two, &two_more] {
    p.shutdown(ShutdownMode::Graceful);
  }
  info!("--- Tour End ---");
}
