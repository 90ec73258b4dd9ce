use thread_orchestra::{AdmissionGate, Dispatcher, ShutdownMode, WorkerPool};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use tracing::info;

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Bounded Producer Example (5 readers at a time) ---");

  // The pool could run 20 fetches at once; the gate allows only 5 in flight.
  let pool = WorkerPool::new(20, "spider_pool").expect("Failed to create pool");
  let gate = Arc::new(AdmissionGate::new(5).expect("Failed to create gate"));
  let dispatcher = Dispatcher::new(pool.clone(), gate.clone());

  let producer = {
    let dispatcher = dispatcher.clone();
    std::thread::spawn(move || {
      dispatcher.dispatch_all(0..100, |i: usize| {
        sleep(Duration::from_millis(200));
        let url = format!("http://example.com/{}", i);
        info!("Fetched: {}", url);
        url
      })
    })
  };

  while !producer.is_finished() {
    info!("Permits held: {}/{}", gate.held(), gate.capacity());
    sleep(Duration::from_millis(250));
  }

  let futures = producer
    .join()
    .expect("Producer thread panicked")
    .expect("Producer stopped early");
  let fetched = futures.iter().filter(|f| f.result(None).is_ok()).count();
  info!("Fetched {} pages.", fetched);

  pool.shutdown(ShutdownMode::Graceful);
  info!("--- Bounded Producer Example End ---");
}
