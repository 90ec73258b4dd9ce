use crate::admission_gate::{AdmissionGate, OwnedGatePermit};
use crate::error::PoolError;
use crate::handle::TaskFuture;
use crate::manager::WorkerPool;

use std::error::Error as StdError;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

/// A dispatched task's permit, shared by the task body and the future's done
/// callback. Whichever runs first releases it.
#[derive(Clone)]
struct PermitSlot(Arc<Mutex<Option<OwnedGatePermit>>>);

impl PermitSlot {
  fn new(permit: OwnedGatePermit) -> Self {
    Self(Arc::new(Mutex::new(Some(permit))))
  }

  fn release(&self) {
    self.0.lock().take();
  }
}

/// Releases the slot when the task body returns or unwinds, before the
/// future is settled.
struct ReleaseOnExit(PermitSlot);

impl Drop for ReleaseOnExit {
  fn drop(&mut self) {
    self.0.release();
  }
}

/// Feeds work into a [`WorkerPool`] through an [`AdmissionGate`], so no more
/// than the gate's capacity of dispatched tasks are queued or running at once.
///
/// Each dispatch blocks for a permit, and the permit travels with the task: it
/// is released when the task returns, fails, panics, or is cancelled before
/// it starts.
#[derive(Debug, Clone)]
pub struct Dispatcher {
  pool: Arc<WorkerPool>,
  gate: Arc<AdmissionGate>,
}

impl Dispatcher {
  pub fn new(pool: Arc<WorkerPool>, gate: Arc<AdmissionGate>) -> Self {
    Self { pool, gate }
  }

  pub fn pool(&self) -> &Arc<WorkerPool> {
    &self.pool
  }

  pub fn gate(&self) -> &Arc<AdmissionGate> {
    &self.gate
  }

  /// Waits for a permit, then submits `work`.
  ///
  /// # Errors
  /// Returns the pool's submission error; the permit is released in that case.
  pub fn dispatch<T, F>(&self, work: F) -> Result<TaskFuture<T>, PoolError>
  where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
  {
    self.gated(|slot| {
      self.pool.submit(move || {
        let _release = ReleaseOnExit(slot);
        work()
      })
    })
  }

  /// Fallible counterpart of [`Dispatcher::dispatch`].
  pub fn try_dispatch<T, E, F>(&self, work: F) -> Result<TaskFuture<T>, PoolError>
  where
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
  {
    self.gated(|slot| {
      self.pool.try_submit(move || {
        let _release = ReleaseOnExit(slot);
        work()
      })
    })
  }

  fn gated<T, S>(&self, submit: S) -> Result<TaskFuture<T>, PoolError>
  where
    T: Send + 'static,
    S: FnOnce(PermitSlot) -> Result<TaskFuture<T>, PoolError>,
  {
    if self.pool.is_shutdown() {
      return Err(PoolError::PoolShuttingDown);
    }
    let slot = PermitSlot::new(self.gate.permit_owned());
    // A rejected submission drops both handles, which releases the permit.
    let future = submit(slot.clone())?;
    // Covers futures settled without running: cancelled, or failed by a broken pool.
    future.add_done_callback(move |_| slot.release());
    Ok(future)
  }

  /// Producer loop: dispatches `work(input)` for every input, blocking whenever
  /// the gate is full.
  ///
  /// # Errors
  /// Stops at the first submission error (e.g. the pool shut down) and returns it;
  /// tasks dispatched before that keep running.
  pub fn dispatch_all<A, T, F, I>(&self, inputs: I, work: F) -> Result<Vec<TaskFuture<T>>, PoolError>
  where
    I: IntoIterator<Item = A>,
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A) -> T + Send + Sync + 'static,
  {
    let work = Arc::new(work);
    let mut futures = Vec::new();
    for input in inputs {
      let work = work.clone();
      match self.dispatch(move || work(input)) {
        Ok(future) => futures.push(future),
        Err(e) => {
          info!(pool_name = %self.pool.name(), dispatched = futures.len(), "Producer stopped: {}", e);
          return Err(e);
        }
      }
    }
    debug!(pool_name = %self.pool.name(), dispatched = futures.len(), "Producer finished.");
    Ok(futures)
  }
}
