use crate::error::PoolError;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{trace, warn};

/// A counting gate bounding how many operations may be in flight at once,
/// independent of how many worker threads exist.
///
/// Blocking (`acquire`) and async (`acquire_async`) callers share the same
/// permits. Admission order is not guaranteed to be fair.
#[derive(Debug)]
pub struct AdmissionGate {
  capacity: usize,
  held: Mutex<usize>,
  freed: Condvar,
  freed_async: Notify,
}

impl AdmissionGate {
  /// Creates a gate with `capacity` permits.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidArgument` when `capacity` is 0.
  pub fn new(capacity: usize) -> Result<Self, PoolError> {
    if capacity == 0 {
      return Err(PoolError::InvalidArgument("gate capacity must be at least 1".to_string()));
    }
    Ok(Self {
      capacity,
      held: Mutex::new(0),
      freed: Condvar::new(),
      freed_async: Notify::new(),
    })
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Permits currently held.
  pub fn held(&self) -> usize {
    *self.held.lock()
  }

  pub fn available(&self) -> usize {
    self.capacity - *self.held.lock()
  }

  /// Blocks the calling thread until a permit is free, then takes it.
  pub fn acquire(&self) {
    let mut held = self.held.lock();
    while *held >= self.capacity {
      self.freed.wait(&mut held);
    }
    *held += 1;
    trace!(held = *held, capacity = self.capacity, "Gate permit acquired.");
  }

  /// Takes a permit only if one is free right now.
  pub fn try_acquire(&self) -> bool {
    let mut held = self.held.lock();
    if *held >= self.capacity {
      return false;
    }
    *held += 1;
    true
  }

  /// Waits at most `timeout` for a permit. Returns whether one was taken.
  pub fn acquire_timeout(&self, timeout: Duration) -> bool {
    let Some(deadline) = Instant::now().checked_add(timeout) else {
      self.acquire();
      return true;
    };
    let mut held = self.held.lock();
    while *held >= self.capacity {
      if self.freed.wait_until(&mut held, deadline).timed_out() && *held >= self.capacity {
        return false;
      }
    }
    *held += 1;
    true
  }

  /// Waits for a permit without blocking an async runtime thread.
  pub async fn acquire_async(&self) {
    loop {
      // Created before the check so a release in between is not missed.
      let notified = self.freed_async.notified();
      if self.try_acquire() {
        return;
      }
      notified.await;
    }
  }

  /// Returns a permit and wakes one blocked acquirer.
  ///
  /// # Errors
  /// Returns `PoolError::ReleaseWithoutAcquire` if no permit is held; the
  /// capacity is never increased.
  pub fn release(&self) -> Result<(), PoolError> {
    {
      let mut held = self.held.lock();
      if *held == 0 {
        warn!(capacity = self.capacity, "Gate released without a matching acquire.");
        return Err(PoolError::ReleaseWithoutAcquire { capacity: self.capacity });
      }
      *held -= 1;
      trace!(held = *held, capacity = self.capacity, "Gate permit released.");
    }
    self.freed.notify_one();
    self.freed_async.notify_one();
    Ok(())
  }

  /// Acquires a permit that is released when the guard is dropped.
  pub fn permit(&self) -> GatePermit<'_> {
    self.acquire();
    GatePermit { gate: self }
  }

  /// Acquires a permit that can be moved to another thread or task.
  pub fn permit_owned(self: &Arc<Self>) -> OwnedGatePermit {
    self.acquire();
    OwnedGatePermit { gate: self.clone() }
  }

  pub fn try_permit_owned(self: &Arc<Self>) -> Option<OwnedGatePermit> {
    self.try_acquire().then(|| OwnedGatePermit { gate: self.clone() })
  }

  pub async fn permit_owned_async(self: &Arc<Self>) -> OwnedGatePermit {
    self.acquire_async().await;
    OwnedGatePermit { gate: self.clone() }
  }
}

fn release_on_drop(gate: &AdmissionGate) {
  if let Err(e) = gate.release() {
    warn!("Gate permit dropped after its slot was already released manually: {}", e);
  }
}

/// A permit borrowed from an [`AdmissionGate`]; dropping it releases the slot.
#[derive(Debug)]
pub struct GatePermit<'a> {
  gate: &'a AdmissionGate,
}

impl Drop for GatePermit<'_> {
  fn drop(&mut self) {
    release_on_drop(self.gate);
  }
}

/// An owned permit from an [`AdmissionGate`]; dropping it releases the slot.
#[derive(Debug)]
pub struct OwnedGatePermit {
  gate: Arc<AdmissionGate>,
}

impl OwnedGatePermit {
  pub fn gate(&self) -> &Arc<AdmissionGate> {
    &self.gate
  }
}

impl Drop for OwnedGatePermit {
  fn drop(&mut self) {
    release_on_drop(&self.gate);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::thread;

  #[test]
  fn test_zero_capacity_rejected() {
    assert!(matches!(AdmissionGate::new(0), Err(PoolError::InvalidArgument(_))));
  }

  #[test]
  fn test_counts_track_acquire_and_release() {
    let gate = AdmissionGate::new(2).unwrap();
    assert_eq!(gate.available(), 2);
    gate.acquire();
    assert!(gate.try_acquire());
    assert!(!gate.try_acquire());
    assert_eq!(gate.held(), 2);
    gate.release().unwrap();
    assert_eq!(gate.held(), 1);
    gate.release().unwrap();
    assert_eq!(gate.available(), 2);
  }

  #[test]
  fn test_release_without_acquire_is_an_error() {
    let gate = AdmissionGate::new(3).unwrap();
    assert!(matches!(gate.release(), Err(PoolError::ReleaseWithoutAcquire { capacity: 3 })));
    assert_eq!(gate.capacity(), 3);
    assert_eq!(gate.available(), 3);
  }

  #[test]
  fn test_acquire_blocks_until_release() {
    let gate = Arc::new(AdmissionGate::new(1).unwrap());
    gate.acquire();
    let admitted = Arc::new(AtomicBool::new(false));

    let waiter = {
      let gate = gate.clone();
      let admitted = admitted.clone();
      thread::spawn(move || {
        gate.acquire();
        admitted.store(true, Ordering::SeqCst);
      })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!admitted.load(Ordering::SeqCst), "waiter got in while the gate was full");
    gate.release().unwrap();
    waiter.join().unwrap();
    assert!(admitted.load(Ordering::SeqCst));
    assert_eq!(gate.held(), 1);
  }

  #[test]
  fn test_acquire_timeout_expires_when_full() {
    let gate = AdmissionGate::new(1).unwrap();
    let _held = gate.permit();
    let started = Instant::now();
    assert!(!gate.acquire_timeout(Duration::from_millis(30)));
    assert!(started.elapsed() >= Duration::from_millis(30));
  }

  #[test]
  fn test_permit_guards_release_on_drop() {
    let gate = Arc::new(AdmissionGate::new(2).unwrap());
    {
      let _a = gate.permit();
      let b = gate.permit_owned();
      assert_eq!(gate.held(), 2);
      assert!(gate.try_permit_owned().is_none());
      thread::spawn(move || drop(b)).join().unwrap();
      assert_eq!(gate.held(), 1);
    }
    assert_eq!(gate.held(), 0);
  }

  #[tokio::test]
  async fn test_async_acquire_woken_by_thread_release() {
    let gate = Arc::new(AdmissionGate::new(1).unwrap());
    gate.acquire();
    let releaser = {
      let gate = gate.clone();
      thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        gate.release().unwrap();
      })
    };
    let permit = tokio::time::timeout(Duration::from_secs(2), gate.permit_owned_async())
      .await
      .expect("async acquire was never woken");
    assert_eq!(gate.held(), 1);
    drop(permit);
    assert_eq!(gate.held(), 0);
    releaser.join().unwrap();
  }
}
