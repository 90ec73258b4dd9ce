//! Blocking helpers over groups of [`TaskFuture`]s: completion-order iteration
//! and wait barriers.

use crate::error::PoolError;
use crate::handle::{FutureState, TaskFuture};

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::trace;

/// Stopping condition for [`wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
  /// Return as soon as any future is done.
  FirstCompleted,
  /// Return as soon as any future fails, or when all are done.
  FirstError,
  /// Return when every future is done.
  #[default]
  AllCompleted,
}

/// The partition returned by [`wait_for`].
#[derive(Debug)]
pub struct DoneAndNotDone<T> {
  pub done: HashSet<TaskFuture<T>>,
  pub not_done: HashSet<TaskFuture<T>>,
}

fn unique_futures<T, I>(futures: I) -> Vec<TaskFuture<T>>
where
  I: IntoIterator<Item = TaskFuture<T>>,
{
  let mut seen = HashSet::new();
  futures.into_iter().filter(|f| seen.insert(f.id())).collect()
}

/// Yields futures as they finish, in completion order.
///
/// Futures that are already done when the iterator is created come first.
/// Each distinct future is yielded exactly once; `next` blocks without limit
/// while unfinished futures remain.
#[derive(Debug)]
pub struct AsCompleted<T> {
  rx: Receiver<TaskFuture<T>>,
  remaining: usize,
  /// Callbacks still parked on unfinished futures, withdrawn on drop.
  registered: Vec<(TaskFuture<T>, u64)>,
}

pub fn as_completed<T, I>(futures: I) -> AsCompleted<T>
where
  T: Send + 'static,
  I: IntoIterator<Item = TaskFuture<T>>,
{
  let futures = unique_futures(futures);
  let (tx, rx) = crossbeam_channel::unbounded();
  let remaining = futures.len();
  let mut registered = Vec::new();
  for future in futures {
    let tx = tx.clone();
    let key = future.register_done_callback(move |done| {
      // The receiver may be gone if the caller stopped iterating early.
      let _ = tx.send(done.clone());
    });
    if let Some(key) = key {
      registered.push((future, key));
    }
  }
  AsCompleted { rx, remaining, registered }
}

impl<T> AsCompleted<T> {
  /// Number of futures not yet yielded.
  pub fn remaining(&self) -> usize {
    self.remaining
  }

  /// Like `next`, but gives up after `timeout`.
  ///
  /// # Errors
  /// Returns `PoolError::Timeout` if no further future finished in time.
  pub fn next_timeout(&mut self, timeout: Duration) -> Result<Option<TaskFuture<T>>, PoolError> {
    if self.remaining == 0 {
      return Ok(None);
    }
    match self.rx.recv_timeout(timeout) {
      Ok(future) => {
        self.remaining -= 1;
        Ok(Some(future))
      }
      Err(RecvTimeoutError::Timeout) => Err(PoolError::Timeout(timeout)),
      Err(RecvTimeoutError::Disconnected) => {
        self.remaining = 0;
        Ok(None)
      }
    }
  }
}

impl<T> Drop for AsCompleted<T> {
  fn drop(&mut self) {
    for (future, key) in self.registered.drain(..) {
      future.remove_done_callback(key);
    }
  }
}

impl<T> Iterator for AsCompleted<T> {
  type Item = TaskFuture<T>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.remaining == 0 {
      return None;
    }
    match self.rx.recv() {
      Ok(future) => {
        self.remaining -= 1;
        Some(future)
      }
      Err(_) => {
        self.remaining = 0;
        None
      }
    }
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    (self.remaining, Some(self.remaining))
  }
}

/// Blocks until `mode` is satisfied and returns which futures are done.
///
/// Outstanding work is not cancelled. An empty input returns immediately.
pub fn wait_for<T, I>(futures: I, mode: WaitMode) -> DoneAndNotDone<T>
where
  T: Send + 'static,
  I: IntoIterator<Item = TaskFuture<T>>,
{
  wait_until(unique_futures(futures), mode, None)
}

/// Like [`wait_for`], but returns once `timeout` elapses even if `mode` is not
/// satisfied; check `not_done` to tell the two apart.
pub fn wait_for_timeout<T, I>(futures: I, mode: WaitMode, timeout: Duration) -> DoneAndNotDone<T>
where
  T: Send + 'static,
  I: IntoIterator<Item = TaskFuture<T>>,
{
  wait_until(unique_futures(futures), mode, Instant::now().checked_add(timeout))
}

fn partition<T>(futures: &[TaskFuture<T>]) -> DoneAndNotDone<T>
where
  T: Send + 'static,
{
  let (done, not_done) = futures.iter().cloned().partition(|f| f.is_done());
  DoneAndNotDone { done, not_done }
}

fn condition_met<T>(mode: WaitMode, split: &DoneAndNotDone<T>) -> bool
where
  T: Send + 'static,
{
  match mode {
    WaitMode::FirstCompleted => !split.done.is_empty() || split.not_done.is_empty(),
    WaitMode::FirstError => split.not_done.is_empty() || split.done.iter().any(|f| f.state() == FutureState::Failed),
    WaitMode::AllCompleted => split.not_done.is_empty(),
  }
}

fn wait_until<T>(futures: Vec<TaskFuture<T>>, mode: WaitMode, deadline: Option<Instant>) -> DoneAndNotDone<T>
where
  T: Send + 'static,
{
  let split = partition(&futures);
  if condition_met(mode, &split) {
    return split;
  }

  let (tx, rx) = crossbeam_channel::unbounded::<()>();
  let mut registered = Vec::new();
  for future in split.not_done.iter() {
    let tx = tx.clone();
    let key = future.register_done_callback(move |_| {
      let _ = tx.send(());
    });
    if let Some(key) = key {
      registered.push((future.clone(), key));
    }
  }
  drop(tx);

  let split = loop {
    let woke = match deadline {
      None => rx.recv().is_ok(),
      Some(deadline) => rx.recv_deadline(deadline).is_ok(),
    };
    let split = partition(&futures);
    if !woke || condition_met(mode, &split) {
      break split;
    }
  };

  // Futures still running must not keep this call's wakers alive.
  for (future, key) in registered {
    future.remove_done_callback(key);
  }
  trace!(mode = ?mode, done = split.done.len(), not_done = split.not_done.len(), "wait_for returning.");
  split
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  fn running_future(id: u64) -> TaskFuture<u32> {
    let future = TaskFuture::new(id, Arc::new(HashSet::new()));
    future.set_running();
    future
  }

  #[test]
  fn test_repeated_timed_waits_leave_no_callbacks_behind() {
    let future = running_future(1);
    for _ in 0..50 {
      let split = wait_for_timeout(vec![future.clone()], WaitMode::AllCompleted, Duration::from_millis(1));
      assert!(split.not_done.contains(&future));
    }
    assert_eq!(future.pending_callback_count(), 0);

    future.complete(Ok(3));
    let split = wait_for_timeout(vec![future.clone()], WaitMode::AllCompleted, Duration::from_millis(1));
    assert!(split.done.contains(&future));
  }

  #[test]
  fn test_dropped_as_completed_withdraws_callbacks() {
    let slow = running_future(2);
    let fast = running_future(3);
    {
      let mut iter = as_completed(vec![slow.clone(), fast.clone()]);
      fast.complete(Ok(1));
      assert_eq!(iter.next().unwrap(), fast);
      assert_eq!(slow.pending_callback_count(), 1);
    }
    assert_eq!(slow.pending_callback_count(), 0);
  }

  #[test]
  fn test_unique_futures_drops_duplicates_in_order() {
    let a = running_future(4);
    let b = running_future(5);
    let unique = unique_futures(vec![a.clone(), b.clone(), a.clone()]);
    assert_eq!(unique, vec![a, b]);
  }
}
