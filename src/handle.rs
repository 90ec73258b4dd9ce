use crate::error::PoolError;
use crate::task::TaskLabel;

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, error, trace};

/// The observable lifecycle state of a [`TaskFuture`].
///
/// `Cancelled`, `Completed` and `Failed` are terminal: once reached, the
/// future never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureState {
  Pending,
  Running,
  Cancelled,
  Completed,
  Failed,
}

impl FutureState {
  pub fn is_terminal(self) -> bool {
    matches!(self, FutureState::Cancelled | FutureState::Completed | FutureState::Failed)
  }
}

enum Outcome<T> {
  Pending,
  Running,
  Cancelled,
  /// `None` once the value was moved out by `into_result`.
  Completed(Option<T>),
  Failed(PoolError),
}

impl<T> Outcome<T> {
  fn state(&self) -> FutureState {
    match self {
      Outcome::Pending => FutureState::Pending,
      Outcome::Running => FutureState::Running,
      Outcome::Cancelled => FutureState::Cancelled,
      Outcome::Completed(_) => FutureState::Completed,
      Outcome::Failed(_) => FutureState::Failed,
    }
  }
}

type DoneCallback<T> = Box<dyn FnOnce(&TaskFuture<T>) + Send + 'static>;

struct Slot<T> {
  outcome: Outcome<T>,
  /// Keyed so a waiter that gives up can take its callback back.
  callbacks: Vec<(u64, DoneCallback<T>)>,
  next_callback_key: u64,
}

struct FutureCore<T> {
  task_id: u64,
  labels: Arc<HashSet<TaskLabel>>,
  slot: Mutex<Slot<T>>,
  settled: Condvar,
  settled_async: Notify,
}

/// A handle to a task submitted to a [`WorkerPool`](crate::WorkerPool).
///
/// Handles are cheap to clone; every clone observes the same task. Equality
/// and hashing use the task id, so handles can be collected into sets.
pub struct TaskFuture<T> {
  core: Arc<FutureCore<T>>,
}

impl<T> Clone for TaskFuture<T> {
  fn clone(&self) -> Self {
    Self { core: self.core.clone() }
  }
}

impl<T> PartialEq for TaskFuture<T> {
  fn eq(&self, other: &Self) -> bool {
    self.core.task_id == other.core.task_id
  }
}

impl<T> Eq for TaskFuture<T> {}

impl<T> Hash for TaskFuture<T> {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.core.task_id.hash(state);
  }
}

impl<T> fmt::Debug for TaskFuture<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.core.slot.try_lock().map(|slot| slot.outcome.state());
    f.debug_struct("TaskFuture")
      .field("task_id", &self.core.task_id)
      .field("labels", &self.core.labels)
      .field("state", &state)
      .finish()
  }
}

impl<T> TaskFuture<T> {
  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.core.task_id
  }

  /// Returns a clone of the labels associated with this task.
  pub fn labels(&self) -> HashSet<TaskLabel> {
    (*self.core.labels).clone()
  }

  pub(crate) fn labels_arc(&self) -> Arc<HashSet<TaskLabel>> {
    self.core.labels.clone()
  }

  pub fn state(&self) -> FutureState {
    self.core.slot.lock().outcome.state()
  }

  /// Returns `true` once the task is cancelled, completed or failed. Never blocks
  /// beyond the internal lock.
  pub fn is_done(&self) -> bool {
    self.state().is_terminal()
  }

  pub fn is_running(&self) -> bool {
    self.state() == FutureState::Running
  }

  pub fn is_cancelled(&self) -> bool {
    self.state() == FutureState::Cancelled
  }

  /// Drops a stored callback that has not run yet. Returns whether it was found.
  pub(crate) fn remove_done_callback(&self, key: u64) -> bool {
    let mut slot = self.core.slot.lock();
    let before = slot.callbacks.len();
    slot.callbacks.retain(|(k, _)| *k != key);
    slot.callbacks.len() != before
  }

  #[cfg(test)]
  pub(crate) fn pending_callback_count(&self) -> usize {
    self.core.slot.lock().callbacks.len()
  }
}

impl<T: Send + 'static> TaskFuture<T> {
  pub(crate) fn new(task_id: u64, labels: Arc<HashSet<TaskLabel>>) -> Self {
    Self {
      core: Arc::new(FutureCore {
        task_id,
        labels,
        slot: Mutex::new(Slot {
          outcome: Outcome::Pending,
          callbacks: Vec::new(),
          next_callback_key: 0,
        }),
        settled: Condvar::new(),
        settled_async: Notify::new(),
      }),
    }
  }

  /// Cancels the task if no worker has started it yet.
  ///
  /// Returns `true` only when this call moved the future from Pending to
  /// Cancelled. A running task is never interrupted, and a second call on an
  /// already cancelled future returns `false`.
  pub fn cancel(&self) -> bool {
    let callbacks = {
      let mut slot = self.core.slot.lock();
      if !matches!(slot.outcome, Outcome::Pending) {
        trace!(task_id = %self.core.task_id, state = ?slot.outcome.state(), "Cancel ignored, task is not pending.");
        return false;
      }
      slot.outcome = Outcome::Cancelled;
      self.core.settled.notify_all();
      std::mem::take(&mut slot.callbacks)
    };
    debug!(task_id = %self.core.task_id, "TaskFuture: Cancelled before execution.");
    self.after_settle(callbacks);
    true
  }

  /// Blocks until the task reaches a terminal state or `timeout` elapses.
  /// Returns whether the task is done.
  pub fn wait(&self, timeout: Option<Duration>) -> bool {
    self.wait_settled(timeout).is_ok()
  }

  /// Blocks until the task finishes and returns a clone of its value.
  ///
  /// # Errors
  /// Returns `PoolError::TaskFailed` if the task returned an error or panicked.
  /// Returns `PoolError::TaskCancelled` if the task was cancelled.
  /// Returns `PoolError::Timeout` if `timeout` elapsed first.
  /// Returns `PoolError::ResultUnavailable` if the value was already moved out.
  pub fn result(&self, timeout: Option<Duration>) -> Result<T, PoolError>
  where
    T: Clone,
  {
    let slot = self.wait_settled(timeout)?;
    match &slot.outcome {
      Outcome::Completed(Some(value)) => Ok(value.clone()),
      Outcome::Completed(None) => Err(PoolError::ResultUnavailable),
      Outcome::Failed(err) => Err(err.clone()),
      Outcome::Cancelled => Err(PoolError::TaskCancelled),
      Outcome::Pending | Outcome::Running => unreachable!("wait_settled returned before a terminal state"),
    }
  }

  /// Blocks until the task finishes and moves its value out.
  ///
  /// Other clones of this handle see `PoolError::ResultUnavailable` afterwards;
  /// errors are left in place and reported to every clone.
  pub fn into_result(self, timeout: Option<Duration>) -> Result<T, PoolError> {
    let mut slot = self.wait_settled(timeout)?;
    match &mut slot.outcome {
      Outcome::Completed(value) => value.take().ok_or(PoolError::ResultUnavailable),
      Outcome::Failed(err) => Err(err.clone()),
      Outcome::Cancelled => Err(PoolError::TaskCancelled),
      Outcome::Pending | Outcome::Running => unreachable!("wait_settled returned before a terminal state"),
    }
  }

  /// Blocks until the task finishes and returns the error it failed with, if any.
  ///
  /// # Errors
  /// Returns `PoolError::TaskCancelled` for a cancelled task and
  /// `PoolError::Timeout` if `timeout` elapsed first.
  pub fn error(&self, timeout: Option<Duration>) -> Result<Option<PoolError>, PoolError> {
    let slot = self.wait_settled(timeout)?;
    match &slot.outcome {
      Outcome::Failed(err) => Ok(Some(err.clone())),
      Outcome::Completed(_) => Ok(None),
      Outcome::Cancelled => Err(PoolError::TaskCancelled),
      Outcome::Pending | Outcome::Running => unreachable!("wait_settled returned before a terminal state"),
    }
  }

  /// Registers `callback` to run once the task is done.
  ///
  /// The callback runs on the thread that settles the task (usually a pool
  /// worker, or the caller of `cancel`). If the task is already done it runs
  /// immediately on the calling thread. Panics inside callbacks are logged and
  /// swallowed.
  pub fn add_done_callback(&self, callback: impl FnOnce(&TaskFuture<T>) + Send + 'static) {
    self.register_done_callback(callback);
  }

  /// Like `add_done_callback`, returning a key for `remove_done_callback` when
  /// the callback was stored rather than run immediately.
  pub(crate) fn register_done_callback(&self, callback: impl FnOnce(&TaskFuture<T>) + Send + 'static) -> Option<u64> {
    {
      let mut slot = self.core.slot.lock();
      if !slot.outcome.state().is_terminal() {
        let key = slot.next_callback_key;
        slot.next_callback_key += 1;
        slot.callbacks.push((key, Box::new(callback)));
        return Some(key);
      }
    }
    self.run_callback(Box::new(callback));
    None
  }

  /// Waits for the task to finish without blocking an async runtime thread.
  pub async fn wait_async(&self) {
    loop {
      let notified = self.core.settled_async.notified();
      if self.is_done() {
        return;
      }
      notified.await;
    }
  }

  /// Async counterpart of [`TaskFuture::result`] without a timeout.
  pub async fn result_async(&self) -> Result<T, PoolError>
  where
    T: Clone,
  {
    self.wait_async().await;
    self.result(None)
  }

  pub(crate) fn set_running(&self) -> bool {
    let mut slot = self.core.slot.lock();
    match slot.outcome {
      Outcome::Pending => {
        slot.outcome = Outcome::Running;
        true
      }
      _ => false,
    }
  }

  /// Stores the outcome of a running task and wakes every waiter.
  pub(crate) fn complete(&self, result: Result<T, PoolError>) {
    let callbacks = {
      let mut slot = self.core.slot.lock();
      if slot.outcome.state().is_terminal() {
        error!(task_id = %self.core.task_id, "Attempted to settle a task future twice; keeping the first outcome.");
        return;
      }
      slot.outcome = match result {
        Ok(value) => Outcome::Completed(Some(value)),
        Err(err) => Outcome::Failed(err),
      };
      self.core.settled.notify_all();
      std::mem::take(&mut slot.callbacks)
    };
    self.after_settle(callbacks);
  }

  pub(crate) fn fail_pending(&self, err: PoolError) -> bool {
    let callbacks = {
      let mut slot = self.core.slot.lock();
      if !matches!(slot.outcome, Outcome::Pending) {
        return false;
      }
      slot.outcome = Outcome::Failed(err);
      self.core.settled.notify_all();
      std::mem::take(&mut slot.callbacks)
    };
    self.after_settle(callbacks);
    true
  }

  fn wait_settled(&self, timeout: Option<Duration>) -> Result<MutexGuard<'_, Slot<T>>, PoolError> {
    let mut slot = self.core.slot.lock();
    let deadline = timeout.and_then(|d| Instant::now().checked_add(d));
    while !slot.outcome.state().is_terminal() {
      match deadline {
        None => self.core.settled.wait(&mut slot),
        Some(deadline) => {
          if self.core.settled.wait_until(&mut slot, deadline).timed_out() && !slot.outcome.state().is_terminal() {
            return Err(PoolError::Timeout(timeout.unwrap_or_default()));
          }
        }
      }
    }
    Ok(slot)
  }

  fn after_settle(&self, callbacks: Vec<(u64, DoneCallback<T>)>) {
    self.core.settled_async.notify_waiters();
    for (_, callback) in callbacks {
      self.run_callback(callback);
    }
  }

  fn run_callback(&self, callback: DoneCallback<T>) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
      error!(task_id = %self.core.task_id, "A done callback panicked during execution.");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::thread;

  fn pending_future() -> TaskFuture<String> {
    TaskFuture::new(7, Arc::new(HashSet::from(["unit".to_string()])))
  }

  #[test]
  fn test_cancel_only_succeeds_while_pending() {
    let future = pending_future();
    assert_eq!(future.state(), FutureState::Pending);
    assert!(future.cancel());
    assert!(future.is_cancelled());
    assert!(!future.cancel(), "second cancel must report no effect");
    assert!(!future.set_running(), "a cancelled future must never start");
    assert!(matches!(future.result(None), Err(PoolError::TaskCancelled)));
  }

  #[test]
  fn test_cancel_fails_once_running() {
    let future = pending_future();
    assert!(future.set_running());
    assert!(!future.cancel());
    assert!(future.is_running());
    future.complete(Ok("done".to_string()));
    assert_eq!(future.result(None).unwrap(), "done");
    assert!(!future.cancel());
  }

  #[test]
  fn test_result_times_out_while_running() {
    let future = pending_future();
    future.set_running();
    let started = Instant::now();
    match future.result(Some(Duration::from_millis(30))) {
      Err(PoolError::Timeout(d)) => assert_eq!(d, Duration::from_millis(30)),
      other => panic!("Expected Timeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(!future.is_done());
  }

  #[test]
  fn test_result_wakes_blocked_reader() {
    let future = pending_future();
    future.set_running();
    let reader = {
      let future = future.clone();
      thread::spawn(move || future.result(None))
    };
    thread::sleep(Duration::from_millis(20));
    future.complete(Ok("woken".to_string()));
    assert_eq!(reader.join().unwrap().unwrap(), "woken");
  }

  #[test]
  fn test_into_result_moves_value_out_once() {
    let future = pending_future();
    future.set_running();
    future.complete(Ok("moved".to_string()));
    let clone = future.clone();
    assert_eq!(future.into_result(None).unwrap(), "moved");
    assert!(clone.is_done());
    assert!(matches!(clone.result(None), Err(PoolError::ResultUnavailable)));
  }

  #[test]
  fn test_done_callbacks_run_once_and_immediately_when_done() {
    let calls = Arc::new(AtomicUsize::new(0));
    let future = pending_future();
    {
      let calls = calls.clone();
      future.add_done_callback(move |f| {
        assert!(f.is_done());
        calls.fetch_add(1, Ordering::SeqCst);
      });
    }
    future.add_done_callback(|_| panic!("callback panics are contained"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    future.set_running();
    future.complete(Err(PoolError::TaskCancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let calls_late = calls.clone();
    future.add_done_callback(move |_| {
      calls_late.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_removed_callback_never_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let future = pending_future();
    let keys: Vec<u64> = (0..3)
      .map(|_| {
        let calls = calls.clone();
        future
          .register_done_callback(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
          })
          .unwrap()
      })
      .collect();
    assert!(future.remove_done_callback(keys[1]));
    assert!(!future.remove_done_callback(keys[1]));
    assert_eq!(future.pending_callback_count(), 2);

    future.cancel();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(future.pending_callback_count(), 0);
    assert!(future.register_done_callback(|_| {}).is_none());
  }

  #[test]
  fn test_fail_pending_sets_failed_state() {
    let future = pending_future();
    assert!(future.fail_pending(PoolError::PoolBroken("init".to_string())));
    assert_eq!(future.state(), FutureState::Failed);
    assert!(matches!(future.error(None), Ok(Some(PoolError::PoolBroken(_)))));
    assert!(!future.fail_pending(PoolError::PoolShuttingDown));
  }

  #[test]
  fn test_equality_follows_task_id() {
    let a = pending_future();
    let b = a.clone();
    let c = TaskFuture::<String>::new(8, Arc::new(HashSet::new()));
    assert_eq!(a, b);
    assert_ne!(a, c);
    let set: HashSet<_> = [a, b, c].into_iter().collect();
    assert_eq!(set.len(), 2);
  }

  #[tokio::test]
  async fn test_wait_async_observes_completion_from_thread() {
    let future = pending_future();
    future.set_running();
    let completer = future.clone();
    let worker = thread::spawn(move || {
      thread::sleep(Duration::from_millis(20));
      completer.complete(Ok("async".to_string()));
    });
    assert_eq!(future.result_async().await.unwrap(), "async");
    worker.join().unwrap();
  }
}
