use crate::task::QueuedTask;

use std::collections::VecDeque;
use std::fmt;

use parking_lot::{Condvar, Mutex};

struct QueueState {
  tasks: VecDeque<QueuedTask>,
  closed: bool,
  /// Workers currently parked in `pop` waiting for work.
  idle: usize,
}

/// The pool's FIFO of submitted tasks awaiting a worker.
///
/// A single mutex guards the queue, the closed flag and the idle-worker count,
/// so a task is handed to exactly one worker and a push never races a close.
pub(crate) struct TaskQueue {
  state: Mutex<QueueState>,
  available: Condvar,
}

impl fmt::Debug for TaskQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("TaskQueue")
      .field("len", &state.tasks.len())
      .field("closed", &state.closed)
      .field("idle", &state.idle)
      .finish()
  }
}

impl TaskQueue {
  pub(crate) fn new() -> Self {
    Self {
      state: Mutex::new(QueueState {
        tasks: VecDeque::new(),
        closed: false,
        idle: 0,
      }),
      available: Condvar::new(),
    }
  }

  /// Appends a task. Hands the task back if the queue has been closed.
  ///
  /// On success returns how many queued tasks are not covered by an idle
  /// worker, i.e. whether the pool should consider starting another thread.
  pub(crate) fn push(&self, task: QueuedTask) -> Result<usize, QueuedTask> {
    let backlog = {
      let mut state = self.state.lock();
      if state.closed {
        return Err(task);
      }
      state.tasks.push_back(task);
      state.tasks.len().saturating_sub(state.idle)
    };
    self.available.notify_one();
    Ok(backlog)
  }

  /// Takes the oldest task, blocking while the queue is empty.
  ///
  /// Returns `None` once the queue is closed and fully drained.
  pub(crate) fn pop(&self) -> Option<QueuedTask> {
    let mut state = self.state.lock();
    loop {
      if let Some(task) = state.tasks.pop_front() {
        return Some(task);
      }
      if state.closed {
        return None;
      }
      state.idle += 1;
      self.available.wait(&mut state);
      state.idle -= 1;
    }
  }

  /// Stops accepting new tasks. Tasks already queued can still be popped.
  pub(crate) fn close(&self) {
    self.state.lock().closed = true;
    self.available.notify_all();
  }

  /// Removes and returns every task still waiting for a worker.
  pub(crate) fn drain(&self) -> Vec<QueuedTask> {
    self.state.lock().tasks.drain(..).collect()
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  pub(crate) fn len(&self) -> usize {
    self.state.lock().tasks.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handle::TaskFuture;
  use std::collections::HashSet;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::thread;
  use std::time::Duration;

  // Helper to create a dummy QueuedTask for testing the queue.
  fn dummy_task(id: u64) -> QueuedTask {
    let future = TaskFuture::<String>::new(id, Arc::new(HashSet::new()));
    QueuedTask::new(&future, || Ok("done".to_string()))
  }

  #[test]
  fn test_queue_is_fifo() {
    let queue = TaskQueue::new();
    for id in 1..=3 {
      assert!(queue.push(dummy_task(id)).is_ok());
    }
    assert_eq!(queue.len(), 3);
    let order: Vec<u64> = (0..3).map(|_| queue.pop().unwrap().task_id).collect();
    assert_eq!(order, vec![1, 2, 3]);
  }

  #[test]
  fn test_push_reports_backlog_against_idle_workers() {
    let queue = Arc::new(TaskQueue::new());
    assert_eq!(queue.push(dummy_task(1)).ok(), Some(1));
    assert_eq!(queue.pop().unwrap().task_id, 1);

    let waiter = {
      let queue = queue.clone();
      thread::spawn(move || queue.pop().map(|t| t.task_id))
    };
    while queue.state.lock().idle == 0 {
      thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(queue.push(dummy_task(2)).ok(), Some(0));
    assert_eq!(waiter.join().unwrap(), Some(2));
  }

  #[test]
  fn test_close_rejects_push_and_releases_consumers() {
    let queue = Arc::new(TaskQueue::new());
    assert!(queue.push(dummy_task(1)).is_ok());

    let consumer = {
      let queue = queue.clone();
      thread::spawn(move || {
        let mut seen = Vec::new();
        while let Some(task) = queue.pop() {
          seen.push(task.task_id);
        }
        seen
      })
    };

    thread::sleep(Duration::from_millis(20));
    queue.close();
    assert!(queue.is_closed());
    let rejected = queue.push(dummy_task(2)).unwrap_err();
    assert_eq!(rejected.task_id, 2);
    assert_eq!(consumer.join().unwrap(), vec![1]);
  }

  #[test]
  fn test_drain_empties_queue() {
    let queue = TaskQueue::new();
    for id in 0..4 {
      assert!(queue.push(dummy_task(id)).is_ok());
    }
    let drained = queue.drain();
    assert_eq!(drained.len(), 4);
    assert_eq!(queue.len(), 0);
  }

  #[test]
  fn test_concurrent_consumers_never_share_a_task() {
    let queue = Arc::new(TaskQueue::new());
    let num_tasks: u64 = 200;
    let popped = Arc::new(AtomicUsize::new(0));

    let consumers: Vec<_> = (0..4)
      .map(|_| {
        let queue = queue.clone();
        let popped = popped.clone();
        thread::spawn(move || {
          let mut ids = Vec::new();
          while let Some(task) = queue.pop() {
            popped.fetch_add(1, Ordering::SeqCst);
            ids.push(task.task_id);
          }
          ids
        })
      })
      .collect();

    for id in 0..num_tasks {
      assert!(queue.push(dummy_task(id)).is_ok());
    }
    queue.close();

    let mut all: Vec<u64> = consumers.into_iter().flat_map(|c| c.join().unwrap()).collect();
    all.sort_unstable();
    assert_eq!(all, (0..num_tasks).collect::<Vec<_>>());
    assert_eq!(popped.load(Ordering::SeqCst), num_tasks as usize);
  }
}
