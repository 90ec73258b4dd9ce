use crate::error::{PoolError, TaskError};
use crate::handle::{FutureState, TaskFuture};
use crate::notifier::TaskCompletionStatus;

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace};

/// A descriptive label for a task, typically a `String`.
pub type TaskLabel = String;

/// The body a worker thread runs for one task. It executes the caller's work,
/// settles the task's future and reports how the task ended.
pub(crate) type TaskBody = Box<dyn FnOnce() -> TaskCompletionStatus + Send + 'static>;

/// Type-erased control over a task's future, used by the pool where the
/// result type is not known (queue, live registry, label cancellation).
pub(crate) trait TaskControl: Send + Sync {
  /// Moves the future from Pending to Running. Returns `false` if it was
  /// cancelled before a worker picked it up.
  fn try_start(&self) -> bool;

  /// Cancels a Pending future.
  fn cancel(&self) -> bool;

  /// Fails a Pending future with a pool-level error without running it.
  fn abort(&self, err: PoolError) -> bool;

  fn state(&self) -> FutureState;
}

impl<T: Send + 'static> TaskControl for TaskFuture<T> {
  fn try_start(&self) -> bool {
    self.set_running()
  }

  fn cancel(&self) -> bool {
    TaskFuture::cancel(self)
  }

  fn abort(&self, err: PoolError) -> bool {
    self.fail_pending(err)
  }

  fn state(&self) -> FutureState {
    TaskFuture::state(self)
  }
}

/// Internal representation of a task managed by the pool.
pub(crate) struct QueuedTask {
  pub(crate) task_id: u64,
  pub(crate) labels: Arc<HashSet<TaskLabel>>,
  pub(crate) control: Arc<dyn TaskControl>,
  pub(crate) body: TaskBody,
}

impl QueuedTask {
  /// Wraps `work` so that its outcome (value, error or panic) lands in `future`.
  pub(crate) fn new<T, F>(future: &TaskFuture<T>, work: F) -> Self
  where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TaskError> + Send + 'static,
  {
    let completer = future.clone();
    let task_id = future.id();
    let body: TaskBody = Box::new(move || {
      let result: Result<T, PoolError> = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => {
          trace!(%task_id, "Task executed successfully.");
          Ok(value)
        }
        Ok(Err(task_error)) => {
          trace!(%task_id, error = %task_error, "Task returned an error.");
          Err(PoolError::TaskFailed(task_error))
        }
        Err(panic_payload) => {
          error!(%task_id, "Task panicked during execution.");
          Err(PoolError::TaskFailed(TaskError::from_panic(panic_payload)))
        }
      };
      let status = TaskCompletionStatus::from(&result);
      completer.complete(result);
      status
    });

    Self {
      task_id,
      labels: future.labels_arc(),
      control: Arc::new(future.clone()),
      body,
    }
  }
}

impl std::fmt::Debug for QueuedTask {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueuedTask")
      .field("task_id", &self.task_id)
      .field("labels", &self.labels)
      .field("state", &self.control.state())
      .finish_non_exhaustive()
  }
}
