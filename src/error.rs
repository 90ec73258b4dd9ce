use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur within the `thread_orchestra` pool and gate.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,

  #[error("Pool is broken and cannot run tasks: {0}")]
  PoolBroken(String),

  #[error("Failed to start a worker thread: {0}")]
  WorkerSpawn(String),

  #[error("Task failed: {0}")]
  TaskFailed(#[from] TaskError),

  #[error("Task was cancelled")]
  TaskCancelled,

  #[error("Timed out after {0:?} waiting for completion")]
  Timeout(Duration),

  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error("Gate released more times than it was acquired (capacity {capacity})")]
  ReleaseWithoutAcquire { capacity: usize },

  #[error("Task result already taken from this future")]
  ResultUnavailable,
}

impl PoolError {
  /// Returns the wrapped task error when this is `PoolError::TaskFailed`.
  pub fn task_error(&self) -> Option<&TaskError> {
    match self {
      PoolError::TaskFailed(e) => Some(e),
      _ => None,
    }
  }
}

/// The error a submitted task produced, captured on the worker thread and
/// stored in the task's future.
#[derive(Clone)]
pub enum TaskError {
  /// The work returned `Err(e)`.
  Failed(Arc<dyn StdError + Send + Sync + 'static>),
  /// The work panicked. Holds the panic message when it was a string.
  Panicked(String),
}

impl TaskError {
  pub(crate) fn failed<E>(err: E) -> Self
  where
    E: StdError + Send + Sync + 'static,
  {
    TaskError::Failed(Arc::new(err))
  }

  pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
      (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
      s.clone()
    } else {
      "non-string panic payload".to_string()
    };
    TaskError::Panicked(message)
  }

  pub fn is_panic(&self) -> bool {
    matches!(self, TaskError::Panicked(_))
  }

  /// Attempts to view the original error returned by the task as `E`.
  pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
    match self {
      TaskError::Failed(inner) => inner.downcast_ref::<E>(),
      TaskError::Panicked(_) => None,
    }
  }
}

impl fmt::Debug for TaskError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskError::Failed(inner) => f.debug_tuple("Failed").field(&inner.to_string()).finish(),
      TaskError::Panicked(msg) => f.debug_tuple("Panicked").field(msg).finish(),
    }
  }
}

impl fmt::Display for TaskError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskError::Failed(inner) => write!(f, "{}", inner),
      TaskError::Panicked(msg) => write!(f, "task panicked: {}", msg),
    }
  }
}

impl StdError for TaskError {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    match self {
      TaskError::Failed(inner) => Some(inner.as_ref() as &(dyn StdError + 'static)),
      TaskError::Panicked(_) => None,
    }
  }
}
