use crate::error::{PoolError, TaskError};
use crate::task::TaskLabel;

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::SystemTime;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, info_span, trace, warn};

// --- Public Event Structs for Handlers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Success,
  Failed,
  Panicked,
  Cancelled,
  PoolBroken,
}

impl<R> From<&Result<R, PoolError>> for TaskCompletionStatus {
  fn from(result: &Result<R, PoolError>) -> Self {
    match result {
      Ok(_) => TaskCompletionStatus::Success,
      Err(PoolError::TaskFailed(TaskError::Panicked(_))) => TaskCompletionStatus::Panicked,
      Err(PoolError::TaskCancelled) => TaskCompletionStatus::Cancelled,
      Err(PoolError::PoolBroken(_)) => TaskCompletionStatus::PoolBroken,
      Err(_) => TaskCompletionStatus::Failed,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub pool_name: Arc<String>,
  pub labels: Arc<HashSet<TaskLabel>>,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

// --- CompletionNotifier Struct ---

struct NotifierInternalState {
  rx_for_init: Option<Receiver<TaskCompletionInfo>>,
  worker_join_handle: Option<JoinHandle<()>>,
  worker_thread_id: Option<ThreadId>,
}

/// Fans task completions out to pool-wide handlers on a dedicated thread.
///
/// The thread is only started when the first handler is registered; until
/// then completions are not queued at all.
pub(crate) struct CompletionNotifier {
  pool_name: Arc<String>,
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  init_once: Once,
  sender: Mutex<Option<Sender<TaskCompletionInfo>>>,
  internal_state_for_init: Mutex<NotifierInternalState>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("CompletionNotifier")
      .field("pool_name", &self.pool_name)
      .field("handler_count", &handler_count)
      .field("initialized", &self.init_once.is_completed())
      .finish()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(pool_name: Arc<String>) -> Self {
    let (tx, rx) = crossbeam_channel::unbounded();
    Self {
      pool_name,
      handlers: Arc::new(RwLock::new(Vec::new())),
      init_once: Once::new(),
      sender: Mutex::new(Some(tx)),
      internal_state_for_init: Mutex::new(NotifierInternalState {
        rx_for_init: Some(rx),
        worker_join_handle: None,
        worker_thread_id: None,
      }),
    }
  }

  fn ensure_worker_initialized(&self) {
    self.init_once.call_once(|| {
      let mut state_guard = self.internal_state_for_init.lock();
      let Some(rx) = state_guard.rx_for_init.take() else {
        warn!(pool_name = %*self.pool_name, "Notifier initialization: receiver already taken.");
        return;
      };
      info!(pool_name = %*self.pool_name, "First completion handler added. Initializing notification worker.");

      let worker_handlers = self.handlers.clone();
      let worker_pool_name = self.pool_name.clone();
      let spawn_result = thread::Builder::new()
        .name(format!("{}_notifier", self.pool_name))
        .spawn(move || {
          let _span = info_span!("notification_worker_loop", pool_name = %*worker_pool_name).entered();
          Self::run_notification_worker_loop(rx, worker_handlers);
        });

      match spawn_result {
        Ok(handle) => {
          state_guard.worker_thread_id = Some(handle.thread().id());
          state_guard.worker_join_handle = Some(handle);
        }
        Err(e) => {
          error!(pool_name = %*self.pool_name, "Notifier: Failed to start notification worker: {}", e);
          self.sender.lock().take();
        }
      }
    });
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.ensure_worker_initialized();
    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(pool_name = %*self.pool_name, "Notifier: Added new completion handler. Total handlers: {}", handlers_guard.len());
  }

  /// Queues a completion for the handlers. A no-op until a handler exists.
  pub(crate) fn notify(&self, task_id: u64, labels: Arc<HashSet<TaskLabel>>, status: TaskCompletionStatus) {
    if !self.init_once.is_completed() {
      return;
    }
    let info = TaskCompletionInfo {
      task_id,
      pool_name: self.pool_name.clone(),
      labels,
      status,
      completion_time: SystemTime::now(),
    };
    match self.sender.lock().as_ref() {
      Some(tx) => {
        if tx.send(info).is_err() {
          warn!(pool_name = %*self.pool_name, %task_id, "Notifier: Worker gone, completion notification dropped.");
        }
      }
      None => {
        trace!(pool_name = %*self.pool_name, %task_id, "Notifier: Already shut down, completion notification dropped.");
      }
    }
  }

  fn run_notification_worker_loop(queue_rx: Receiver<TaskCompletionInfo>, handlers_list: Arc<RwLock<Vec<CompletionHandler>>>) {
    info!("Notification worker started. Will process messages until its input queue is closed.");

    // recv() only fails once the sender is dropped and the queue is empty,
    // so every completion sent before shutdown is delivered.
    for info in queue_rx.iter() {
      // Clone the list so handlers may register further handlers without deadlocking.
      let handlers: Vec<CompletionHandler> = handlers_list.read().clone();
      if handlers.is_empty() {
        trace!(task_id = %info.task_id, "No completion handlers registered, dropping notification.");
        continue;
      }

      debug!(task_id = %info.task_id, status = ?info.status, "Dispatching notification to {} handlers.", handlers.len());
      for handler in handlers.iter() {
        let info_for_handler = info.clone();
        if panic::catch_unwind(AssertUnwindSafe(|| handler(info_for_handler))).is_err() {
          error!(
            "A completion handler panicked during execution. Pool: {}, Task ID: {}",
            info.pool_name, info.task_id
          );
        }
      }
    }

    info!("Notification worker stopped (input queue fully closed and processed).");
  }

  /// Whether the caller is running on the notification thread, i.e. inside a handler.
  pub(crate) fn is_current_thread(&self) -> bool {
    self.internal_state_for_init.lock().worker_thread_id == Some(thread::current().id())
  }

  /// Closes the notification queue and joins the worker once it has delivered
  /// everything already queued.
  pub(crate) fn shutdown(&self) {
    self.sender.lock().take();
    let handle_option = self.internal_state_for_init.lock().worker_join_handle.take();

    match handle_option {
      Some(handle) if handle.thread().id() == thread::current().id() => {
        debug!(pool_name = %*self.pool_name, "Notifier: Shutdown requested from a handler; not joining own thread.");
      }
      Some(handle) => {
        info!(pool_name = %*self.pool_name, "Notifier: Waiting for notification worker loop to join.");
        if handle.join().is_err() {
          error!(pool_name = %*self.pool_name, "Notifier: Notification worker panicked.");
        } else {
          debug!(pool_name = %*self.pool_name, "Notifier: Notification worker loop successfully joined.");
        }
      }
      None => {
        trace!(pool_name = %*self.pool_name, "Notifier: Worker was not initialized or already joined.");
      }
    }
  }
}
