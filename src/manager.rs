use crate::config::{PoolConfig, WorkerPoolBuilder};
use crate::error::{PoolError, TaskError};
use crate::handle::TaskFuture;
use crate::notifier::{CompletionNotifier, TaskCompletionInfo, TaskCompletionStatus};
use crate::task::{QueuedTask, TaskControl, TaskLabel};
use crate::task_queue::TaskQueue;

use std::collections::HashSet;
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines how the pool should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
  /// Runs every task already queued, then stops the workers.
  #[default]
  Graceful,
  /// Cancels every task that has not started yet. Running tasks still finish.
  CancelPending,
}

struct LiveTask {
  control: Arc<dyn TaskControl>,
  labels: Arc<HashSet<TaskLabel>>,
}

struct WorkerSet {
  handles: Vec<JoinHandle<()>>,
  thread_ids: Vec<ThreadId>,
  spawned: usize,
  /// Set by shutdown once it has taken the handles; no thread may start after.
  sealed: bool,
  /// Set once the shutdown call that took the handles has joined them.
  joined: bool,
}

/// State shared between the pool handle and its worker threads.
struct PoolShared {
  pool_name: Arc<String>,
  config: PoolConfig,
  queue: TaskQueue,
  live_tasks: DashMap<u64, LiveTask>,
  running: AtomicUsize,
  shutdown_token: CancellationToken,
  broken: Mutex<Option<String>>,
  notifier: CompletionNotifier,
}

impl PoolShared {
  /// Drops a task from the live registry and reports how it ended.
  fn finish_task(&self, task_id: u64, labels: Arc<HashSet<TaskLabel>>, status: TaskCompletionStatus) {
    self.live_tasks.remove(&task_id);
    debug!(pool_name = %*self.pool_name, %task_id, ?status, "Managed task finished processing, removed active info.");
    self.notifier.notify(task_id, labels, status);
  }

  fn cancel_queued(&self, task: QueuedTask) {
    let QueuedTask { task_id, labels, control, .. } = task;
    if control.cancel() {
      debug!(pool_name = %*self.pool_name, %task_id, "Cancelled queued task during shutdown.");
    }
    self.finish_task(task_id, labels, TaskCompletionStatus::Cancelled);
  }

  /// Marks the pool unusable after a worker initializer failed and fails every
  /// task that was waiting.
  fn mark_broken(&self, reason: String) {
    {
      let mut broken = self.broken.lock();
      if broken.is_none() {
        *broken = Some(reason.clone());
      }
    }
    self.queue.close();
    let stranded = self.queue.drain();
    if !stranded.is_empty() {
      warn!(pool_name = %*self.pool_name, "Failing {} queued tasks because the pool is broken.", stranded.len());
    }
    for task in stranded {
      let QueuedTask { task_id, labels, control, .. } = task;
      control.abort(PoolError::PoolBroken(reason.clone()));
      self.finish_task(task_id, labels, TaskCompletionStatus::PoolBroken);
    }
  }

  fn run_worker(self: Arc<Self>, index: usize) {
    let _span = info_span!("pool_worker", pool_name = %*self.pool_name, worker = index).entered();

    if let Some(init) = self.config.initializer.clone() {
      if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| init())) {
        let reason = format!("worker initializer failed: {}", TaskError::from_panic(payload));
        error!(pool_name = %*self.pool_name, worker = index, "{}", reason);
        self.mark_broken(reason);
        return;
      }
    }

    info!(pool_name = %*self.pool_name, worker = index, "Worker started.");

    while let Some(task) = self.queue.pop() {
      let QueuedTask { task_id, labels, control, body } = task;

      if !control.try_start() {
        debug!(pool_name = %*self.pool_name, %task_id, labels = ?labels, "Dequeued task already cancelled.");
        drop(body);
        self.finish_task(task_id, labels, TaskCompletionStatus::Cancelled);
        continue;
      }

      let now_running = self.running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
      trace!(pool_name = %*self.pool_name, %task_id, now_running, "Dequeued task. Running.");

      let status = info_span!("managed_task", pool_name = %*self.pool_name, %task_id).in_scope(body);

      self.running.fetch_sub(1, AtomicOrdering::SeqCst);
      self.finish_task(task_id, labels, status);
    }

    info!(pool_name = %*self.pool_name, worker = index, "Worker stopped.");
  }
}

/// A fixed-size pool of OS worker threads executing submitted closures in
/// submission order.
///
/// Every submission returns a [`TaskFuture`] immediately. Threads are started
/// on demand until `max_workers` exist, so at most `max_workers` tasks ever
/// run at once.
pub struct WorkerPool {
  shared: Arc<PoolShared>,
  workers: Mutex<WorkerSet>,
  workers_joined: Condvar,
}

impl std::fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerPool")
      .field("name", &*self.shared.pool_name)
      .field("max_workers", &self.shared.config.max_workers)
      .field("queue", &self.shared.queue)
      .field("running", &self.running_task_count())
      .field("notifier", &self.shared.notifier)
      .finish()
  }
}

impl WorkerPool {
  /// Creates a pool with at most `max_workers` threads.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidArgument` when `max_workers` is 0.
  pub fn new(max_workers: usize, pool_name: &str) -> Result<Arc<Self>, PoolError> {
    WorkerPoolBuilder::new().max_workers(max_workers).name(pool_name).build()
  }

  pub fn builder() -> WorkerPoolBuilder {
    WorkerPoolBuilder::new()
  }

  pub(crate) fn from_config(config: PoolConfig) -> Arc<Self> {
    let pool_name = Arc::new(config.name.clone());
    info!(pool_name = %*pool_name, max_workers = config.max_workers, "Creating worker pool.");
    Arc::new(Self {
      shared: Arc::new(PoolShared {
        pool_name: pool_name.clone(),
        config,
        queue: TaskQueue::new(),
        live_tasks: DashMap::new(),
        running: AtomicUsize::new(0),
        shutdown_token: CancellationToken::new(),
        broken: Mutex::new(None),
        notifier: CompletionNotifier::new(pool_name),
      }),
      workers: Mutex::new(WorkerSet {
        handles: Vec::new(),
        thread_ids: Vec::new(),
        spawned: 0,
        sealed: false,
        joined: false,
      }),
      workers_joined: Condvar::new(),
    })
  }

  pub fn name(&self) -> &str {
    &self.shared.pool_name
  }

  pub fn config(&self) -> &PoolConfig {
    &self.shared.config
  }

  pub fn max_workers(&self) -> usize {
    self.shared.config.max_workers
  }

  /// Number of worker threads started so far.
  pub fn worker_count(&self) -> usize {
    self.workers.lock().spawned
  }

  /// Number of tasks currently executing on a worker.
  pub fn running_task_count(&self) -> usize {
    self.shared.running.load(AtomicOrdering::SeqCst)
  }

  /// Returns the current number of tasks in the pending queue.
  pub fn queued_task_count(&self) -> usize {
    self.shared.queue.len()
  }

  /// Tasks submitted and not yet settled, queued or running. Cancelled
  /// tasks leave the count as soon as they are cancelled.
  pub fn live_task_count(&self) -> usize {
    self.shared.live_tasks.len()
  }

  pub fn is_shutdown(&self) -> bool {
    self.shared.shutdown_token.is_cancelled()
  }

  /// A token cancelled when shutdown begins, for callers that want to stop
  /// producing work (including from async code via `cancelled().await`).
  pub fn shutdown_token(&self) -> CancellationToken {
    self.shared.shutdown_token.clone()
  }

  /// Registers a handler called once for every task that finishes, fails, panics
  /// or is cancelled. Handlers run in completion order on a dedicated thread.
  pub fn add_completion_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.shared.notifier.add_handler(handler);
  }

  /// Submits `work` for execution and returns its future without blocking.
  ///
  /// # Errors
  /// Returns `PoolError::PoolShuttingDown` after shutdown has begun and
  /// `PoolError::PoolBroken` if a worker initializer failed.
  pub fn submit<T, F>(&self, work: F) -> Result<TaskFuture<T>, PoolError>
  where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
  {
    self.submit_labeled(HashSet::new(), work)
  }

  /// Like [`WorkerPool::submit`], tagging the task with `labels` so it can be
  /// cancelled with [`WorkerPool::cancel_tasks_by_label`].
  pub fn submit_labeled<T, F>(&self, labels: HashSet<TaskLabel>, work: F) -> Result<TaskFuture<T>, PoolError>
  where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
  {
    self.enqueue(labels, move || Ok(work()))
  }

  /// Submits fallible work. An `Err` returned by `work` fails the future with
  /// `PoolError::TaskFailed`.
  pub fn try_submit<T, E, F>(&self, work: F) -> Result<TaskFuture<T>, PoolError>
  where
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
  {
    self.try_submit_labeled(HashSet::new(), work)
  }

  pub fn try_submit_labeled<T, E, F>(&self, labels: HashSet<TaskLabel>, work: F) -> Result<TaskFuture<T>, PoolError>
  where
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
  {
    self.enqueue(labels, move || work().map_err(TaskError::failed))
  }

  fn enqueue<T, F>(&self, labels: HashSet<TaskLabel>, work: F) -> Result<TaskFuture<T>, PoolError>
  where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TaskError> + Send + 'static,
  {
    if let Some(reason) = self.shared.broken.lock().clone() {
      warn!(pool_name = %*self.shared.pool_name, "Submit: Attempted to submit task to a broken pool.");
      return Err(PoolError::PoolBroken(reason));
    }
    if self.shared.shutdown_token.is_cancelled() {
      warn!(pool_name = %*self.shared.pool_name, "Submit: Attempted to submit task to a pool that is shutting down or closed.");
      return Err(PoolError::PoolShuttingDown);
    }

    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let future = TaskFuture::new(task_id, Arc::new(labels));
    let queued = QueuedTask::new(&future, work);

    // Register before queueing so a fast worker never finishes a task that is
    // not yet in the registry.
    self.shared.live_tasks.insert(
      task_id,
      LiveTask {
        control: queued.control.clone(),
        labels: queued.labels.clone(),
      },
    );
    // Settling by any path, including a caller's cancel, ends the registration.
    let registry = Arc::downgrade(&self.shared);
    future.add_done_callback(move |settled| {
      if let Some(shared) = registry.upgrade() {
        shared.live_tasks.remove(&settled.id());
      }
    });

    debug!(pool_name = %*self.shared.pool_name, %task_id, labels = ?queued.labels, "Submitting task to queue.");

    let backlog = match self.shared.queue.push(queued) {
      Ok(backlog) => backlog,
      Err(rejected) => {
        self.shared.live_tasks.remove(&rejected.task_id);
        warn!(pool_name = %*self.shared.pool_name, %task_id, "Submit: Queue closed while submitting.");
        return Err(match self.shared.broken.lock().clone() {
          Some(reason) => PoolError::PoolBroken(reason),
          None => PoolError::PoolShuttingDown,
        });
      }
    };

    if backlog > 0 {
      self.start_worker_if_needed()?;
    }
    Ok(future)
  }

  fn start_worker_if_needed(&self) -> Result<(), PoolError> {
    let mut workers = self.workers.lock();
    if workers.sealed || workers.spawned >= self.shared.config.max_workers {
      return Ok(());
    }

    let index = workers.spawned;
    let mut builder = thread::Builder::new().name(format!("{}_{}", self.shared.config.thread_name_prefix, index));
    if let Some(stack_size) = self.shared.config.stack_size {
      builder = builder.stack_size(stack_size);
    }

    let worker_shared = self.shared.clone();
    match builder.spawn(move || worker_shared.run_worker(index)) {
      Ok(handle) => {
        workers.thread_ids.push(handle.thread().id());
        workers.handles.push(handle);
        workers.spawned += 1;
        debug!(pool_name = %*self.shared.pool_name, worker = index, "Started worker thread.");
        Ok(())
      }
      Err(e) if workers.spawned == 0 => {
        error!(pool_name = %*self.shared.pool_name, "Failed to start the first worker thread: {}", e);
        drop(workers);
        // Nothing can ever run what is queued.
        for task in self.shared.queue.drain() {
          let QueuedTask { task_id, labels, control, .. } = task;
          control.abort(PoolError::WorkerSpawn(e.to_string()));
          self.shared.finish_task(task_id, labels, TaskCompletionStatus::Failed);
        }
        Err(PoolError::WorkerSpawn(e.to_string()))
      }
      Err(e) => {
        warn!(pool_name = %*self.shared.pool_name, "Failed to start an additional worker thread, continuing with {}: {}", workers.spawned, e);
        Ok(())
      }
    }
  }

  pub fn cancel_tasks_by_label(&self, label_to_cancel: &TaskLabel) -> usize {
    self.cancel_tasks_by_labels(&HashSet::from_iter([label_to_cancel.clone()]))
  }

  /// Cancels every task sharing at least one label with `labels_to_cancel` that
  /// has not started yet. Returns how many tasks were cancelled.
  pub fn cancel_tasks_by_labels(&self, labels_to_cancel: &HashSet<TaskLabel>) -> usize {
    if labels_to_cancel.is_empty() {
      return 0;
    }
    info!(pool_name = %*self.shared.pool_name, "Requesting cancellation for pending tasks with labels: {:?}", labels_to_cancel);

    // Collect first: cancelling runs done callbacks, which may submit new tasks.
    let matching: Vec<(u64, Arc<dyn TaskControl>)> = self
      .shared
      .live_tasks
      .iter()
      .filter(|entry| !entry.value().labels.is_disjoint(labels_to_cancel))
      .map(|entry| (*entry.key(), entry.value().control.clone()))
      .collect();

    let mut cancelled = 0;
    for (task_id, control) in matching {
      if control.cancel() {
        debug!(pool_name = %*self.shared.pool_name, %task_id, "Cancelled pending task due to label match.");
        cancelled += 1;
      }
    }
    cancelled
  }

  /// Stops accepting tasks and waits for the workers to exit.
  ///
  /// With [`ShutdownMode::Graceful`] every queued task still runs; with
  /// [`ShutdownMode::CancelPending`] queued tasks are cancelled. Running tasks
  /// always finish. Safe to call more than once and from inside a task (the
  /// calling worker is then not joined).
  pub fn shutdown(&self, mode: ShutdownMode) {
    let already_initiating_shutdown = self.shared.shutdown_token.is_cancelled();
    if !already_initiating_shutdown {
      info!(pool_name = %*self.shared.pool_name, "Initiating explicit pool shutdown (mode: {:?}).", mode);
      self.shared.shutdown_token.cancel();
      self.shared.queue.close();
    } else {
      info!(pool_name = %*self.shared.pool_name, "Shutdown already in progress or initiated by another call/Drop.");
    }

    if mode == ShutdownMode::CancelPending {
      let pending = self.shared.queue.drain();
      info!(pool_name = %*self.shared.pool_name, "Cancelling {} queued tasks.", pending.len());
      for task in pending {
        self.shared.cancel_queued(task);
      }
    }

    let current = thread::current().id();
    let handles_to_join: Vec<JoinHandle<()>> = {
      let mut workers = self.workers.lock();
      if workers.sealed {
        // Another call owns the joins. Wait for it unless this thread is one
        // it is joining.
        if !workers.thread_ids.contains(&current) && !self.shared.notifier.is_current_thread() {
          while !workers.joined {
            self.workers_joined.wait(&mut workers);
          }
        }
        debug!(pool_name = %*self.shared.pool_name, "Shutdown: workers already joined by an earlier call.");
        return;
      }
      workers.sealed = true;
      std::mem::take(&mut workers.handles)
    };

    let mut joined_all = true;
    for handle in handles_to_join {
      if handle.thread().id() == current {
        debug!(pool_name = %*self.shared.pool_name, "Shutdown called from a worker thread; not joining it.");
        joined_all = false;
        continue;
      }
      if handle.join().is_err() {
        error!(pool_name = %*self.shared.pool_name, "Error joining worker thread during shutdown. Worker thread panicked.");
      }
    }

    if joined_all {
      // Only reachable if no worker ever started, e.g. a thread spawn raced shutdown.
      let leftovers = self.shared.queue.drain();
      if !leftovers.is_empty() {
        warn!(pool_name = %*self.shared.pool_name, "Cancelling {} tasks left without a worker.", leftovers.len());
        for task in leftovers {
          self.shared.cancel_queued(task);
        }
      }
      self.shared.notifier.shutdown();
    }

    self.workers.lock().joined = true;
    self.workers_joined.notify_all();

    if !already_initiating_shutdown {
      info!(pool_name = %*self.shared.pool_name, "Pool shutdown process completed by this call.");
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    if !self.shared.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.shared.pool_name,
        "WorkerPool instance dropped. Initiating implicit shutdown (signaling workers to stop, closing queue)."
      );
      // Workers drain what is queued and exit on their own; dropping does not join them.
      self.shared.shutdown_token.cancel();
      self.shared.queue.close();
    } else {
      trace!(pool_name = %*self.shared.pool_name, "Drop: Shutdown already in progress or completed. No new signals sent.");
    }
  }
}
