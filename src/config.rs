use crate::error::PoolError;
use crate::manager::WorkerPool;

use std::fmt;
use std::sync::Arc;
use std::thread;

/// Hook run once at the start of every worker thread.
pub type WorkerInitializer = Arc<dyn Fn() + Send + Sync + 'static>;

const DEFAULT_POOL_NAME: &str = "worker_pool";

/// Default worker count: one per available core plus four, capped at 32, so
/// pools used for blocking I/O get some headroom without flooding the system.
pub fn default_max_workers() -> usize {
  let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
  (cores + 4).min(32)
}

/// Validated, immutable settings of a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolConfig {
  pub(crate) name: String,
  pub(crate) max_workers: usize,
  pub(crate) thread_name_prefix: String,
  pub(crate) stack_size: Option<usize>,
  pub(crate) initializer: Option<WorkerInitializer>,
}

impl PoolConfig {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn max_workers(&self) -> usize {
    self.max_workers
  }

  pub fn thread_name_prefix(&self) -> &str {
    &self.thread_name_prefix
  }

  pub fn stack_size(&self) -> Option<usize> {
    self.stack_size
  }

  pub fn has_initializer(&self) -> bool {
    self.initializer.is_some()
  }
}

impl fmt::Debug for PoolConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolConfig")
      .field("name", &self.name)
      .field("max_workers", &self.max_workers)
      .field("thread_name_prefix", &self.thread_name_prefix)
      .field("stack_size", &self.stack_size)
      .field("has_initializer", &self.initializer.is_some())
      .finish()
  }
}

/// Builder for [`WorkerPool`]. Obtain one with [`WorkerPool::builder`].
#[derive(Default)]
pub struct WorkerPoolBuilder {
  max_workers: Option<usize>,
  name: Option<String>,
  thread_name_prefix: Option<String>,
  stack_size: Option<usize>,
  initializer: Option<WorkerInitializer>,
}

impl WorkerPoolBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Upper bound on worker threads, and therefore on concurrently running tasks.
  pub fn max_workers(mut self, max_workers: usize) -> Self {
    self.max_workers = Some(max_workers);
    self
  }

  pub fn name(mut self, name: &str) -> Self {
    self.name = Some(name.to_string());
    self
  }

  /// Worker threads are named `{prefix}_{index}`. Defaults to the pool name.
  pub fn thread_name_prefix(mut self, prefix: &str) -> Self {
    self.thread_name_prefix = Some(prefix.to_string());
    self
  }

  pub fn stack_size(mut self, bytes: usize) -> Self {
    self.stack_size = Some(bytes);
    self
  }

  /// Runs `init` at the start of each worker thread. If it panics the pool is
  /// marked broken and stops accepting work.
  pub fn initializer(mut self, init: impl Fn() + Send + Sync + 'static) -> Self {
    self.initializer = Some(Arc::new(init));
    self
  }

  /// Validates the settings without starting anything.
  pub fn into_config(self) -> Result<PoolConfig, PoolError> {
    let max_workers = self.max_workers.unwrap_or_else(default_max_workers);
    if max_workers == 0 {
      return Err(PoolError::InvalidArgument("max_workers must be greater than 0".to_string()));
    }
    if self.stack_size == Some(0) {
      return Err(PoolError::InvalidArgument("stack_size must be greater than 0".to_string()));
    }
    let name = self.name.unwrap_or_else(|| DEFAULT_POOL_NAME.to_string());
    let thread_name_prefix = self.thread_name_prefix.unwrap_or_else(|| name.clone());
    Ok(PoolConfig {
      name,
      max_workers,
      thread_name_prefix,
      stack_size: self.stack_size,
      initializer: self.initializer,
    })
  }

  pub fn build(self) -> Result<Arc<WorkerPool>, PoolError> {
    Ok(WorkerPool::from_config(self.into_config()?))
  }
}
