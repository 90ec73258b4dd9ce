//! A thread-backed worker pool with pollable, cancellable task futures,
//! completion-order iteration, ordered mapping, and a counting admission gate
//! for bounding in-flight work.

mod admission_gate;
mod config;
mod dispatcher;
mod error;
mod handle;
mod manager;
mod map;
mod notifier;
mod task;
mod task_queue;
mod wait;

pub use admission_gate::{AdmissionGate, GatePermit, OwnedGatePermit};
pub use config::{default_max_workers, PoolConfig, WorkerInitializer, WorkerPoolBuilder};
pub use dispatcher::Dispatcher;
pub use error::{PoolError, TaskError};
pub use handle::{FutureState, TaskFuture};
pub use manager::{ShutdownMode, WorkerPool};
pub use map::MapResults;
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use task::TaskLabel;
pub use wait::{as_completed, wait_for, wait_for_timeout, AsCompleted, DoneAndNotDone, WaitMode};
