use crate::error::PoolError;
use crate::handle::TaskFuture;
use crate::manager::WorkerPool;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::iter::Fuse;
use std::sync::Arc;

use tracing::debug;

type Submitter<'p, A, T> = Box<dyn FnMut(A) -> Result<TaskFuture<T>, PoolError> + 'p>;

/// Results of [`WorkerPool::map`], yielded strictly in input order.
///
/// Inputs are submitted lazily, keeping at most `buffer` tasks in flight ahead
/// of the consumer. Dropping the iterator cancels any of those tasks that have
/// not started.
pub struct MapResults<'p, I, T>
where
  I: Iterator,
  T: Send + 'static,
{
  submit: Submitter<'p, I::Item, T>,
  inputs: Fuse<I>,
  in_flight: VecDeque<TaskFuture<T>>,
  buffer: usize,
  submit_error: Option<PoolError>,
  finished: bool,
}

impl<'p, I, T> MapResults<'p, I, T>
where
  I: Iterator,
  T: Send + 'static,
{
  fn new(submit: Submitter<'p, I::Item, T>, inputs: I, buffer: usize) -> Self {
    Self {
      submit,
      inputs: inputs.fuse(),
      in_flight: VecDeque::with_capacity(buffer),
      buffer,
      submit_error: None,
      finished: false,
    }
  }

  fn fill(&mut self) {
    while self.submit_error.is_none() && self.in_flight.len() < self.buffer {
      let Some(input) = self.inputs.next() else {
        break;
      };
      match (self.submit)(input) {
        Ok(future) => self.in_flight.push_back(future),
        Err(e) => {
          debug!(error = %e, "map: submission failed, no further inputs will be submitted.");
          self.submit_error = Some(e);
        }
      }
    }
  }

  /// Number of submitted tasks whose results have not been yielded yet.
  pub fn in_flight(&self) -> usize {
    self.in_flight.len()
  }
}

impl<'p, I, T> Iterator for MapResults<'p, I, T>
where
  I: Iterator,
  T: Send + 'static,
{
  type Item = Result<T, PoolError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }
    self.fill();
    if let Some(head) = self.in_flight.pop_front() {
      return Some(head.into_result(None));
    }
    self.finished = true;
    self.submit_error.take().map(Err)
  }
}

impl<'p, I, T> Drop for MapResults<'p, I, T>
where
  I: Iterator,
  T: Send + 'static,
{
  fn drop(&mut self) {
    let mut cancelled = 0usize;
    for future in self.in_flight.drain(..) {
      if future.cancel() {
        cancelled += 1;
      }
    }
    if cancelled > 0 {
      debug!(cancelled, "map: results dropped early, cancelled pending tasks.");
    }
  }
}

impl<'p, I, T> fmt::Debug for MapResults<'p, I, T>
where
  I: Iterator,
  T: Send + 'static,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MapResults")
      .field("in_flight", &self.in_flight.len())
      .field("buffer", &self.buffer)
      .field("finished", &self.finished)
      .finish_non_exhaustive()
  }
}

impl WorkerPool {
  /// Applies `f` to every input on the pool and yields the results in input
  /// order, keeping up to `max_workers` tasks in flight.
  pub fn map<A, T, F, I>(&self, f: F, inputs: I) -> MapResults<'_, I::IntoIter, T>
  where
    I: IntoIterator<Item = A>,
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A) -> T + Send + Sync + 'static,
  {
    self.map_with_buffer(f, inputs, self.max_workers())
  }

  /// Like [`WorkerPool::map`] with an explicit look-ahead of `buffer` tasks.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidArgument` when `buffer` is 0.
  pub fn map_buffered<A, T, F, I>(&self, f: F, inputs: I, buffer: usize) -> Result<MapResults<'_, I::IntoIter, T>, PoolError>
  where
    I: IntoIterator<Item = A>,
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A) -> T + Send + Sync + 'static,
  {
    if buffer == 0 {
      return Err(PoolError::InvalidArgument("map buffer must be greater than 0".to_string()));
    }
    Ok(self.map_with_buffer(f, inputs, buffer))
  }

  fn map_with_buffer<A, T, F, I>(&self, f: F, inputs: I, buffer: usize) -> MapResults<'_, I::IntoIter, T>
  where
    I: IntoIterator<Item = A>,
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A) -> T + Send + Sync + 'static,
  {
    let f = Arc::new(f);
    let submit = move |input: A| {
      let f = f.clone();
      self.submit(move || f(input))
    };
    MapResults::new(Box::new(submit), inputs.into_iter(), buffer)
  }

  /// Ordered map over fallible work; an `Err` from `f` surfaces as
  /// `PoolError::TaskFailed` for that input only.
  pub fn try_map<A, T, E, F, I>(&self, f: F, inputs: I) -> MapResults<'_, I::IntoIter, T>
  where
    I: IntoIterator<Item = A>,
    A: Send + 'static,
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
    F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
  {
    let f = Arc::new(f);
    let submit = move |input: A| {
      let f = f.clone();
      self.try_submit(move || f(input))
    };
    MapResults::new(Box::new(submit), inputs.into_iter(), self.max_workers())
  }
}
