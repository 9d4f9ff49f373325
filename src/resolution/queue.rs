// Copyright 2024-2026 the Gantry authors. MIT license.

use std::collections::VecDeque;
use std::future::Future;

use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use futures::StreamExt;

/// A work pool that runs at most `limit` tasks concurrently. Tasks can
/// be pushed while the pool is being drained (fan-out from completed
/// work), so draining cannot deadlock: anything queued past the limit
/// starts as running slots free up.
pub struct TaskQueue<'a, T> {
  limit: usize,
  queued: VecDeque<LocalBoxFuture<'a, T>>,
  running: FuturesUnordered<LocalBoxFuture<'a, T>>,
}

impl<'a, T> TaskQueue<'a, T> {
  pub fn new(limit: usize) -> Self {
    Self {
      limit: limit.max(1),
      queued: VecDeque::new(),
      running: FuturesUnordered::new(),
    }
  }

  pub fn push(&mut self, task: impl Future<Output = T> + 'a) {
    self.queued.push_back(task.boxed_local());
  }

  pub fn len(&self) -> usize {
    self.queued.len() + self.running.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Completes the next task, starting queued tasks as capacity
  /// allows. Returns `None` once everything has finished.
  pub async fn next(&mut self) -> Option<T> {
    while self.running.len() < self.limit {
      match self.queued.pop_front() {
        Some(task) => self.running.push(task),
        None => break,
      }
    }
    self.running.next().await
  }
}
