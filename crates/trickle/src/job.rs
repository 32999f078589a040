//! Indexing jobs and the pending-job queue.
//!
//! A [`Job`] is one queued unit of indexing work: a type tag that selects a
//! registered worker, an opaque target, an append-only list of opaque item
//! payloads, and a progress cursor used for listener reporting. Jobs are
//! enqueued by callers, hired by the scheduler in FIFO order, and retired
//! exactly once, by exhaustion, cancellation, or a fatal worker failure.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;
use tracing::warn;

use crate::stack::ResumeValue;

/// Callback invoked when a job's worker reports completion.
pub type JobCallback = Box<dyn FnOnce(Option<ResumeValue>) + Send>;

/// One queued unit of indexing work.
pub struct Job {
  job_type: String,
  target: Value,
  items: Vec<Value>,
  offset: usize,
  goal: Option<usize>,
  callback: Option<JobCallback>,
}

impl Job {
  /// Create a job for the given worker type and target.
  ///
  /// The type tag must resolve in the worker registry by the time the job
  /// is hired; unresolvable jobs are logged and skipped.
  pub fn new(job_type: impl Into<String>, target: Value) -> Self {
    Self {
      job_type: job_type.into(),
      target,
      items: Vec::new(),
      offset: 0,
      goal: None,
      callback: None,
    }
  }

  /// Attach the initial work list.
  pub fn with_items(mut self, items: Vec<Value>) -> Self {
    self.items = items;
    self
  }

  /// Attach the expected total unit count for progress reporting.
  pub fn with_goal(mut self, goal: usize) -> Self {
    self.goal = Some(goal);
    self
  }

  /// Attach a completion callback. The worker decides when (and with what
  /// value) it fires; failures inside it are logged, never propagated.
  pub fn on_complete(mut self, callback: impl FnOnce(Option<ResumeValue>) + Send + 'static) -> Self {
    self.callback = Some(Box::new(callback));
    self
  }

  pub fn job_type(&self) -> &str {
    &self.job_type
  }

  pub fn target(&self) -> &Value {
    &self.target
  }

  pub fn items(&self) -> &[Value] {
    &self.items
  }

  /// Append an item to the work list. The list only ever grows; items are
  /// consumed by advancing the cursor, never by removal.
  pub fn push_item(&mut self, item: Value) {
    self.items.push(item);
  }

  /// Current cursor into the work list.
  pub fn offset(&self) -> usize {
    self.offset
  }

  /// Advance the progress cursor. The cursor is monotonically
  /// non-decreasing for the lifetime of the job.
  pub fn advance(&mut self, by: usize) {
    self.offset += by;
  }

  pub fn goal(&self) -> Option<usize> {
    self.goal
  }

  /// Raise the goal. A goal may grow while a job accumulates work but must
  /// never shrink; attempts to lower it are ignored.
  pub fn raise_goal(&mut self, goal: usize) {
    match self.goal {
      Some(current) if goal < current => {}
      _ => self.goal = Some(goal),
    }
  }

  /// Invoke the completion callback, if one is attached and has not fired
  /// yet. Panics from the callback are caught and logged.
  pub fn invoke_callback(&mut self, value: Option<ResumeValue>) {
    let Some(callback) = self.callback.take() else {
      return;
    };
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(value))) {
      warn!(job_type = %self.job_type, "job callback invocation problem: {}", crate::panic_message(panic));
    }
  }
}

impl fmt::Display for Job {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "[job:{} target:{} items:{} offset:{} goal:{}]",
      self.job_type,
      self.target,
      self.items.len(),
      self.offset,
      self.goal.map_or_else(|| "?".to_string(), |g| g.to_string()),
    )
  }
}

impl fmt::Debug for Job {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job")
      .field("job_type", &self.job_type)
      .field("items", &self.items.len())
      .field("offset", &self.offset)
      .field("goal", &self.goal)
      .finish()
  }
}

/// FIFO queue of jobs waiting to be hired.
#[derive(Default)]
pub(crate) struct JobQueue {
  jobs: VecDeque<Job>,
}

impl JobQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, job: Job) {
    self.jobs.push_back(job);
  }

  pub fn pop(&mut self) -> Option<Job> {
    self.jobs.pop_front()
  }

  pub fn len(&self) -> usize {
    self.jobs.len()
  }

  /// Remove every queued job matching `filter`, invoking `on_removed` for
  /// each before it is dropped. The currently hired job is not in this
  /// queue and is never touched; kill it separately (and afterwards) if
  /// both are intended.
  pub fn purge(&mut self, filter: impl Fn(&Job) -> bool, mut on_removed: impl FnMut(&mut Job)) {
    let mut kept = VecDeque::with_capacity(self.jobs.len());
    for mut job in self.jobs.drain(..) {
      if filter(&job) {
        on_removed(&mut job);
      } else {
        kept.push_back(job);
      }
    }
    self.jobs = kept;
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use serde_json::json;

  use super::*;

  #[test]
  fn test_goal_never_decreases() {
    let mut job = Job::new("messages", json!(7)).with_goal(10);
    job.raise_goal(5);
    assert_eq!(job.goal(), Some(10));
    job.raise_goal(12);
    assert_eq!(job.goal(), Some(12));
  }

  #[test]
  fn test_callback_fires_at_most_once() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let mut job = Job::new("messages", Value::Null).on_complete(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });

    job.invoke_callback(None);
    job.invoke_callback(None);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_callback_panic_is_contained() {
    let mut job = Job::new("messages", Value::Null).on_complete(|_| panic!("listener bug"));
    // Must not propagate.
    job.invoke_callback(Some(json!(1)));
  }

  #[test]
  fn test_queue_is_fifo() {
    let mut queue = JobQueue::new();
    queue.push(Job::new("a", Value::Null));
    queue.push(Job::new("b", Value::Null));
    queue.push(Job::new("c", Value::Null));

    assert_eq!(queue.pop().unwrap().job_type(), "a");
    assert_eq!(queue.pop().unwrap().job_type(), "b");
    assert_eq!(queue.pop().unwrap().job_type(), "c");
    assert!(queue.pop().is_none());
  }

  #[test]
  fn test_purge_removes_matches_and_reports_them() {
    let mut queue = JobQueue::new();
    queue.push(Job::new("keep", Value::Null));
    queue.push(Job::new("drop", Value::Null));
    queue.push(Job::new("drop", Value::Null));

    let mut canceled = Vec::new();
    queue.purge(
      |job| job.job_type() == "drop",
      |job| canceled.push(job.job_type().to_string()),
    );

    assert_eq!(canceled, vec!["drop", "drop"]);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.pop().unwrap().job_type(), "keep");
  }
}
