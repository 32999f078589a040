//! Progress listeners.
//!
//! Listeners observe coarse state transitions (idle ↔ indexing) and
//! decimated progress updates while a job runs. They receive read-only
//! snapshots and must not reach back into the scheduler; a listener that
//! panics is logged and the remaining listeners still run.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::error;

use crate::job::Job;
use crate::registry::WorkerRegistry;
use crate::scheduler::WorkState;

/// Coarse scheduler state as seen by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerStatus {
  Idle,
  Indexing,
}

/// Snapshot delivered to every listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
  pub status: IndexerStatus,
  /// Human-readable label of the current target, when the worker supplies
  /// one.
  pub label: Option<String>,
  /// Zero-based sequence number of the current job within this indexing
  /// cycle.
  pub job_index: usize,
  /// Progress cursor of the current job.
  pub offset: usize,
  /// Goal of the current job, clamped so it never reads below the offset.
  pub goal: usize,
  pub job_type: Option<String>,
}

impl StatusUpdate {
  pub(crate) fn idle() -> Self {
    Self {
      status: IndexerStatus::Idle,
      label: None,
      job_index: 0,
      offset: 0,
      goal: 1,
      job_type: None,
    }
  }

  fn indexing(job: &Job, label: Option<String>, job_index: usize) -> Self {
    let offset = job.offset();
    // Progress must never read past 100%.
    let goal = job.goal().unwrap_or(offset).max(offset);
    Self {
      status: IndexerStatus::Indexing,
      label,
      job_index,
      offset,
      goal,
      job_type: Some(job.job_type().to_string()),
    }
  }
}

/// Token returned by `add_listener`, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(pub(crate) u64);

/// A registered progress listener.
pub type Listener = Box<dyn FnMut(&StatusUpdate) + Send>;

/// The set of registered listeners.
#[derive(Default)]
pub(crate) struct ListenerBus {
  entries: Vec<(ListenerToken, Listener)>,
  next_token: u64,
}

impl ListenerBus {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, listener: Listener) -> ListenerToken {
    let token = ListenerToken(self.next_token);
    self.next_token += 1;
    self.entries.push((token, listener));
    token
  }

  pub fn remove(&mut self, token: ListenerToken) {
    self.entries.retain(|(t, _)| *t != token);
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  /// Deliver an update to every listener. A panicking listener is logged
  /// and does not affect the others.
  pub fn emit(&mut self, update: &StatusUpdate) {
    for (token, listener) in &mut self.entries {
      if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(update))) {
        error!(token = token.0, "listener panicked: {}", crate::panic_message(panic));
      }
    }
  }

  /// Deliver an update to a single listener (the synthetic idle
  /// notification a listener receives when added while nothing is
  /// running).
  pub fn emit_to(&mut self, token: ListenerToken, update: &StatusUpdate) {
    if let Some((_, listener)) = self.entries.iter_mut().find(|(t, _)| *t == token)
      && let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(update)))
    {
      error!(token = token.0, "listener panicked: {}", crate::panic_message(panic));
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }
}

impl fmt::Debug for ListenerBus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ListenerBus").field("listeners", &self.entries.len()).finish()
  }
}

/// Compute the snapshot listeners should see right now.
pub(crate) fn current_status(work: &WorkState, registry: &WorkerRegistry, indexing: bool) -> StatusUpdate {
  if !indexing {
    return StatusUpdate::idle();
  }
  let Some(active) = work.active.as_ref() else {
    return StatusUpdate::idle();
  };
  let label = registry
    .get(active.job.job_type())
    .and_then(|def| def.describe.as_ref())
    .and_then(|describe| describe(&active.job));
  StatusUpdate::indexing(&active.job, label, work.job_count.saturating_sub(1))
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  fn counting_listener(counter: Arc<AtomicUsize>) -> Listener {
    Box::new(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn test_emit_reaches_all_listeners() {
    let mut bus = ListenerBus::new();
    let a = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(AtomicUsize::new(0));
    bus.add(counting_listener(a.clone()));
    bus.add(counting_listener(b.clone()));

    bus.emit(&StatusUpdate::idle());
    assert_eq!(a.load(Ordering::SeqCst), 1);
    assert_eq!(b.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_removed_listener_stops_receiving() {
    let mut bus = ListenerBus::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let token = bus.add(counting_listener(calls.clone()));

    bus.emit(&StatusUpdate::idle());
    bus.remove(token);
    bus.emit(&StatusUpdate::idle());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bus.len(), 0);
  }

  #[test]
  fn test_panicking_listener_does_not_starve_others() {
    let mut bus = ListenerBus::new();
    let survivor = Arc::new(AtomicUsize::new(0));
    bus.add(Box::new(|_| panic!("broken listener")));
    bus.add(counting_listener(survivor.clone()));

    bus.emit(&StatusUpdate::idle());
    assert_eq!(survivor.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_emit_to_targets_one_listener() {
    let mut bus = ListenerBus::new();
    let a = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(AtomicUsize::new(0));
    let token_a = bus.add(counting_listener(a.clone()));
    bus.add(counting_listener(b.clone()));

    bus.emit_to(token_a, &StatusUpdate::idle());
    assert_eq!(a.load(Ordering::SeqCst), 1);
    assert_eq!(b.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_goal_clamps_to_offset() {
    let mut job = Job::new("messages", serde_json::Value::Null).with_goal(2);
    job.advance(5);
    let update = StatusUpdate::indexing(&job, None, 0);
    assert_eq!(update.offset, 5);
    assert_eq!(update.goal, 5);
  }
}
