//! Control messages for the scheduler actor.
//!
//! Everything that mutates scheduler state arrives through one mailbox:
//! caller requests, timer wake-ups are internal, and asynchronous
//! completions all serialize behind it. That single queue is what makes the
//! cooperative model safe: there is never more than one thing touching the
//! job queue, the frame stack, or the pacing state.

use std::fmt;

use tokio::sync::mpsc;

use crate::job::Job;
use crate::listener::{Listener, ListenerToken};
use crate::registry::IndexerPlugin;
use crate::stack::ResumeValue;

/// Predicate selecting queued jobs for a purge.
pub type JobFilter = Box<dyn Fn(&Job) -> bool + Send>;

/// A message sent to the scheduler actor.
pub(crate) enum Control {
  /// Register an indexer plugin and its worker table.
  RegisterIndexer(Box<dyn IndexerPlugin>),
  /// Append a job to the queue and request processing.
  Enqueue(Job),
  /// Turn event-driven indexing on or off. Idempotent.
  SetEnabled(bool),
  /// Suppress or un-suppress indexing without losing accumulated desire.
  /// Idempotent.
  SetSuppressed(bool),
  /// Add a progress listener; the token is sent back on `reply`.
  AddListener {
    listener: Listener,
    reply: mpsc::Sender<ListenerToken>,
  },
  /// Remove a previously added listener.
  RemoveListener(ListenerToken),
  /// Remove every queued (not hired) job matching the filter.
  PurgeJobs(JobFilter),
  /// Abandon the currently hired job. No-op when nothing is active.
  KillActiveJob,
  /// An asynchronous operation finished; resume the suspended work with
  /// the supplied value.
  Resume(Option<ResumeValue>),
  /// Tear the scheduler down. One-way.
  Shutdown,
}

impl fmt::Debug for Control {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::RegisterIndexer(_) => f.write_str("RegisterIndexer"),
      Self::Enqueue(job) => write!(f, "Enqueue({job})"),
      Self::SetEnabled(on) => write!(f, "SetEnabled({on})"),
      Self::SetSuppressed(on) => write!(f, "SetSuppressed({on})"),
      Self::AddListener { .. } => f.write_str("AddListener"),
      Self::RemoveListener(token) => write!(f, "RemoveListener({token:?})"),
      Self::PurgeJobs(_) => f.write_str("PurgeJobs"),
      Self::KillActiveJob => f.write_str("KillActiveJob"),
      Self::Resume(value) => write!(f, "Resume(has_value: {})", value.is_some()),
      Self::Shutdown => f.write_str("Shutdown"),
    }
  }
}
