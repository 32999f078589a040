//! Handles for communicating with the scheduler actor.
//!
//! [`SchedulerHandle`] is the caller-facing surface: cheap to clone, safe
//! to share across tasks. [`CompletionHandle`] is the narrow resume-only
//! handle that suspended workers and the storage engine use to hand an
//! asynchronous result back to the scheduler.

use tokio::sync::mpsc;
use tracing::warn;

use crate::job::Job;
use crate::listener::{ListenerToken, StatusUpdate};
use crate::message::{Control, JobFilter};
use crate::registry::IndexerPlugin;
use crate::stack::ResumeValue;

/// Error when sending to the scheduler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
  #[error("scheduler has shut down")]
  SchedulerGone,
}

/// Handle to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
  tx: mpsc::Sender<Control>,
}

impl SchedulerHandle {
  pub(crate) fn new(tx: mpsc::Sender<Control>) -> Self {
    Self { tx }
  }

  async fn send(&self, control: Control) -> Result<(), SendError> {
    self.tx.send(control).await.map_err(|_| SendError::SchedulerGone)
  }

  /// Register an indexer plugin. If indexing is already enabled the
  /// plugin's `enable` hook runs immediately.
  pub async fn register_indexer(&self, plugin: impl IndexerPlugin + 'static) -> Result<(), SendError> {
    self.send(Control::RegisterIndexer(Box::new(plugin))).await
  }

  /// Queue a job for indexing. Processing starts a short, fixed delay
  /// later so bursts of enqueues coalesce into one cycle.
  pub async fn enqueue(&self, job: Job) -> Result<(), SendError> {
    self.send(Control::Enqueue(job)).await
  }

  /// Turn event-driven indexing on or off. Idempotent.
  pub async fn set_enabled(&self, enabled: bool) -> Result<(), SendError> {
    self.send(Control::SetEnabled(enabled)).await
  }

  /// Suppress or resume indexing (e.g. while on battery). Queued work and
  /// accumulated desire survive suppression. Idempotent.
  pub async fn set_suppressed(&self, suppressed: bool) -> Result<(), SendError> {
    self.send(Control::SetSuppressed(suppressed)).await
  }

  /// Add a progress listener. If nothing is being indexed the listener
  /// immediately receives a synthetic idle update.
  pub async fn add_listener(
    &self,
    listener: impl FnMut(&StatusUpdate) + Send + 'static,
  ) -> Result<ListenerToken, SendError> {
    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    self
      .send(Control::AddListener {
        listener: Box::new(listener),
        reply: reply_tx,
      })
      .await?;
    reply_rx.recv().await.ok_or(SendError::SchedulerGone)
  }

  /// Remove a previously added listener.
  pub async fn remove_listener(&self, token: ListenerToken) -> Result<(), SendError> {
    self.send(Control::RemoveListener(token)).await
  }

  /// Remove every queued job matching the filter, invoking each job's
  /// `job_canceled` hook. The currently hired job is not touched; to also
  /// stop it, purge first and then call [`kill_active_job`](Self::kill_active_job).
  pub async fn purge_jobs(&self, filter: impl Fn(&Job) -> bool + Send + 'static) -> Result<(), SendError> {
    self.send(Control::PurgeJobs(Box::new(filter) as JobFilter)).await
  }

  /// Abandon the currently hired job, unwinding its frames and running its
  /// `cleanup` hook. Idempotent when nothing is active.
  ///
  /// Must never be called from inside one of the job's own frames; frames
  /// that want to abort should return an error instead.
  pub async fn kill_active_job(&self) -> Result<(), SendError> {
    self.send(Control::KillActiveJob).await
  }

  /// Shut the scheduler down. One-way; there is no restart within a
  /// process lifetime.
  pub async fn shutdown(&self) -> Result<(), SendError> {
    self.send(Control::Shutdown).await
  }
}

impl std::fmt::Debug for SchedulerHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("SchedulerHandle")
  }
}

/// Resume-only handle given to suspended asynchronous operations.
///
/// A frame that returns [`StepOutcome::Suspend`](crate::StepOutcome::Suspend)
/// must first clone one of these into whatever will eventually produce the
/// result; firing it delivers the value as the frame's next resume input.
#[derive(Clone)]
pub struct CompletionHandle {
  tx: mpsc::Sender<Control>,
}

impl CompletionHandle {
  pub(crate) fn new(tx: mpsc::Sender<Control>) -> Self {
    Self { tx }
  }

  /// Resume the scheduler with an optional value. Usable from sync and
  /// async contexts alike; if the scheduler is gone the resume is dropped
  /// with a warning.
  pub fn resume(&self, value: Option<ResumeValue>) {
    if self.tx.try_send(Control::Resume(value)).is_err() {
      warn!("async completion dropped; scheduler mailbox unavailable");
    }
  }
}

impl std::fmt::Debug for CompletionHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("CompletionHandle")
  }
}
