//! Storage engine boundary.
//!
//! The scheduler owns exactly one transaction for the duration of a batch;
//! workers never open their own. Commits are asynchronous: the engine is
//! handed a [`CommitCompletion`] and fires it when the commit has landed,
//! which resumes the scheduler. Firing inline from within
//! `commit_transaction` is allowed; the completion is delivered through
//! the scheduler's mailbox either way.

use crate::handle::CompletionHandle;

/// Errors from the storage engine. The batch runner logs these; they never
/// propagate out of the scheduler, and during shutdown they are swallowed
/// entirely.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
  #[error("transaction already open")]
  TransactionOpen,
  #[error("no open transaction")]
  NoTransaction,
  #[error("storage backend: {0}")]
  Backend(String),
}

/// Resumes the scheduler once a commit has landed.
///
/// Dropping it without calling [`finish`](Self::finish) stalls the
/// scheduler until `kill_active_job` or shutdown; the engine must always
/// fire it, on success and failure alike.
pub struct CommitCompletion {
  inner: CompletionHandle,
}

impl CommitCompletion {
  pub(crate) fn new(inner: CompletionHandle) -> Self {
    Self { inner }
  }

  /// Signal that the commit has landed.
  pub fn finish(self) {
    self.inner.resume(None);
  }
}

impl std::fmt::Debug for CommitCompletion {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("CommitCompletion")
  }
}

/// The persistent store the scheduler commits into.
pub trait IndexStore: Send {
  /// Open a transaction covering the work of the next batch stretch.
  fn begin_transaction(&mut self) -> Result<(), StoreError>;

  /// Commit the open transaction. When `on_done` is supplied the engine
  /// must fire it after the commit lands; `None` means the caller is not
  /// waiting (idle-time flush).
  fn commit_transaction(&mut self, on_done: Option<CommitCompletion>) -> Result<(), StoreError>;

  /// Final teardown at scheduler shutdown. Best-effort.
  fn shutdown(&mut self) -> Result<(), StoreError>;
}
