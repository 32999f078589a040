//! User idle/activity boundary.
//!
//! The scheduler polls this at the end of every batch pass to decide how
//! aggressive it may be, and while a deferred commit is pending to decide
//! when to flush it. A host without any idle detection simply uses
//! [`AlwaysActive`]; everything degrades to the cautious path.

use std::time::Duration;

/// Reports how long the user has been idle.
pub trait ActivityMonitor: Send {
  /// `None` when no idle information is available, which the scheduler
  /// treats as "the user is active".
  fn idle_duration(&self) -> Option<Duration>;
}

/// Monitor for hosts without idle detection: the user is always considered
/// active.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysActive;

impl ActivityMonitor for AlwaysActive {
  fn idle_duration(&self) -> Option<Duration> {
    None
  }
}
