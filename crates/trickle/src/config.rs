//! Scheduler configuration and adaptive-pacing tuning knobs.
//!
//! All durations are milliseconds unless the field name says otherwise.
//! The defaults are the tuned production values; they interact with each
//! other (the pause interval and the active target window together set the
//! duty cycle, roughly 50% while the user is active and 83% when idle), so
//! override with care.

use serde::{Deserialize, Serialize};

/// Scheduler configuration.
///
/// Everything here can be loaded from a host application's config file;
/// unknown fields fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  /// Whether the scheduler starts in the enabled state (default: true).
  /// When false, enqueued jobs accumulate desire but nothing runs until
  /// `set_enabled(true)`.
  pub start_enabled: bool,

  /// Whether an initial sweep should be scheduled the first time the
  /// scheduler becomes enabled (default: true).
  pub perform_initial_sweep: bool,

  /// Delay before the initial sweep runs, so startup is not penalized
  /// (default: 10000)
  pub initial_sweep_delay_ms: u64,

  /// Delay between turning indexing on and the first batch, to coalesce
  /// bursts of enqueues (default: 200)
  pub kickoff_delay_ms: u64,

  /// Pause between batches. Together with the target window this bounds
  /// processor consumption (default: 32)
  pub pause_interval_ms: u64,

  /// Target wall-clock time spent per batch while the user is active
  /// (default: 32)
  pub target_window_active_ms: u64,

  /// Target wall-clock time spent per batch while the user is idle
  /// (default: 160)
  pub target_window_idle_ms: u64,

  /// Idle time below which the user is considered active (default: 5000)
  pub idle_adjustment_ms: u64,

  /// Starting token budget before any measurement exists (default: 2)
  pub initial_token_budget: usize,

  /// Starting estimate for the cost of one token (default: 16.0)
  pub initial_avg_token_ms: f64,

  /// Damping pseudo-window for the running cost average, expressed as an
  /// approximate number of tokens (default: 200.0)
  pub damping_window_tokens: f64,

  /// Hard ceiling on tokens per batch pass (default: 100)
  pub max_tokens_per_batch: usize,

  /// CPU consumed during a pause above which the system is judged busy.
  /// 1.5x the worst-case resolution of the CPU clock (default: 24)
  pub pause_cpu_busy_ms: u64,

  /// Lateness of the return from a pause above which the system is judged
  /// busy (default: 24)
  pub pause_late_busy_ms: u64,

  /// Maximum number of back-to-back pauses while waiting for a free CPU
  /// (default: 10)
  pub pause_repeat_limit: u32,

  /// Minimum delay between storage commits (default: 5000)
  pub min_commit_interval_ms: u64,

  /// Maximum delay between storage commits (default: 20000)
  pub max_commit_interval_ms: u64,

  /// Idle time required before a deferred commit is flushed (default: 3)
  pub idle_commit_threshold_secs: u64,

  /// How often the deferred-commit idle check polls (default: 1000)
  pub idle_commit_poll_ms: u64,

  /// Listener progress updates are emitted every Nth batch pass
  /// (default: 32)
  pub notify_stride: u32,

  /// Ceiling on consecutive recover-hook retries for a single job before
  /// the failure is treated as fatal. The counter resets whenever the job
  /// makes forward progress (default: 8)
  pub max_recovery_attempts: u32,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      start_enabled: true,
      perform_initial_sweep: true,
      initial_sweep_delay_ms: 10_000,
      kickoff_delay_ms: 200,
      pause_interval_ms: 32,
      target_window_active_ms: 32,
      target_window_idle_ms: 160,
      idle_adjustment_ms: 5000,
      initial_token_budget: 2,
      initial_avg_token_ms: 16.0,
      damping_window_tokens: 200.0,
      max_tokens_per_batch: 100,
      pause_cpu_busy_ms: 24,
      pause_late_busy_ms: 24,
      pause_repeat_limit: 10,
      min_commit_interval_ms: 5000,
      max_commit_interval_ms: 20_000,
      idle_commit_threshold_secs: 3,
      idle_commit_poll_ms: 1000,
      notify_stride: 32,
      max_recovery_attempts: 8,
    }
  }
}
