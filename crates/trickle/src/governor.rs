//! Adaptive pacing: token budgets and busy-system detection.
//!
//! The governor never measures load directly. It estimates the wall-clock
//! cost of one token from recent batch passes and sizes the next pass to
//! fit a target active window; the window widens when the user is idle and
//! narrows when they are active. Separately, it judges whether a pause
//! "went badly" (came back late or burned CPU), which means something else
//! wanted the machine, and the batch runner responds by pausing again.
//!
//! The damped average responds slowly by design. Using the *larger* of the
//! instantaneous and averaged cost when sizing the budget makes the budget
//! collapse quickly on a sudden slowdown without oscillating on noise.

use std::time::Duration;

use tracing::trace;

use crate::config::SchedulerConfig;

pub(crate) struct PerformanceGovernor {
  config: SchedulerConfig,
  token_budget: usize,
  avg_time_per_token_ms: f64,
  target_window_ms: f64,
  in_idle: bool,
}

impl PerformanceGovernor {
  pub fn new(config: SchedulerConfig) -> Self {
    let token_budget = config.initial_token_budget.max(1);
    let avg_time_per_token_ms = config.initial_avg_token_ms;
    let target_window_ms = config.target_window_active_ms as f64;
    Self {
      config,
      token_budget,
      avg_time_per_token_ms,
      target_window_ms,
      in_idle: false,
    }
  }

  pub fn config(&self) -> &SchedulerConfig {
    &self.config
  }

  /// Tokens the next batch pass may consume.
  pub fn token_budget(&self) -> usize {
    self.token_budget
  }

  /// Whether the last activity sample judged the user idle.
  pub fn in_idle(&self) -> bool {
    self.in_idle
  }

  /// Feed the latest idle reading and pick the matching target window.
  /// `None` means no idle provider is available, which degrades to
  /// "always active".
  pub fn sample_activity(&mut self, idle: Option<Duration>) -> bool {
    let threshold = Duration::from_millis(self.config.idle_adjustment_ms);
    self.in_idle = idle.is_some_and(|d| d >= threshold);
    self.target_window_ms = if self.in_idle {
      self.config.target_window_idle_ms as f64
    } else {
      self.config.target_window_active_ms as f64
    };
    self.in_idle
  }

  /// Recalculate the token budget from a completed pass that consumed
  /// `tokens` tokens in `elapsed` of wall time. Callers must not feed
  /// zero-token passes.
  pub fn recalibrate(&mut self, tokens: usize, elapsed: Duration) {
    debug_assert!(tokens > 0);
    let total_ms = elapsed.as_secs_f64() * 1000.0;
    let time_per_token = total_ms / tokens as f64;

    // Damp the average; a single pass is a rough estimate only.
    let damping = self.config.damping_window_tokens;
    self.avg_time_per_token_ms = (total_ms + damping * self.avg_time_per_token_ms) / (tokens as f64 + damping);

    // The larger of recent and averaged cost, so a sudden slowdown shrinks
    // the budget immediately.
    let best_time_per_token = time_per_token.max(self.avg_time_per_token_ms);

    let budget = (self.target_window_ms / best_time_per_token)
      .max(1.0)
      .min(self.config.max_tokens_per_batch as f64)
      .ceil();
    self.token_budget = budget as usize;

    trace!(
      tokens,
      elapsed_ms = total_ms,
      avg_ms = self.avg_time_per_token_ms,
      budget = self.token_budget,
      "token budget recalibrated"
    );
  }

  /// Judge a completed pause interval. A pause that consumed real CPU or
  /// returned noticeably later than requested means something else is
  /// keeping the machine busy.
  pub fn pause_was_busy(&self, pause_wall: Duration, pause_cpu: Duration) -> bool {
    let cpu_ms = pause_cpu.as_secs_f64() * 1000.0;
    let late_ms = pause_wall.as_secs_f64() * 1000.0 - self.config.pause_interval_ms as f64;
    cpu_ms >= self.config.pause_cpu_busy_ms as f64 || late_ms >= self.config.pause_late_busy_ms as f64
  }
}
