//! Wall-clock + CPU stopwatch for adaptive pacing measurements.
//!
//! Wall time uses `tokio::time::Instant` so paused-clock tests see the
//! virtual clock. CPU time is process-wide via `getrusage(2)`; on platforms
//! without it the CPU reading is zero, which biases the busy-pause detector
//! toward "not busy" rather than failing.
//!
//! `getrusage` is a syscall; the stopwatch is started and stopped once per
//! batch pass / pause, never per token.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Default)]
pub(crate) struct Stopwatch {
  started: Option<(Instant, Duration)>,
  wall: Duration,
  cpu: Duration,
}

impl Stopwatch {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reset and begin a new measurement interval.
  pub fn start(&mut self) {
    self.wall = Duration::ZERO;
    self.cpu = Duration::ZERO;
    self.started = Some((Instant::now(), process_cpu_time()));
  }

  /// End the interval. Without a preceding `start` this is a no-op and the
  /// readings stay zero.
  pub fn stop(&mut self) {
    if let Some((wall_start, cpu_start)) = self.started.take() {
      self.wall = wall_start.elapsed();
      self.cpu = process_cpu_time().saturating_sub(cpu_start);
    }
  }

  /// Wall-clock time of the last completed interval.
  pub fn wall(&self) -> Duration {
    self.wall
  }

  /// Process CPU time (user + system) consumed during the last completed
  /// interval.
  pub fn cpu(&self) -> Duration {
    self.cpu
  }
}

/// Total CPU time consumed by this process so far.
#[cfg(unix)]
fn process_cpu_time() -> Duration {
  let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
  // SAFETY: RUSAGE_SELF with a zeroed out-param is the documented usage.
  let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
  if rc != 0 {
    return Duration::ZERO;
  }
  timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime)
}

#[cfg(not(unix))]
fn process_cpu_time() -> Duration {
  Duration::ZERO
}

#[cfg(unix)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
  let secs = if tv.tv_sec < 0 { 0 } else { tv.tv_sec as u64 };
  // POSIX keeps tv_usec in [0, 999_999]; clamp anything out of range.
  let usec = tv.tv_usec.clamp(0, 999_999) as u64;
  Duration::from_secs(secs) + Duration::from_micros(usec)
}
