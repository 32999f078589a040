//! The token-budgeted batch execution loop.
//!
//! A batch is one stretch of indexing between idle states. The runner is a
//! hand-rolled resumable state machine: each [`BatchRunner::resume`] call
//! executes until the batch needs something it cannot get synchronously
//! (a pause on the timer, an asynchronous completion, or nothing at all)
//! and records where it parked so the next resume continues from there.
//!
//! One resume handles at most one pass:
//!
//! 1. drive the frame stack until the token budget is spent, hiring queued
//!    jobs as the stack empties;
//! 2. sample user activity and adjust the target window;
//! 3. if work remains, pause, and keep pausing (bounded) while the pause
//!    itself comes back late or CPU-hungry, which means something else
//!    wants the machine;
//! 4. recalibrate the token budget from the measured cost of this pass;
//! 5. commit if the cadence calls for it, suspending until the commit
//!    lands.
//!
//! Worker failures are contained here: the job's `recover` hook may request
//! a partial retry at a reduced stack depth, otherwise the job is cleaned
//! up and abandoned, and the loop moves to the next queued job. Nothing a
//! worker does propagates past this module.

use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::activity::ActivityMonitor;
use crate::governor::PerformanceGovernor;
use crate::handle::CompletionHandle;
use crate::job::JobQueue;
use crate::listener::{ListenerBus, current_status};
use crate::registry::WorkerRegistry;
use crate::scheduler::{ActiveJob, CommitState, WorkState};
use crate::stack::{StepCx, StepOutcome, WorkerError};
use crate::stopwatch::Stopwatch;
use crate::store::{CommitCompletion, IndexStore};

/// What a batch hands back to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchStep {
  /// Take a breather; resume after the pause interval.
  Pause,
  /// Some asynchronous operation now owns the next resume.
  Suspend,
  /// The queue is exhausted; discard this batch.
  Done,
}

/// Where a suspended batch is parked.
enum Parked {
  /// Not started yet; the first resume opens the transaction.
  Entry,
  /// Suspended inside the token loop, waiting for a worker's async
  /// completion.
  Inner,
  /// Waiting out a pause; `repeats` pauses have already been taken this
  /// round.
  Pause { repeats: u32 },
  /// Waiting for a commit to land.
  Commit,
}

enum InnerExit {
  /// Budget spent, or the queue ran dry (see `have_more_work`).
  Exhausted,
  /// A frame suspended on an external completion.
  Async,
}

enum SettleOutcome {
  /// The batch parked (commit in flight); hand the step up.
  Step(BatchStep),
  /// Nothing to wait for; the caller decides what comes next.
  Continue,
}

/// Everything a batch pass needs, borrowed from the scheduler for the
/// duration of one resume.
pub(crate) struct BatchCx<'a> {
  pub work: &'a mut WorkState,
  pub queue: &'a mut JobQueue,
  pub registry: &'a WorkerRegistry,
  pub store: &'a mut dyn IndexStore,
  pub governor: &'a mut PerformanceGovernor,
  pub listeners: &'a mut ListenerBus,
  pub activity: &'a dyn ActivityMonitor,
  pub completions: &'a CompletionHandle,
  pub commit: &'a mut CommitState,
  pub suppressed: bool,
}

impl BatchCx<'_> {
  fn indexing(&self) -> bool {
    self.work.desired && !self.suppressed
  }

  fn notify_listeners(&mut self) {
    let update = current_status(self.work, self.registry, self.indexing());
    self.listeners.emit(&update);
  }
}

pub(crate) struct BatchRunner {
  parked: Parked,
  pass_watch: Stopwatch,
  pause_watch: Stopwatch,
  /// Tokens consumed by the current pass.
  tokens: usize,
  have_more_work: bool,
  transaction_open: bool,
  notify_decimator: u32,
}

impl BatchRunner {
  pub fn new() -> Self {
    Self {
      parked: Parked::Entry,
      pass_watch: Stopwatch::new(),
      pause_watch: Stopwatch::new(),
      tokens: 0,
      have_more_work: true,
      transaction_open: false,
      notify_decimator: 0,
    }
  }

  /// Whether the batch is parked on a worker's async completion. Used by
  /// `kill_active_job` to know the pending completion may never fire.
  pub fn awaiting_async(&self) -> bool {
    matches!(self.parked, Parked::Inner)
  }

  /// Run until the next suspension point. `input` is the value delivered
  /// by whatever completion woke us, if any.
  pub fn resume(&mut self, input: Option<Value>, cx: &mut BatchCx<'_>) -> BatchStep {
    match std::mem::replace(&mut self.parked, Parked::Entry) {
      Parked::Entry => {
        if cx.commit.idle_to_commit {
          // Adopt the transaction the previous batch left dangling.
          cx.commit.idle_to_commit = false;
          self.transaction_open = true;
        } else {
          self.begin_txn(cx);
        }
        self.begin_pass();
        self.run_pass(cx)
      }
      Parked::Inner => {
        cx.work.pending = input;
        self.run_pass(cx)
      }
      Parked::Pause { repeats } => {
        self.pause_watch.stop();
        let busy = cx.governor.pause_was_busy(self.pause_watch.wall(), self.pause_watch.cpu());
        if busy && repeats + 1 < cx.governor.config().pause_repeat_limit {
          trace!(repeats, "system busy during pause; backing off again");
          self.pause_watch.start();
          self.parked = Parked::Pause { repeats: repeats + 1 };
          return BatchStep::Pause;
        }
        match self.settle_pass(cx) {
          SettleOutcome::Step(step) => step,
          SettleOutcome::Continue => {
            if self.have_more_work {
              self.begin_pass();
              self.run_pass(cx)
            } else {
              self.finish(cx)
            }
          }
        }
      }
      Parked::Commit => {
        cx.commit.last_commit = Instant::now();
        if self.have_more_work {
          self.begin_txn(cx);
          self.begin_pass();
          self.run_pass(cx)
        } else {
          self.transaction_open = false;
          self.finish(cx)
        }
      }
    }
  }

  fn begin_txn(&mut self, cx: &mut BatchCx<'_>) {
    match cx.store.begin_transaction() {
      Ok(()) => self.transaction_open = true,
      Err(error) => {
        warn!(error = %error, "failed to open indexing transaction");
        self.transaction_open = false;
      }
    }
  }

  fn begin_pass(&mut self) {
    self.tokens = 0;
    self.pass_watch.start();
  }

  /// Drive the token loop to its end, then decide between pausing,
  /// settling, and finishing. Also the continuation point when an async
  /// completion resumes the token loop mid-pass.
  fn run_pass(&mut self, cx: &mut BatchCx<'_>) -> BatchStep {
    match self.inner_loop(cx) {
      InnerExit::Async => {
        self.parked = Parked::Inner;
        return BatchStep::Suspend;
      }
      InnerExit::Exhausted => {}
    }
    self.pass_watch.stop();

    cx.governor.sample_activity(cx.activity.idle_duration());

    if self.have_more_work {
      self.notify_decimator = (self.notify_decimator + 1) % cx.governor.config().notify_stride.max(1);
      if self.notify_decimator == 0 {
        cx.notify_listeners();
      }
      self.pause_watch.start();
      self.parked = Parked::Pause { repeats: 0 };
      return BatchStep::Pause;
    }

    // The queue ran dry this pass: no pause, settle and wrap up.
    match self.settle_pass(cx) {
      SettleOutcome::Step(step) => step,
      SettleOutcome::Continue => self.finish(cx),
    }
  }

  /// The token loop. Every resume of the active frame consumes one token,
  /// regardless of its outcome.
  fn inner_loop(&mut self, cx: &mut BatchCx<'_>) -> InnerExit {
    while self.tokens < cx.governor.token_budget() {
      if cx.work.stack.is_empty() && !self.hire_next(cx) {
        self.have_more_work = false;
        return InnerExit::Exhausted;
      }
      self.tokens += 1;

      match step_active_frame(cx) {
        Ok(StepOutcome::Continue) => {
          cx.work.pending = None;
          cx.work.note_progress();
        }
        Ok(StepOutcome::Push(frame, context)) => {
          cx.work.stack.push(frame, context);
          cx.work.pending = None;
          cx.work.note_progress();
        }
        Ok(StepOutcome::Suspend) => return InnerExit::Async,
        Ok(StepOutcome::Done) => {
          cx.work.stack.pop();
          cx.work.pending = None;
          cx.work.note_progress();
        }
        Ok(StepOutcome::DoneWithValue(value)) => {
          cx.work.stack.pop();
          cx.work.pending = Some(value);
          cx.work.note_progress();
        }
        Err(error) => self.handle_worker_error(cx, error),
      }
    }
    InnerExit::Exhausted
  }

  /// Dequeue and instantiate the next job's worker. Returns false when the
  /// queue is empty, which ends the indexing cycle.
  fn hire_next(&mut self, cx: &mut BatchCx<'_>) -> bool {
    // Nothing may leak from a previous job into the next one.
    cx.work.pending = None;

    loop {
      let Some(mut job) = cx.queue.pop() else {
        info!("indexing queue drained; going idle");
        cx.work.active = None;
        cx.work.desired = false;
        cx.work.job_count = 0;
        return false;
      };

      let Some(def) = cx.registry.get(job.job_type()) else {
        error!(job_type = %job.job_type(), "unknown job type; skipping job");
        continue;
      };

      cx.work.job_count += 1;

      // Jobs that accumulate items while queued get one last chance to
      // finalize before their worker sees them.
      if let Some(on_schedule) = def.on_schedule.as_ref()
        && let Err(panic) = catch_unwind(AssertUnwindSafe(|| on_schedule(&mut job)))
      {
        error!(job = %job, "on_schedule hook panicked: {}", crate::panic_message(panic));
      }

      let frame = match catch_unwind(AssertUnwindSafe(|| (def.entry)(&mut job))) {
        Ok(frame) => frame,
        Err(panic) => {
          error!(job = %job, "worker entry factory panicked; skipping job: {}", crate::panic_message(panic));
          continue;
        }
      };

      debug!(job = %job, "hired job");
      cx.work.stack.push(frame, Value::Null);
      cx.work.active = Some(ActiveJob { job, recoveries: 0 });
      cx.notify_listeners();
      return true;
    }
  }

  /// Contain a worker failure: offer it to the `recover` hook, otherwise
  /// clean up and abandon the job. Token bookkeeping is untouched either
  /// way.
  fn handle_worker_error(&mut self, cx: &mut BatchCx<'_>, error: WorkerError) {
    debug!(error = %error, "exception during batch processing");
    let max_recoveries = cx.governor.config().max_recovery_attempts;

    let WorkState { stack, active, pending, .. } = &mut *cx.work;
    let Some(active_job) = active.as_mut() else {
      // A frame without a job has nothing to recover into.
      stack.unwind(0);
      *pending = None;
      return;
    };
    let def = cx.registry.get(active_job.job.job_type());

    if let Some(recover) = def.and_then(|d| d.recover.as_ref()) {
      let depth = match catch_unwind(AssertUnwindSafe(|| recover(&mut active_job.job, stack.contexts(), &error))) {
        Ok(depth) => depth,
        Err(panic) => {
          error!(job = %active_job.job, "worker recovery hook itself failed: {}", crate::panic_message(panic));
          None
        }
      };
      if let Some(depth) = depth {
        active_job.recoveries += 1;
        if active_job.recoveries <= max_recoveries {
          debug!(job = %active_job.job, depth, "retrying job at reduced stack depth");
          stack.unwind(depth);
          return;
        }
        warn!(
          job = %active_job.job,
          attempts = active_job.recoveries,
          "recovery retry ceiling reached; treating failure as fatal"
        );
      }
    }

    // No recovery, or it declined: clean up and drop the whole job.
    if let Some(cleanup) = def.and_then(|d| d.cleanup.as_ref())
      && let Err(panic) = catch_unwind(AssertUnwindSafe(|| cleanup(&mut active_job.job)))
    {
      error!(job = %active_job.job, "worker cleanup hook itself failed: {}", crate::panic_message(panic));
    }

    stack.unwind(0);
    warn!(job = %active_job.job, error = %error, "abandoning job after worker failure");
    *active = None;
    *pending = None;
  }

  /// Post-pause bookkeeping: recalibrate the token budget and decide
  /// whether the commit cadence is due.
  fn settle_pass(&mut self, cx: &mut BatchCx<'_>) -> SettleOutcome {
    if self.tokens > 0 {
      cx.governor.recalibrate(self.tokens, self.pass_watch.wall());
    }

    let elapsed = cx.commit.last_commit.elapsed().as_millis() as u64;
    let config = cx.governor.config();
    // Committing pauses the host briefly, so delay it while the user is
    // active, but never past the maximum. When idle (or out of work) the
    // minimum cadence applies instead.
    let commit_due = elapsed > config.max_commit_interval_ms
      || (cx.governor.in_idle() && (elapsed > config.min_commit_interval_ms || !self.have_more_work));

    if self.transaction_open && commit_due {
      match cx.store.commit_transaction(Some(CommitCompletion::new(cx.completions.clone()))) {
        Ok(()) => {
          debug!(elapsed_ms = elapsed, "committing indexing transaction");
          self.parked = Parked::Commit;
          return SettleOutcome::Step(BatchStep::Suspend);
        }
        Err(error) => {
          warn!(error = %error, "commit failed; continuing without waiting");
          cx.commit.last_commit = Instant::now();
          if self.have_more_work {
            self.begin_txn(cx);
          } else {
            self.transaction_open = false;
          }
        }
      }
    }
    SettleOutcome::Continue
  }

  fn finish(&mut self, cx: &mut BatchCx<'_>) -> BatchStep {
    cx.notify_listeners();
    if self.transaction_open {
      // Defer the final commit to the next idle moment so back-to-back
      // bursts of jobs don't pay redundant commit latency.
      cx.commit.idle_to_commit = true;
    }
    debug!("batch complete");
    BatchStep::Done
  }
}

impl Default for BatchRunner {
  fn default() -> Self {
    Self::new()
  }
}

/// Resume the top frame once, converting panics into worker errors.
fn step_active_frame(cx: &mut BatchCx<'_>) -> Result<StepOutcome, WorkerError> {
  let WorkState { stack, active, pending, .. } = &mut *cx.work;
  let Some(frame) = stack.top_mut() else {
    return Err(WorkerError::Failed("no frame to drive".into()));
  };
  let Some(active_job) = active.as_mut() else {
    return Err(WorkerError::Failed("frame without an active job".into()));
  };
  let input = pending.take();
  let mut step_cx = StepCx::new(&mut active_job.job, input, cx.completions);
  match catch_unwind(AssertUnwindSafe(|| frame.step(&mut step_cx))) {
    Ok(result) => result,
    Err(panic) => Err(WorkerError::Panicked(crate::panic_message(panic))),
  }
}
