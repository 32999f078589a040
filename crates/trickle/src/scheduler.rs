//! The scheduler actor: job intake, the drive/reschedule trampoline, and
//! the enable/suppress/shutdown lifecycle.
//!
//! All scheduler state (the job queue, the frame stack, pacing numbers,
//! listeners) is owned by one long-lived task and touched only from its
//! event loop. Caller requests and asynchronous completions serialize
//! through the mailbox, timer wake-ups through armed sleeps in the same
//! `select!`; there is never a second flow of control mutating anything,
//! which is what lets the cooperative machinery run without locks.
//!
//! # Gating
//!
//! Three flags gate execution. *Desire* accumulates whenever jobs are
//! enqueued, even while nothing can run. *Suppression* is the host's coarse
//! "not now" switch (battery, offline); clearing it resumes where things
//! left off. *Enabled* is the one-time opt-in that also drives plugin
//! `enable`/`disable` fan-out. Work proceeds while desire holds and
//! suppression doesn't, and a single wake-pending flag keeps concurrent
//! drive chains from ever existing.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::activity::ActivityMonitor;
use crate::batch::{BatchCx, BatchRunner, BatchStep};
use crate::config::SchedulerConfig;
use crate::governor::PerformanceGovernor;
use crate::handle::{CompletionHandle, SchedulerHandle};
use crate::job::{Job, JobQueue};
use crate::listener::{ListenerBus, StatusUpdate, current_status};
use crate::message::{Control, JobFilter};
use crate::registry::WorkerRegistry;
use crate::stack::{CooperativeStack, ResumeValue};
use crate::store::IndexStore;

/// The job currently being worked, with its recovery bookkeeping.
pub(crate) struct ActiveJob {
  pub job: Job,
  /// Consecutive recover-hook retries without forward progress.
  pub recoveries: u32,
}

/// The in-flight work picture: the frame stack, the hired job, and the
/// resume plumbing. Outlives individual batches: a parked batch and a
/// `kill_active_job` both operate on this.
#[derive(Default)]
pub(crate) struct WorkState {
  pub stack: CooperativeStack,
  pub active: Option<ActiveJob>,
  /// Value waiting to be fed to the next frame resume.
  pub pending: Option<ResumeValue>,
  /// Whether there is (believed to be) indexing work to do.
  pub desired: bool,
  /// Jobs hired this cycle; resets when the queue drains.
  pub job_count: usize,
}

impl WorkState {
  /// A frame step succeeded; the job is making forward progress, so its
  /// recovery budget refills.
  pub fn note_progress(&mut self) {
    if let Some(active) = self.active.as_mut() {
      active.recoveries = 0;
    }
  }
}

/// Transaction cadence state shared between batches and the idle flush.
pub(crate) struct CommitState {
  pub last_commit: Instant,
  /// A batch ended with its transaction still open; flush it at the next
  /// idle moment (or let the next batch adopt it).
  pub idle_to_commit: bool,
}

/// The indexing scheduler actor.
///
/// Spawn it once per process with [`Scheduler::spawn`]; interact through
/// the returned [`SchedulerHandle`]. Shutdown (via the handle or the
/// cancellation token) is one-way.
pub struct Scheduler {
  config: SchedulerConfig,
  rx: mpsc::Receiver<Control>,
  completions: CompletionHandle,
  cancel: CancellationToken,

  store: Box<dyn IndexStore>,
  activity: Box<dyn ActivityMonitor>,

  registry: WorkerRegistry,
  queue: JobQueue,
  listeners: ListenerBus,
  governor: PerformanceGovernor,
  work: WorkState,
  commit: CommitState,
  batch: Option<BatchRunner>,

  enabled: bool,
  suppressed: bool,
  /// A wake-up is pending or a drive chain is in flight. Guards against
  /// two concurrent drive chains, which the machinery cannot handle.
  wake_pending: bool,
  initial_sweep_performed: bool,

  wake_at: Option<Instant>,
  sweep_at: Option<Instant>,
  idle_poll_at: Option<Instant>,
}

impl Scheduler {
  /// Spawn the scheduler task and return a handle for talking to it.
  pub fn spawn(
    config: SchedulerConfig,
    store: Box<dyn IndexStore>,
    activity: Box<dyn ActivityMonitor>,
    cancel: CancellationToken,
  ) -> SchedulerHandle {
    let (tx, rx) = mpsc::channel(256);
    let actor = Self::new(config, store, activity, cancel, tx.clone(), rx);
    tokio::spawn(actor.run());
    SchedulerHandle::new(tx)
  }

  fn new(
    config: SchedulerConfig,
    store: Box<dyn IndexStore>,
    activity: Box<dyn ActivityMonitor>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Control>,
    rx: mpsc::Receiver<Control>,
  ) -> Self {
    let governor = PerformanceGovernor::new(config.clone());
    let initial_sweep_performed = !config.perform_initial_sweep;
    Self {
      config,
      rx,
      completions: CompletionHandle::new(tx),
      cancel,
      store,
      activity,
      registry: WorkerRegistry::new(),
      queue: JobQueue::new(),
      listeners: ListenerBus::new(),
      governor,
      work: WorkState::default(),
      commit: CommitState {
        last_commit: Instant::now(),
        idle_to_commit: false,
      },
      batch: None,
      enabled: false,
      suppressed: false,
      wake_pending: false,
      initial_sweep_performed,
      wake_at: None,
      sweep_at: None,
      idle_poll_at: None,
    }
  }

  /// Main actor loop. Runs until shutdown is requested via the handle, the
  /// cancellation token, or every handle being dropped.
  async fn run(mut self) {
    info!("indexing scheduler started");

    if self.config.start_enabled {
      self.apply_set_enabled(true);
    }

    loop {
      let wake_at = self.wake_at;
      let sweep_at = self.sweep_at;
      let idle_poll_at = self.idle_poll_at;

      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          self.do_shutdown();
          break;
        }

        msg = self.rx.recv() => {
          match msg {
            Some(Control::Shutdown) | None => {
              self.do_shutdown();
              break;
            }
            Some(control) => self.handle_control(control),
          }
        }

        _ = sleep_until_opt(wake_at) => {
          self.wake_at = None;
          self.drive(None);
        }

        _ = sleep_until_opt(sweep_at) => {
          self.sweep_at = None;
          self.run_initial_sweep();
        }

        _ = sleep_until_opt(idle_poll_at) => {
          self.idle_poll_at = None;
          self.poll_idle_commit();
        }
      }
    }

    info!("indexing scheduler stopped");
  }

  fn handle_control(&mut self, control: Control) {
    trace!(?control, "control message");
    match control {
      Control::RegisterIndexer(plugin) => {
        let slot = self.registry.register(plugin);
        if self.enabled {
          self.registry.enable_plugin(slot);
        }
      }
      Control::Enqueue(job) => self.enqueue(job),
      Control::SetEnabled(enabled) => self.apply_set_enabled(enabled),
      Control::SetSuppressed(suppressed) => self.apply_set_suppressed(suppressed),
      Control::AddListener { listener, reply } => {
        let token = self.listeners.add(listener);
        // A listener added while nothing runs gets an immediate idle
        // snapshot rather than waiting for the next status edge.
        if !self.indexing() {
          self.listeners.emit_to(token, &StatusUpdate::idle());
        }
        let _ = reply.try_send(token);
      }
      Control::RemoveListener(token) => self.listeners.remove(token),
      Control::PurgeJobs(filter) => self.purge_jobs(filter),
      Control::KillActiveJob => self.kill_active_job(),
      Control::Resume(value) => self.drive(value),
      Control::Shutdown => unreachable!("handled in run loop"),
    }
  }

  /// Effectively indexing: work is desired and nothing suppresses it.
  fn indexing(&self) -> bool {
    self.work.desired && !self.suppressed
  }

  fn enqueue(&mut self, job: Job) {
    info!(job = %job, "queueing job for indexing");
    self.queue.push(job);
    self.request_indexing();
  }

  /// Note that there is work to do; start (or re-start) the drive chain if
  /// the gates allow and none is in flight. Edge-triggered on desire.
  fn request_indexing(&mut self) {
    if self.work.desired {
      return;
    }
    self.work.desired = true;
    if self.enabled && !self.wake_pending && !self.suppressed {
      info!("indexing queue processing commencing");
      self.wake_pending = true;
      self.schedule_wake(self.config.kickoff_delay_ms);
    }
  }

  fn apply_set_enabled(&mut self, enabled: bool) {
    if enabled && !self.enabled {
      self.enabled = true;
      self.registry.enable_all();

      // Desire accumulated while disabled; re-trigger the edge.
      if self.work.desired {
        self.work.desired = false;
        self.request_indexing();
      }

      if !self.initial_sweep_performed {
        self.sweep_at = Some(Instant::now() + Duration::from_millis(self.config.initial_sweep_delay_ms));
      }
    } else if !enabled && self.enabled {
      self.registry.disable_all();
      self.enabled = false;
    }
  }

  fn apply_set_suppressed(&mut self, suppressed: bool) {
    self.suppressed = suppressed;
    if !suppressed && self.work.desired && !self.wake_pending {
      info!("indexing queue processing resuming");
      self.wake_pending = true;
      self.schedule_wake(self.config.kickoff_delay_ms);
    }
  }

  /// The trampoline: resume (or create) the batch and interpret where it
  /// parked. Reentrancy cannot happen; completions that arrive while a
  /// step runs queue in the mailbox behind it.
  fn drive(&mut self, input: Option<ResumeValue>) {
    let mut batch = self.batch.take().unwrap_or_default();

    let step = {
      let mut cx = BatchCx {
        work: &mut self.work,
        queue: &mut self.queue,
        registry: &self.registry,
        store: &mut *self.store,
        governor: &mut self.governor,
        listeners: &mut self.listeners,
        activity: &*self.activity,
        completions: &self.completions,
        commit: &mut self.commit,
        suppressed: self.suppressed,
      };
      batch.resume(input, &mut cx)
    };

    match step {
      BatchStep::Done => {
        // Batch discarded. More work can have arrived while it wound
        // down; if so, keep the chain alive at the pause cadence.
        if self.indexing() {
          self.schedule_wake(self.config.pause_interval_ms);
        } else {
          self.wake_pending = false;
          if self.commit.idle_to_commit {
            self.arm_idle_poll();
          }
        }
      }
      BatchStep::Pause => {
        self.batch = Some(batch);
        if self.indexing() {
          self.schedule_wake(self.config.pause_interval_ms);
        } else {
          // Suppressed (or desire lost) mid-run: the parked batch stays
          // put until suppression clears.
          self.wake_pending = false;
        }
      }
      BatchStep::Suspend => {
        // Some external completion now owns the next resume.
        self.batch = Some(batch);
      }
    }
  }

  fn schedule_wake(&mut self, delay_ms: u64) {
    self.wake_at = Some(Instant::now() + Duration::from_millis(delay_ms));
  }

  fn arm_idle_poll(&mut self) {
    self.idle_poll_at = Some(Instant::now() + Duration::from_millis(self.config.idle_commit_poll_ms));
  }

  fn run_initial_sweep(&mut self) {
    if self.initial_sweep_performed {
      return;
    }
    self.initial_sweep_performed = true;
    info!("running initial indexing sweep");
    self.registry.initial_sweep_all();
  }

  /// While a deferred commit is pending, watch for the user going idle and
  /// flush it then.
  fn poll_idle_commit(&mut self) {
    if !self.commit.idle_to_commit {
      return;
    }
    match self.activity.idle_duration() {
      Some(idle) if idle >= Duration::from_secs(self.config.idle_commit_threshold_secs) => {
        self.commit.idle_to_commit = false;
        debug!("flushing deferred commit during idle");
        if let Err(error) = self.store.commit_transaction(None) {
          warn!(error = %error, "deferred commit failed");
        }
        self.commit.last_commit = Instant::now();
        let update = current_status(&self.work, &self.registry, self.indexing());
        self.listeners.emit(&update);
      }
      Some(_) => self.arm_idle_poll(),
      None => {
        // No idle provider; the transaction waits for the next batch to
        // adopt it instead.
        trace!("no idle provider; deferred commit stays pending");
      }
    }
  }

  fn purge_jobs(&mut self, filter: JobFilter) {
    let registry = &self.registry;
    self.queue.purge(
      |job| filter(job),
      |job| {
        debug!(job = %job, "purging queued job");
        if let Some(hook) = registry.get(job.job_type()).and_then(|d| d.job_canceled.as_ref())
          && let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook(job)))
        {
          error!(job = %job, "job_canceled hook panicked: {}", crate::panic_message(panic));
        }
      },
    );
  }

  /// Abandon the hired job: unwind its frames, run its `cleanup` hook,
  /// clear the active slot. Idempotent when nothing is active.
  fn kill_active_job(&mut self) {
    let Some(mut active) = self.work.active.take() else {
      return;
    };
    debug!(job = %active.job, "killing active job");

    self.work.stack.unwind(0);
    if let Some(cleanup) = self.registry.get(active.job.job_type()).and_then(|d| d.cleanup.as_ref())
      && let Err(panic) = catch_unwind(AssertUnwindSafe(|| cleanup(&mut active.job)))
    {
      error!(job = %active.job, "cleanup hook panicked during kill: {}", crate::panic_message(panic));
    }
    // A stale completion for the dead job must not leak into the next one.
    self.work.pending = None;

    // If the batch was waiting on the dead job's completion, that
    // completion may never fire; re-drive so the queue is not wedged.
    if self.batch.as_ref().is_some_and(|b| b.awaiting_async()) {
      self.schedule_wake(0);
    }
  }

  /// One-way teardown. Cleanup hooks are best-effort; nothing re-throws.
  fn do_shutdown(&mut self) {
    if self.enabled {
      info!("indexing scheduler shutting down");
    }
    self.wake_at = None;
    self.sweep_at = None;
    self.idle_poll_at = None;
    self.suppressed = true;

    if let Some(active) = self.work.active.as_mut()
      && let Some(cleanup) = self.registry.get(active.job.job_type()).and_then(|d| d.cleanup.as_ref())
      && let Err(panic) = catch_unwind(AssertUnwindSafe(|| cleanup(&mut active.job)))
    {
      error!("worker cleanup failed during shutdown: {}", crate::panic_message(panic));
    }
    self.work.stack.unwind(0);
    self.work.active = None;
    self.work.pending = None;
    self.batch = None;

    // Drop listeners before disabling plugins so nothing observes the
    // teardown in a half-dismantled state.
    self.listeners.clear();

    if self.enabled {
      self.registry.disable_all();
      self.enabled = false;
    }

    if let Err(error) = self.store.shutdown() {
      warn!(error = %error, "storage shutdown failed");
    }
  }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
  match deadline {
    Some(at) => tokio::time::sleep_until(at).await,
    None => std::future::pending::<()>().await,
  }
}
