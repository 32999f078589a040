//! Indexer plugins and the job-type → worker mapping.
//!
//! Each pluggable indexer registers once at startup with a table of
//! `(job_type, WorkerDefinition)` pairs. The registry fills in defaults for
//! absent optional hooks at registration time so call sites never probe for
//! them ad hoc, and keeps a back-reference from every definition to the
//! plugin that supplied it.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{info, warn};

use crate::job::Job;
use crate::stack::{FrameContext, WorkerError, WorkerFrame};

/// A pluggable indexer.
///
/// Plugins supply the workers that do the actual indexing and receive
/// lifecycle callbacks: `enable`/`disable` track the scheduler's enabled
/// state, and `initial_sweep` is each plugin's one chance to traverse its
/// corpus and queue whatever is not yet indexed.
pub trait IndexerPlugin: Send {
  fn name(&self) -> &str;

  /// Called when the scheduler becomes enabled (or immediately at
  /// registration if it already is).
  fn enable(&mut self) {}

  /// Called when the scheduler is disabled or shuts down. Only called if
  /// `enable` was.
  fn disable(&mut self) {}

  /// Called once per process lifetime, a while after the scheduler first
  /// becomes enabled.
  fn initial_sweep(&mut self) {}

  /// Hand over this plugin's worker table. Called exactly once, at
  /// registration.
  fn take_workers(&mut self) -> Vec<(String, WorkerDefinition)>;
}

/// Factory that instantiates the entry frame for a hired job.
pub type EntryFactory = Box<dyn Fn(&mut Job) -> Box<dyn WorkerFrame> + Send>;

/// Hook offered a failed job: given the job, the diagnostic contexts of the
/// in-flight frames, and the error, it may return the stack depth to unwind
/// to for a partial retry. `None` declines recovery.
pub type RecoverHook = Box<dyn Fn(&mut Job, &[FrameContext], &WorkerError) -> Option<usize> + Send>;

/// Hook run when a job is abandoned (fatal failure, kill, or shutdown).
pub type CleanupHook = Box<dyn Fn(&mut Job) + Send>;

/// Hook run just before a job's entry frame is created, for jobs that
/// accumulate state while queued and need finalizing.
pub type OnScheduleHook = Box<dyn Fn(&mut Job) + Send>;

/// Hook run when a queued job is removed by a purge before ever being hired.
pub type JobCanceledHook = Box<dyn Fn(&mut Job) + Send>;

/// Hook supplying the human-readable label of the job's current target for
/// progress listeners.
pub type DescribeHook = Box<dyn Fn(&Job) -> Option<String> + Send>;

/// Everything the scheduler needs to run jobs of one type.
pub struct WorkerDefinition {
  pub(crate) name: String,
  pub(crate) plugin: usize,
  pub(crate) entry: EntryFactory,
  pub(crate) recover: Option<RecoverHook>,
  pub(crate) cleanup: Option<CleanupHook>,
  pub(crate) on_schedule: Option<OnScheduleHook>,
  pub(crate) job_canceled: Option<JobCanceledHook>,
  pub(crate) describe: Option<DescribeHook>,
}

impl WorkerDefinition {
  /// A definition with the given entry factory and no optional hooks.
  pub fn new(entry: impl Fn(&mut Job) -> Box<dyn WorkerFrame> + Send + 'static) -> Self {
    Self {
      name: String::new(),
      plugin: 0,
      entry: Box::new(entry),
      recover: None,
      cleanup: None,
      on_schedule: None,
      job_canceled: None,
      describe: None,
    }
  }

  pub fn with_recover(mut self, hook: impl Fn(&mut Job, &[FrameContext], &WorkerError) -> Option<usize> + Send + 'static) -> Self {
    self.recover = Some(Box::new(hook));
    self
  }

  pub fn with_cleanup(mut self, hook: impl Fn(&mut Job) + Send + 'static) -> Self {
    self.cleanup = Some(Box::new(hook));
    self
  }

  pub fn with_on_schedule(mut self, hook: impl Fn(&mut Job) + Send + 'static) -> Self {
    self.on_schedule = Some(Box::new(hook));
    self
  }

  pub fn with_job_canceled(mut self, hook: impl Fn(&mut Job) + Send + 'static) -> Self {
    self.job_canceled = Some(Box::new(hook));
    self
  }

  pub fn with_describe(mut self, hook: impl Fn(&Job) -> Option<String> + Send + 'static) -> Self {
    self.describe = Some(Box::new(hook));
    self
  }
}

impl fmt::Debug for WorkerDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerDefinition")
      .field("name", &self.name)
      .field("recover", &self.recover.is_some())
      .field("cleanup", &self.cleanup.is_some())
      .finish()
  }
}

/// Registered plugins plus the job-type → definition map.
#[derive(Default)]
pub(crate) struct WorkerRegistry {
  plugins: Vec<Box<dyn IndexerPlugin>>,
  defs: HashMap<String, WorkerDefinition>,
}

impl WorkerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a plugin and its worker table. Re-registration under an
  /// existing job type is not supported; the last write wins, loudly.
  pub fn register(&mut self, mut plugin: Box<dyn IndexerPlugin>) -> usize {
    info!(indexer = plugin.name(), "registering indexer");
    let workers = plugin.take_workers();
    let slot = self.plugins.len();
    self.plugins.push(plugin);

    for (job_type, mut def) in workers {
      def.name = job_type.clone();
      def.plugin = slot;
      if self.defs.insert(job_type.clone(), def).is_some() {
        warn!(job_type = %job_type, "worker re-registered; previous definition replaced");
      }
    }
    slot
  }

  pub fn get(&self, job_type: &str) -> Option<&WorkerDefinition> {
    self.defs.get(job_type)
  }

  /// Enable one plugin (used when registration happens after the scheduler
  /// is already enabled).
  pub fn enable_plugin(&mut self, slot: usize) {
    if let Some(plugin) = self.plugins.get_mut(slot) {
      let name = plugin.name().to_string();
      guard_hook(&name, "enable", || plugin.enable());
    }
  }

  pub fn enable_all(&mut self) {
    for plugin in &mut self.plugins {
      let name = plugin.name().to_string();
      guard_hook(&name, "enable", || plugin.enable());
    }
  }

  pub fn disable_all(&mut self) {
    for plugin in &mut self.plugins {
      let name = plugin.name().to_string();
      guard_hook(&name, "disable", || plugin.disable());
    }
  }

  pub fn initial_sweep_all(&mut self) {
    for plugin in &mut self.plugins {
      let name = plugin.name().to_string();
      guard_hook(&name, "initial_sweep", || plugin.initial_sweep());
    }
  }
}

/// Run a plugin lifecycle hook, containing any panic. Hook failures must
/// never take the scheduler down with them.
fn guard_hook(plugin: &str, hook: &str, f: impl FnOnce()) {
  if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
    warn!(plugin, hook, "indexer hook panicked: {}", crate::panic_message(panic));
  }
}
