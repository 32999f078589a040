//! Test helpers for scheduler end-to-end tests.
//!
//! Provides `TestContext`, which wires a scheduler up with a recording
//! store and a scripted activity monitor, plus a small toolbox of worker
//! frames and a generic test indexer plugin.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
  ActivityMonitor, CompletionHandle, IndexerPlugin, IndexerStatus, Job, Scheduler, SchedulerConfig, SchedulerHandle,
  StatusUpdate, StepCx, StepOutcome, WorkerDefinition, WorkerError, WorkerFrame,
};

// ============================================================================
// Recording store
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
  Begin,
  Commit,
  Shutdown,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreEvent {
  pub kind: StoreEventKind,
  pub at: Instant,
}

/// Storage stub that records transaction edges and completes commits
/// inline.
pub struct RecordingStore {
  log: Arc<Mutex<Vec<StoreEvent>>>,
}

impl crate::IndexStore for RecordingStore {
  fn begin_transaction(&mut self) -> Result<(), crate::StoreError> {
    self.log.lock().unwrap().push(StoreEvent {
      kind: StoreEventKind::Begin,
      at: Instant::now(),
    });
    Ok(())
  }

  fn commit_transaction(&mut self, on_done: Option<crate::CommitCompletion>) -> Result<(), crate::StoreError> {
    self.log.lock().unwrap().push(StoreEvent {
      kind: StoreEventKind::Commit,
      at: Instant::now(),
    });
    if let Some(done) = on_done {
      done.finish();
    }
    Ok(())
  }

  fn shutdown(&mut self) -> Result<(), crate::StoreError> {
    self.log.lock().unwrap().push(StoreEvent {
      kind: StoreEventKind::Shutdown,
      at: Instant::now(),
    });
    Ok(())
  }
}

// ============================================================================
// Scripted activity monitor
// ============================================================================

/// Activity monitor whose reading the test scripts at will.
pub struct SharedActivity {
  idle: Arc<Mutex<Option<Duration>>>,
}

impl ActivityMonitor for SharedActivity {
  fn idle_duration(&self) -> Option<Duration> {
    *self.idle.lock().unwrap()
  }
}

// ============================================================================
// Test context
// ============================================================================

/// A spawned scheduler plus handles on its collaborators.
pub struct TestContext {
  pub handle: SchedulerHandle,
  pub cancel: CancellationToken,
  pub store_log: Arc<Mutex<Vec<StoreEvent>>>,
  pub idle: Arc<Mutex<Option<Duration>>>,
  pub spawned_at: Instant,
}

impl TestContext {
  pub fn spawn() -> Self {
    Self::spawn_with(SchedulerConfig::default())
  }

  pub fn spawn_with(config: SchedulerConfig) -> Self {
    let cancel = CancellationToken::new();
    let store_log: Arc<Mutex<Vec<StoreEvent>>> = Arc::default();
    let idle: Arc<Mutex<Option<Duration>>> = Arc::new(Mutex::new(None));

    let handle = Scheduler::spawn(
      config,
      Box::new(RecordingStore { log: store_log.clone() }),
      Box::new(SharedActivity { idle: idle.clone() }),
      cancel.clone(),
    );

    Self {
      handle,
      cancel,
      store_log,
      idle,
      spawned_at: Instant::now(),
    }
  }

  /// Script the idle reading seen by the scheduler.
  pub fn set_idle(&self, idle: Option<Duration>) {
    *self.idle.lock().unwrap() = idle;
  }

  /// Add a listener that forwards every status update into a channel.
  pub async fn status_channel(&self) -> mpsc::UnboundedReceiver<StatusUpdate> {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .handle
      .add_listener(move |update| {
        let _ = tx.send(update.clone());
      })
      .await
      .expect("add listener");
    rx
  }

  pub fn store_events(&self) -> Vec<StoreEvent> {
    self.store_log.lock().unwrap().clone()
  }

  pub fn commit_times(&self) -> Vec<Instant> {
    self
      .store_events()
      .iter()
      .filter(|e| e.kind == StoreEventKind::Commit)
      .map(|e| e.at)
      .collect()
  }

  /// Cancel the scheduler and give it a moment to wind down.
  pub async fn teardown(self) {
    self.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
  }
}

/// Await a job-completion channel with a generous virtual-time cap.
pub async fn await_completion(rx: &mut mpsc::UnboundedReceiver<Option<Value>>) -> Option<Value> {
  tokio::time::timeout(Duration::from_secs(300), rx.recv())
    .await
    .expect("job did not complete in time")
    .expect("completion channel closed")
}

/// A job whose completion callback reports into the returned channel.
pub fn tracked_job(job_type: &str, items: Vec<Value>) -> (Job, mpsc::UnboundedReceiver<Option<Value>>) {
  let (tx, rx) = mpsc::unbounded_channel();
  let goal = items.len();
  let job = Job::new(job_type, Value::Null)
    .with_items(items)
    .with_goal(goal)
    .on_complete(move |value| {
      let _ = tx.send(value);
    });
  (job, rx)
}

// ============================================================================
// Worker frames
// ============================================================================

/// Consumes one item per resume, then completes.
pub struct ItemConsumer;

impl WorkerFrame for ItemConsumer {
  fn step(&mut self, cx: &mut StepCx<'_>) -> Result<StepOutcome, WorkerError> {
    let job = cx.job();
    if job.offset() < job.items().len() {
      job.advance(1);
      Ok(StepOutcome::Continue)
    } else {
      let offset = job.offset();
      job.invoke_callback(Some(json!(offset)));
      Ok(StepOutcome::Done)
    }
  }
}

pub fn item_consumer_def() -> WorkerDefinition {
  WorkerDefinition::new(|_| Box::new(ItemConsumer) as Box<dyn WorkerFrame>)
}

/// Fails on every resume.
pub struct AlwaysFails;

impl WorkerFrame for AlwaysFails {
  fn step(&mut self, _cx: &mut StepCx<'_>) -> Result<StepOutcome, WorkerError> {
    Err(WorkerError::Failed("synthetic failure".into()))
  }
}

/// Fails the first `failures` resumes, then behaves like `ItemConsumer`.
pub struct Flaky {
  pub failures: usize,
}

impl WorkerFrame for Flaky {
  fn step(&mut self, cx: &mut StepCx<'_>) -> Result<StepOutcome, WorkerError> {
    if self.failures > 0 {
      self.failures -= 1;
      return Err(WorkerError::Failed("transient failure".into()));
    }
    ItemConsumer.step(cx)
  }
}

/// Suspends once on a completion the test controls, then finishes.
pub struct HoldsAsync {
  pub slot: Arc<Mutex<Option<CompletionHandle>>>,
  pub parked: bool,
}

impl WorkerFrame for HoldsAsync {
  fn step(&mut self, cx: &mut StepCx<'_>) -> Result<StepOutcome, WorkerError> {
    if !self.parked {
      self.parked = true;
      *self.slot.lock().unwrap() = Some(cx.completions());
      Ok(StepOutcome::Suspend)
    } else {
      let value = cx.take_input();
      cx.job().invoke_callback(value);
      Ok(StepOutcome::Done)
    }
  }
}

/// Suspends and resumes itself through a spawned task, echoing a value.
pub struct AsyncEcho {
  pub parked: bool,
}

impl WorkerFrame for AsyncEcho {
  fn step(&mut self, cx: &mut StepCx<'_>) -> Result<StepOutcome, WorkerError> {
    if !self.parked {
      self.parked = true;
      let completions = cx.completions();
      tokio::spawn(async move {
        completions.resume(Some(json!("pong")));
      });
      Ok(StepOutcome::Suspend)
    } else {
      let value = cx.take_input();
      cx.job().invoke_callback(value);
      Ok(StepOutcome::Done)
    }
  }
}

/// Pushes a sub-frame that finishes with a value, then reports that value
/// through the job callback.
pub struct Delegator {
  pub delegated: bool,
}

struct SubWorker;

impl WorkerFrame for SubWorker {
  fn step(&mut self, _cx: &mut StepCx<'_>) -> Result<StepOutcome, WorkerError> {
    Ok(StepOutcome::DoneWithValue(json!("from-sub-worker")))
  }
}

impl WorkerFrame for Delegator {
  fn step(&mut self, cx: &mut StepCx<'_>) -> Result<StepOutcome, WorkerError> {
    if !self.delegated {
      self.delegated = true;
      Ok(StepOutcome::Push(Box::new(SubWorker), json!({"frame": "sub-worker"})))
    } else {
      let value = cx.take_input();
      cx.job().invoke_callback(value);
      Ok(StepOutcome::Done)
    }
  }
}

// ============================================================================
// Test indexer plugin
// ============================================================================

/// Generic plugin that hands over a prepared worker table and counts its
/// lifecycle callbacks.
pub struct TestIndexer {
  name: &'static str,
  workers: Vec<(String, WorkerDefinition)>,
  pub enables: Arc<AtomicUsize>,
  pub disables: Arc<AtomicUsize>,
  pub sweeps: Arc<AtomicUsize>,
}

impl TestIndexer {
  pub fn new(name: &'static str) -> Self {
    Self {
      name,
      workers: Vec::new(),
      enables: Arc::new(AtomicUsize::new(0)),
      disables: Arc::new(AtomicUsize::new(0)),
      sweeps: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn with_worker(mut self, job_type: &str, def: WorkerDefinition) -> Self {
    self.workers.push((job_type.to_string(), def));
    self
  }

  /// Clones of the lifecycle counters, for asserting after the plugin has
  /// been moved into the scheduler.
  pub fn counters(&self) -> (Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    (self.enables.clone(), self.disables.clone(), self.sweeps.clone())
  }
}

impl IndexerPlugin for TestIndexer {
  fn name(&self) -> &str {
    self.name
  }

  fn enable(&mut self) {
    self.enables.fetch_add(1, Ordering::SeqCst);
  }

  fn disable(&mut self) {
    self.disables.fetch_add(1, Ordering::SeqCst);
  }

  fn initial_sweep(&mut self) {
    self.sweeps.fetch_add(1, Ordering::SeqCst);
  }

  fn take_workers(&mut self) -> Vec<(String, WorkerDefinition)> {
    std::mem::take(&mut self.workers)
  }
}

/// Poll a condition until it holds, advancing virtual time between polls.
pub async fn wait_until(condition: impl Fn() -> bool) {
  for _ in 0..400 {
    if condition() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  panic!("condition not reached in time");
}

/// Drain every status update currently buffered in the channel.
pub fn drain_statuses(rx: &mut mpsc::UnboundedReceiver<StatusUpdate>) -> Vec<StatusUpdate> {
  let mut updates = Vec::new();
  while let Ok(update) = rx.try_recv() {
    updates.push(update);
  }
  updates
}

/// Offsets reported by Indexing updates, in order.
pub fn indexing_offsets(updates: &[StatusUpdate]) -> Vec<usize> {
  updates
    .iter()
    .filter(|u| u.status == IndexerStatus::Indexing)
    .map(|u| u.offset)
    .collect()
}
