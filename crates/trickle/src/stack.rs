//! Worker frames and the cooperative call stack.
//!
//! Workers are hand-rolled resumable state machines, not native futures.
//! The scheduler needs to inspect the stack of in-flight frames and
//! truncate it at an arbitrary depth during error recovery, which a native
//! async stack does not expose; so suspension is modeled explicitly: every
//! call to [`WorkerFrame::step`] performs one token's worth of work and
//! reports how the frame wants to proceed via [`StepOutcome`].
//!
//! # Frame protocol
//!
//! - `Continue`: more synchronous work remains; the runner re-steps the
//!   frame immediately (budget permitting).
//! - `Suspend`: the frame started an asynchronous operation and handed a
//!   [`CompletionHandle`] to it; the runner parks until that completion
//!   fires. One token is still charged.
//! - `Push`: the frame delegates to a sub-frame, which becomes the new top
//!   of the stack and is driven next.
//! - `Done` / `DoneWithValue`: the frame is finished and is popped; a value
//!   from `DoneWithValue` becomes the resume input of the frame beneath it.
//!
//! Returning `Err` is the failure path: the batch runner offers the error
//! to the job's `recover` hook and otherwise abandons the job. Nothing a
//! frame does can propagate past the runner.

use std::fmt;

use crate::handle::CompletionHandle;
use crate::job::Job;
use crate::store::StoreError;

/// Value handed to a frame when it resumes: the result of an asynchronous
/// completion, or of a sub-frame that finished with `DoneWithValue`.
pub type ResumeValue = serde_json::Value;

/// Opaque per-frame metadata, recorded when a frame is pushed and surfaced
/// to `recover` hooks for diagnostics. Not interpreted by the scheduler.
pub type FrameContext = serde_json::Value;

/// Errors surfaced by a worker frame step.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  #[error("worker failure: {0}")]
  Failed(String),
  #[error("worker panicked: {0}")]
  Panicked(String),
  #[error("malformed job payload: {0}")]
  BadPayload(String),
  #[error("storage failure: {0}")]
  Store(#[from] StoreError),
}

/// What a frame wants the runner to do after one step.
pub enum StepOutcome {
  /// Keep driving this frame synchronously.
  Continue,
  /// Wait for an external completion before resuming.
  Suspend,
  /// Push a sub-frame and keep driving on the new top of the stack.
  Push(Box<dyn WorkerFrame>, FrameContext),
  /// This frame is finished; pop it.
  Done,
  /// This frame is finished; pop it and resume the frame beneath with the
  /// given value.
  DoneWithValue(ResumeValue),
}

impl fmt::Debug for StepOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Continue => f.write_str("Continue"),
      Self::Suspend => f.write_str("Suspend"),
      Self::Push(..) => f.write_str("Push(..)"),
      Self::Done => f.write_str("Done"),
      Self::DoneWithValue(v) => write!(f, "DoneWithValue({v})"),
    }
  }
}

/// Per-step context handed to a frame.
///
/// Gives the frame mutable access to its job (progress cursor, goal,
/// completion callback), the resume value from the previous suspension, and
/// a [`CompletionHandle`] it can clone into any asynchronous operation it
/// launches before returning [`StepOutcome::Suspend`].
pub struct StepCx<'a> {
  job: &'a mut Job,
  input: Option<ResumeValue>,
  completions: &'a CompletionHandle,
}

impl<'a> StepCx<'a> {
  pub(crate) fn new(job: &'a mut Job, input: Option<ResumeValue>, completions: &'a CompletionHandle) -> Self {
    Self { job, input, completions }
  }

  /// The job this frame is working on.
  pub fn job(&mut self) -> &mut Job {
    self.job
  }

  /// Take the resume value delivered by the previous suspension, if any.
  /// Subsequent calls within the same step return `None`.
  pub fn take_input(&mut self) -> Option<ResumeValue> {
    self.input.take()
  }

  /// A handle the frame can hand to an asynchronous operation; firing it
  /// resumes the scheduler with the supplied value.
  pub fn completions(&self) -> CompletionHandle {
    self.completions.clone()
  }
}

/// One suspended unit of cooperative work.
///
/// Implementations must be cheap to step: one step should correspond to one
/// "token" of work (roughly, indexing one medium-sized item). Long
/// synchronous stretches inside a single step defeat the adaptive pacing.
pub trait WorkerFrame: Send {
  /// Perform one token of work.
  fn step(&mut self, cx: &mut StepCx<'_>) -> Result<StepOutcome, WorkerError>;
}

/// The manual stack of suspended frames.
///
/// The top of the stack is the frame currently being driven. Frames and
/// their contexts are pushed and popped together; the two columns are the
/// same length at every observable point.
#[derive(Default)]
pub struct CooperativeStack {
  frames: Vec<Box<dyn WorkerFrame>>,
  contexts: Vec<FrameContext>,
}

impl CooperativeStack {
  pub fn new() -> Self {
    Self::default()
  }

  /// Push a frame; it becomes the active one.
  pub fn push(&mut self, frame: Box<dyn WorkerFrame>, context: FrameContext) {
    self.frames.push(frame);
    self.contexts.push(context);
  }

  /// Finalize and remove the top frame. No-op on an empty stack.
  pub fn pop(&mut self) {
    self.frames.pop();
    self.contexts.pop();
  }

  /// Pop frames until only `stop_at_depth` remain. Used for both graceful
  /// teardown (`stop_at_depth == 0`) and partial recovery. Tolerates being
  /// called when nothing is active.
  pub fn unwind(&mut self, stop_at_depth: usize) {
    while self.frames.len() > stop_at_depth {
      self.pop();
    }
  }

  /// The frame currently being driven, if any.
  pub fn top_mut(&mut self) -> Option<&mut Box<dyn WorkerFrame>> {
    self.frames.last_mut()
  }

  /// Diagnostic contexts for every in-flight frame, bottom first.
  pub fn contexts(&self) -> &[FrameContext] {
    &self.contexts
  }

  pub fn len(&self) -> usize {
    debug_assert_eq!(self.frames.len(), self.contexts.len());
    self.frames.len()
  }

  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }
}

impl fmt::Debug for CooperativeStack {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CooperativeStack").field("depth", &self.frames.len()).finish()
  }
}
