//! Task outcomes and the classifier that produces them.
//!
//! The supervisor observes three raw signals for each worker: whether a
//! message arrived on the result channel (and whether it parsed), how the
//! process exited, and whether the deadline fired first. [`classify`] maps
//! those signals to exactly one [`TaskOutcome`]. It has no side effects and
//! is the only place the precedence rules live:
//!
//! 1. a valid message wins over everything else (its own success flag decides);
//! 2. a malformed message is a protocol violation;
//! 3. no message + deadline fired → `Timeout`;
//! 4. no message + fatal signal → `Crash(Some(signal))`;
//! 5. no message + clean exit → `ProtocolViolation("no result")`;
//! 6. no message + nonzero code or unknown status → `Crash(None)`.
//!
//! A truncated message (stdout closed mid-line) counts as no message, except
//! that a clean exit reports it as malformed rather than missing.

use crate::error::ServiceError;
use crate::pipeline::ipc::WorkerMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitStatus;

/// Axis-aligned box in pixel coordinates of the preprocessed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

/// Structured result of one table extraction.
///
/// This is also the HTTP success body, field for field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableResult {
    /// `<table>` markup, or `None` when no table was found.
    pub html: Option<String>,
    /// Rows of cell texts.
    pub cells: Option<Vec<Vec<String>>>,
    /// The same rows rendered as CSV.
    pub csv: Option<String>,
    /// Table regions.
    #[serde(default)]
    pub bboxes: Vec<BBox>,
    /// Mean confidence in `[0, 1]`.
    pub confidence: f32,
}

impl TableResult {
    /// The result for an image with no recognisable content.
    pub fn empty() -> Self {
        Self {
            html: None,
            cells: None,
            csv: None,
            bboxes: Vec::new(),
            confidence: 0.0,
        }
    }

    /// Check invariants that cannot be expressed in the type.
    pub fn validate(&self) -> Result<(), String> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if let Some(b) = self.bboxes.iter().find(|b| b.w < 0 || b.h < 0) {
            return Err(format!("bbox with negative size: {b:?}"));
        }
        Ok(())
    }
}

/// What happened to one task invocation. Exactly one case applies.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The task completed.
    Success(TableResult),
    /// The task body reported an internal error without crashing.
    Failure(String),
    /// The worker terminated abnormally; the signal number when known.
    Crash(Option<i32>),
    /// The deadline elapsed before any outcome was observed.
    Timeout,
    /// The worker exited without a usable message.
    ProtocolViolation(String),
}

impl TaskOutcome {
    /// Short, stable name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskOutcome::Success(_) => "success",
            TaskOutcome::Failure(_) => "failure",
            TaskOutcome::Crash(_) => "crash",
            TaskOutcome::Timeout => "timeout",
            TaskOutcome::ProtocolViolation(_) => "protocol_violation",
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Success(_) => write!(f, "success"),
            TaskOutcome::Failure(msg) => write!(f, "Inference failed: {msg}"),
            TaskOutcome::Crash(Some(sig)) => write!(f, "backend crashed (signal={sig})"),
            TaskOutcome::Crash(None) => write!(f, "backend crashed"),
            TaskOutcome::Timeout => write!(f, "Inference timeout"),
            TaskOutcome::ProtocolViolation(detail) => {
                write!(f, "backend protocol violation: {detail}")
            }
        }
    }
}

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    /// Normal exit with this code.
    Code(i32),
    /// Terminated by this signal.
    Signal(i32),
    /// Neither a code nor a signal could be read.
    Unknown,
}

impl From<ExitStatus> for ExitState {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return ExitState::Signal(sig);
            }
        }
        match status.code() {
            Some(code) => ExitState::Code(code),
            None => ExitState::Unknown,
        }
    }
}

/// What arrived on the result channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceivedMessage {
    /// A message that parsed and validated.
    Valid(WorkerMessage),
    /// Bytes that were not a valid message; the detail says why.
    Malformed(String),
    /// An unfinished line that does not parse; the writer was cut off.
    Truncated(String),
}

/// Raw signals gathered by the supervisor for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub message: Option<ReceivedMessage>,
    pub exit: ExitState,
    pub timed_out: bool,
}

/// Map an observation to its outcome.
///
/// Returns `Err` only when the worker reported that the task body could not
/// be loaded; that is a service-level condition, not a task outcome.
pub fn classify(obs: Observation) -> Result<TaskOutcome, ServiceError> {
    match obs.message {
        Some(ReceivedMessage::Valid(WorkerMessage::Success { result })) => {
            Ok(TaskOutcome::Success(result))
        }
        Some(ReceivedMessage::Valid(WorkerMessage::Failure { message })) => {
            Ok(TaskOutcome::Failure(message))
        }
        Some(ReceivedMessage::Valid(WorkerMessage::InitFailed { message })) => {
            Err(ServiceError::EngineInitFailed(message))
        }
        Some(ReceivedMessage::Malformed(detail)) => Ok(TaskOutcome::ProtocolViolation(format!(
            "malformed result: {detail}"
        ))),
        Some(ReceivedMessage::Truncated(ref detail)) => Ok(without_message(
            &obs,
            format!("malformed result: {detail}"),
        )),
        None => Ok(without_message(&obs, "no result".into())),
    }
}

fn without_message(obs: &Observation, clean_exit_detail: String) -> TaskOutcome {
    if obs.timed_out {
        return TaskOutcome::Timeout;
    }
    match obs.exit {
        ExitState::Signal(sig) => TaskOutcome::Crash(Some(sig)),
        ExitState::Code(0) => TaskOutcome::ProtocolViolation(clean_exit_detail),
        ExitState::Code(_) | ExitState::Unknown => TaskOutcome::Crash(None),
    }
}
