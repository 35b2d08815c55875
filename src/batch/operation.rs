//! Operation identity, payloads, outcomes, and the per-operation state machine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identity of an operation within its batch: the zero-based submission index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub usize);

impl OperationId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<usize> for OperationId {
    fn from(i: usize) -> Self {
        OperationId(i)
    }
}

/// Handle to the data an operation transmits.
///
/// File payloads are opened and streamed by the transport at send time; the
/// batch itself never reads them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadRef {
    File(PathBuf),
    Bytes(Bytes),
}

impl PayloadRef {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        PayloadRef::File(path.into())
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        PayloadRef::Bytes(data.into())
    }

    /// Size of the payload in bytes. Stats the file for file payloads.
    pub async fn len(&self) -> std::io::Result<u64> {
        match self {
            PayloadRef::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            PayloadRef::Bytes(b) => Ok(b.len() as u64),
        }
    }
}

/// Why an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The remote call completed with an error.
    Transport,
    /// The transport refused the call before returning a future.
    Rejected,
    /// Aborted in flight by cancellation.
    Aborted,
    /// The per-operation timeout elapsed.
    TimedOut,
    /// The transport future panicked.
    Panicked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Transport => "transport",
            FailureKind::Rejected => "rejected",
            FailureKind::Aborted => "aborted",
            FailureKind::TimedOut => "timed_out",
            FailureKind::Panicked => "panicked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, message)
    }
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Rejected, message)
    }
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Aborted, message)
    }
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TimedOut, message)
    }
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Panicked, message)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of one remote call. Resolved exactly once per call by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure(FailureReason),
}

impl Outcome {
    pub fn failure(reason: FailureReason) -> Self {
        Outcome::Failure(reason)
    }
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Lifecycle state of an operation.
///
/// `Pending -> InFlight -> {Succeeded | Failed}`, or `Pending -> Cancelled`.
/// Nothing leaves a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    InFlight,
    Succeeded,
    Failed(FailureReason),
    Cancelled,
}

impl OperationState {
    pub fn kind(&self) -> StateKind {
        match self {
            OperationState::Pending => StateKind::Pending,
            OperationState::InFlight => StateKind::InFlight,
            OperationState::Succeeded => StateKind::Succeeded,
            OperationState::Failed(_) => StateKind::Failed,
            OperationState::Cancelled => StateKind::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

/// Payload-free discriminant of [`OperationState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Cancelled,
}

impl StateKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StateKind::Succeeded | StateKind::Failed | StateKind::Cancelled
        )
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateKind::Pending => "pending",
            StateKind::InFlight => "in_flight",
            StateKind::Succeeded => "succeeded",
            StateKind::Failed => "failed",
            StateKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One unit of work waiting to be dispatched.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub payload: PayloadRef,
}

impl Operation {
    pub fn new(id: OperationId, payload: PayloadRef) -> Self {
        Self { id, payload }
    }
}
