//! Contract between the durable runtime and a workflow interpreter.
//!
//! The interpreter owns all business logic: it reads the state, advances
//! execution until it finishes, fails, yields, or parks at a wait point, and
//! reports which cases the runtime must arm. The runtime owns persistence,
//! locking and scheduling.

use crate::record::WorkflowStatus;
use crate::state::{ArmedCase, CaseKind, Position, WorkflowState};
use bytes::Bytes;
use std::time::Duration;

/// External input fed into one advance.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceInput {
    /// Pure re-drive with no external input.
    Resume,
    /// An external event matched `case`, armed by `thread`.
    Event {
        thread: String,
        case: String,
        payload: serde_json::Value,
    },
    /// The timer for `case`, armed by `thread`, fired.
    Timer { thread: String, case: String },
}

impl AdvanceInput {
    /// The case this input resolves, if any.
    pub fn case(&self) -> Option<&str> {
        match self {
            AdvanceInput::Resume => None,
            AdvanceInput::Event { case, .. } | AdvanceInput::Timer { case, .. } => Some(case),
        }
    }

    /// The thread whose wait point this input targets, if any.
    pub fn thread(&self) -> Option<&str> {
        match self {
            AdvanceInput::Resume => None,
            AdvanceInput::Event { thread, .. } | AdvanceInput::Timer { thread, .. } => {
                Some(thread)
            }
        }
    }
}

/// A case the interpreter wants armed at a newly entered wait point.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseSpec {
    pub name: String,
    pub kind: CaseKind,
    /// Delay before a timer case fires. Ignored for events.
    pub delay: Option<Duration>,
    /// Opaque data stored with the case and handed back on delivery.
    pub setup_data: serde_json::Value,
}

impl CaseSpec {
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: CaseKind::Event,
            delay: None,
            setup_data: serde_json::Value::Null,
        }
    }

    pub fn timer(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            kind: CaseKind::Timer,
            delay: Some(delay),
            setup_data: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_setup_data(mut self, setup_data: serde_json::Value) -> Self {
        self.setup_data = setup_data;
        self
    }

    /// Registry entry for this case, not yet armed.
    pub fn to_armed(&self) -> ArmedCase {
        ArmedCase {
            name: self.name.clone(),
            kind: self.kind,
            delay_ms: self
                .delay
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            setup_data: self.setup_data.clone(),
            timer: None,
        }
    }
}

/// A wait point entered by one thread during an advance.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitSpec {
    pub thread: String,
    pub wait: String,
    pub cases: Vec<CaseSpec>,
}

impl WaitSpec {
    pub fn new(thread: impl Into<String>, wait: impl Into<String>, cases: Vec<CaseSpec>) -> Self {
        Self {
            thread: thread.into(),
            wait: wait.into(),
            cases,
        }
    }
}

/// Result of one advance.
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    /// New business payload.
    pub data: Bytes,
    /// New position.
    pub position: Position,
    /// Status to persist. `Running` means the interpreter yielded and wants
    /// to be re-driven by a resume.
    pub status: WorkflowStatus,
    /// Wait points entered during this advance.
    pub armed: Vec<WaitSpec>,
    /// The case that resolved its wait point, if the input resolved one.
    pub resolved: Option<String>,
    /// Threads that ran to completion; their wait points are torn down.
    pub finished_threads: Vec<String>,
    /// Result of the resolved case, returned to the event sender.
    pub output: Option<serde_json::Value>,
}

impl Advance {
    pub fn new(data: Bytes, position: Position, status: WorkflowStatus) -> Self {
        Self {
            data,
            position,
            status,
            armed: Vec::new(),
            resolved: None,
            finished_threads: Vec::new(),
            output: None,
        }
    }

    #[must_use]
    pub fn arm(mut self, wait: WaitSpec) -> Self {
        self.armed.push(wait);
        self
    }

    #[must_use]
    pub fn resolve(mut self, case: impl Into<String>) -> Self {
        self.resolved = Some(case.into());
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Failure reported by an interpreter.
#[derive(Debug, thiserror::Error)]
pub enum AdvanceError {
    /// Non-recoverable business error. The instance is persisted as `Failed`.
    #[error("Workflow failed: {0}")]
    Business(String),
    /// The input is unacceptable, for example a malformed event payload.
    /// Nothing is persisted and the sender is told.
    #[error("Input rejected: {0}")]
    Rejected(String),
    /// Anything worth retrying. Nothing is persisted.
    #[error("Transient interpreter error: {0}")]
    Transient(#[source] anyhow::Error),
}

/// A workflow definition that can be advanced from a persisted state.
///
/// Implementations must be synchronous and non-blocking: genuine waiting is
/// expressed by returning `Waiting` plus armed cases.
pub trait Interpreter: Send + Sync {
    /// Position of a freshly created instance.
    fn initial_position(&self) -> Position {
        Position::start()
    }

    /// Advance `state` with `input`.
    ///
    /// `state.waits` shows which threads are already parked, so a plain
    /// resume must not re-arm them.
    fn advance(&self, state: &WorkflowState, input: AdvanceInput) -> Result<Advance, AdvanceError>;
}
