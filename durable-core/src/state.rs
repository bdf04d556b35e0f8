//! Workflow state structures for checkpoint/resume.
//!
//! The business payload is opaque bytes owned by the interpreter. The
//! execution position and the registry of armed wait cases are explicit,
//! serializable values so an instance can be persisted and resumed without
//! native continuations.

use crate::error::CoreError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier the scheduler hands back for a one-shot timer delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerHandle(String);

impl TimerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Represents the position in workflow execution.
///
/// This replaces a suspended call stack: interpreters record where each
/// thread of execution stands and pick up from there on the next advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Position {
    /// At statement `index` of a sequence.
    Sequence { index: usize },
    /// Inside the loop at statement `index`, on iteration `iteration`.
    Loop { index: usize, iteration: u32 },
    /// Several threads are active; each tracks its own position.
    Threads { threads: BTreeMap<String, Position> },
}

impl Position {
    /// The position before the first statement.
    pub fn start() -> Self {
        Position::Sequence { index: 0 }
    }

    /// Position of a named thread, if this is a thread table.
    pub fn thread(&self, name: &str) -> Option<&Position> {
        match self {
            Position::Threads { threads } => threads.get(name),
            _ => None,
        }
    }

    /// Statement index of the top-level sequence or loop.
    pub fn index(&self) -> Option<usize> {
        match self {
            Position::Sequence { index } | Position::Loop { index, .. } => Some(*index),
            Position::Threads { .. } => None,
        }
    }
}

/// Whether a case waits on an external event or on a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseKind {
    Event,
    Timer,
}

/// A case currently armed at a wait point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmedCase {
    /// Unique within its wait point.
    pub name: String,
    pub kind: CaseKind,
    /// Timer delay in milliseconds, kept so a timer whose arming failed can
    /// be armed again later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Opaque data the case needs for teardown.
    #[serde(default)]
    pub setup_data: serde_json::Value,
    /// Scheduler handle of an armed timer. `None` for events, or for a timer
    /// whose arming failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<TimerHandle>,
}

/// A wait point one thread is parked at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmedWait {
    /// Name of the wait point.
    pub wait: String,
    pub cases: Vec<ArmedCase>,
}

impl ArmedWait {
    /// Create a wait point, rejecting duplicate case names.
    pub fn new(wait: impl Into<String>, cases: Vec<ArmedCase>) -> Result<Self, CoreError> {
        let wait = wait.into();
        for (i, case) in cases.iter().enumerate() {
            if cases[..i].iter().any(|other| other.name == case.name) {
                return Err(CoreError::DuplicateCase {
                    wait,
                    case: case.name.clone(),
                });
            }
        }
        Ok(Self { wait, cases })
    }

    pub fn case(&self, name: &str) -> Option<&ArmedCase> {
        self.cases.iter().find(|case| case.name == name)
    }

    pub fn case_mut(&mut self, name: &str) -> Option<&mut ArmedCase> {
        self.cases.iter_mut().find(|case| case.name == name)
    }

    /// Handles of every armed timer at this wait point.
    pub fn timers(&self) -> impl Iterator<Item = &TimerHandle> {
        self.cases.iter().filter_map(|case| case.timer.as_ref())
    }

    /// Timer cases that have no scheduler handle yet.
    pub fn unarmed_timers(&self) -> impl Iterator<Item = &ArmedCase> {
        self.cases
            .iter()
            .filter(|case| case.kind == CaseKind::Timer && case.timer.is_none())
    }
}

/// Registry of armed wait points, keyed by thread name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaitRegistry {
    threads: BTreeMap<String, ArmedWait>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn get(&self, thread: &str) -> Option<&ArmedWait> {
        self.threads.get(thread)
    }

    pub fn get_mut(&mut self, thread: &str) -> Option<&mut ArmedWait> {
        self.threads.get_mut(thread)
    }

    /// Park `thread` at `wait`, returning the wait point it replaces.
    pub fn insert(&mut self, thread: impl Into<String>, wait: ArmedWait) -> Option<ArmedWait> {
        self.threads.insert(thread.into(), wait)
    }

    pub fn remove(&mut self, thread: &str) -> Option<ArmedWait> {
        self.threads.remove(thread)
    }

    /// Remove every wait point.
    pub fn drain(&mut self) -> Vec<(String, ArmedWait)> {
        std::mem::take(&mut self.threads).into_iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArmedWait)> {
        self.threads
            .iter()
            .map(|(thread, wait)| (thread.as_str(), wait))
    }

    /// Find the thread that has `case` armed, if any.
    pub fn find_case(&self, case: &str) -> Option<(&str, &ArmedCase)> {
        self.threads.iter().find_map(|(thread, wait)| {
            wait.case(case).map(|armed| (thread.as_str(), armed))
        })
    }
}

/// Complete resumable state of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Interpreter-owned business payload.
    /// Stored as Vec<u8> for serialization compatibility.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Where execution resumes.
    pub position: Position,
    /// Cases currently armed, per thread.
    #[serde(default)]
    pub waits: WaitRegistry,
    /// Result of the most recently resolved case, if it produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl WorkflowState {
    pub fn new(data: Bytes, position: Position) -> Self {
        Self {
            data: data.to_vec(),
            position,
            waits: WaitRegistry::new(),
            output: None,
        }
    }

    /// Get the business payload as Bytes.
    pub fn data_bytes(&self) -> Bytes {
        Bytes::from(self.data.clone())
    }
}
