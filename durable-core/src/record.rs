//! Persisted workflow records.
//!
//! One [`WorkflowRecord`] exists per workflow instance. It is the only shared
//! mutable resource of the system and is always mutated through a
//! lock, read, modify, write, unlock cycle.

use crate::error::CoreError;
use crate::lease;
use crate::state::WorkflowState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// The instance can make progress without external input.
    Running,
    /// The instance is parked at one or more wait points.
    Waiting,
    /// The instance completed. Terminal.
    Finished,
    /// The interpreter reported a non-recoverable business error. Terminal.
    Failed,
}

impl WorkflowStatus {
    /// Check if no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Finished | WorkflowStatus::Failed)
    }

    /// Check if the lifecycle allows moving from `self` to `next`.
    ///
    /// A waiting instance is running for the duration of the critical section
    /// that handles its delivery, so `Waiting -> Waiting` and
    /// `Waiting -> Finished` are the composition of two allowed steps.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, next) {
            (Finished | Failed, _) => false,
            (Running | Waiting, Running | Waiting | Finished | Failed) => true,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Running => "Running",
            WorkflowStatus::Waiting => "Waiting",
            WorkflowStatus::Finished => "Finished",
            WorkflowStatus::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// The persisted record of one workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Caller-supplied, immutable identifier. Never reused.
    pub id: String,
    /// Selects the interpreter that governs this instance.
    pub workflow_type: String,
    /// Business payload plus control data.
    pub state: WorkflowState,
    /// Current lifecycle status.
    pub status: WorkflowStatus,
    /// The record is held while `now < lock_until`. `None` means released.
    pub lock_until: Option<DateTime<Utc>>,
    /// Change token assigned by the store; bumped on every write.
    pub version: u64,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Create a fresh record in `Running` status with no lease.
    pub fn new(
        id: impl Into<String>,
        workflow_type: impl Into<String>,
        state: WorkflowState,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            workflow_type: workflow_type.into(),
            state,
            status: WorkflowStatus::Running,
            lock_until: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if some writer holds the record at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        lease::is_held(self.lock_until, now)
    }

    /// Move to `next`, rejecting transitions out of terminal states.
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
