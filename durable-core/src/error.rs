//! Error types for durable-core.

use crate::record::WorkflowStatus;

/// Errors raised while manipulating records in memory.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A status change that the lifecycle does not allow.
    #[error("Invalid status transition for '{id}': {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    /// A wait point was armed with two cases of the same name.
    #[error("Duplicate case '{case}' in wait point '{wait}'")]
    DuplicateCase { wait: String, case: String },
}
