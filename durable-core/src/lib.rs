//! Data model for durable workflow instances.
//!
//! A workflow instance is persisted as a single [`WorkflowRecord`]. The record
//! carries an opaque, interpreter-owned business payload alongside the control
//! data this crate understands: the explicit [`Position`] the interpreter
//! resumes from and the [`WaitRegistry`] of cases armed at each wait point.
//!
//! Nothing in this crate performs I/O. Storage lives in `durable-persistence`,
//! scheduling and dispatch in `durable-runtime`.

pub mod codec;
pub mod error;
pub mod interpreter;
pub mod lease;
pub mod record;
pub mod state;

pub use error::CoreError;
pub use interpreter::{Advance, AdvanceError, AdvanceInput, CaseSpec, Interpreter, WaitSpec};
pub use lease::Lease;
pub use record::{WorkflowRecord, WorkflowStatus};
pub use state::{ArmedCase, ArmedWait, CaseKind, Position, TimerHandle, WaitRegistry, WorkflowState};
