//! Scheduling, checkpointing and dispatch for durable workflows.
//!
//! # Architecture
//!
//! - **CallbackDispatcher**: entry point for resume, event and timer
//!   deliveries. Runs each one as a locked critical section around a single
//!   interpreter advance.
//! - **CheckpointWriter**: commits the result of an advance and issues the
//!   scheduling requests it implies.
//! - **DeferredScheduler**: "deliver this later" contract. [`LocalScheduler`]
//!   implements it with tokio timers.
//! - **DeliveryPump**: moves due deliveries into the dispatcher, either
//!   directly or over HTTP with [`HttpSink`].
//!
//! Deliveries are at-least-once. Duplicates and superseded timers are
//! recognised by the dispatcher and ignored.

mod checkpoint;
mod delivery;
mod dispatcher;
mod registry;
mod scheduler;
pub mod serialization;

#[cfg(test)]
mod testing;

// Re-exports
pub use checkpoint::{Checkpoint, CheckpointReport, CheckpointWriter};
pub use delivery::{DeliveryError, DeliveryPump, DeliverySink, HttpSink, deliver_with_retry};
pub use dispatcher::{CallbackDispatcher, DispatchError, DispatchOutcome};
pub use registry::InterpreterRegistry;
pub use scheduler::{
    DeferredScheduler, Delivery, LocalScheduler, ResumeDelivery, SchedulerError, TimerDelivery,
};

pub use durable_persistence as persistence;
