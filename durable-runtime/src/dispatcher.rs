//! Callback dispatcher.
//!
//! Every external delivery (resume, event, timer) enters here. Each one runs
//! the same critical section against a single record:
//!
//! lock and read, match the delivery against the wait registry, advance the
//! interpreter, commit the checkpoint, which releases the lock.
//!
//! Deliveries that no longer match anything are no-ops: the lock is released
//! and nothing else is written. Every exit path releases the lock.

use crate::checkpoint::{Checkpoint, CheckpointReport, CheckpointWriter};
use crate::delivery::{DeliveryError, DeliverySink};
use crate::registry::InterpreterRegistry;
use crate::scheduler::{DeferredScheduler, Delivery, TimerDelivery};
use async_trait::async_trait;
use bytes::Bytes;
use durable_core::{
    AdvanceError, AdvanceInput, CaseKind, CoreError, Interpreter, WorkflowRecord, WorkflowState,
    WorkflowStatus,
};
use durable_persistence::{LockError, LockManager, LockedRecord, RecordStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Error type for dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Workflow not found: {0}")]
    NotFound(String),
    #[error("Workflow already exists: {0}")]
    AlreadyExists(String),
    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(String),
    /// The lock stayed contended for every attempt.
    #[error("Workflow '{id}' is busy, gave up after {attempts} lock attempts")]
    Contention { id: String, attempts: u32 },
    #[error("Lease on '{0}' expired before the checkpoint was written")]
    LeaseLost(String),
    /// The case is not armed at any wait point of the instance.
    #[error("Event '{case}' is not expected by workflow '{id}'")]
    InvalidEvent { id: String, case: String },
    /// The interpreter refused the delivery's input. Nothing was written.
    #[error("Workflow '{id}' rejected the input: {reason}")]
    Rejected { id: String, reason: String },
    /// The interpreter reported a business failure; the instance is now `Failed`.
    #[error("Workflow '{id}' failed: {reason}")]
    WorkflowFailed { id: String, reason: String },
    #[error("Interpreter error: {0}")]
    Interpreter(#[source] anyhow::Error),
    /// The checkpoint is durable but some deliveries could not be scheduled.
    /// Carries the outcome that was applied.
    #[error(
        "Workflow '{}' was checkpointed but scheduling failed: {}",
        .0.id,
        .0.scheduling_failures.join("; ")
    )]
    Scheduling(Box<DispatchOutcome>),
    #[error("Invalid lifecycle transition: {0}")]
    Lifecycle(CoreError),
    #[error("Storage error: {0}")]
    Storage(StoreError),
}

impl DispatchError {
    /// Whether redelivering the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::Contention { .. }
                | DispatchError::LeaseLost(_)
                | DispatchError::Interpreter(_)
                | DispatchError::Storage(_)
        )
    }
}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => DispatchError::NotFound(id),
            StoreError::AlreadyExists(id) => DispatchError::AlreadyExists(id),
            other => DispatchError::Storage(other),
        }
    }
}

impl From<LockError> for DispatchError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::NotFound(id) => DispatchError::NotFound(id),
            LockError::Timeout { id, attempts } => DispatchError::Contention { id, attempts },
            LockError::LeaseLost(id) => DispatchError::LeaseLost(id),
            LockError::Transition(e) => DispatchError::Lifecycle(e),
            LockError::Store(e) => e.into(),
        }
    }
}

/// Result of one dispatched delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub id: String,
    pub status: WorkflowStatus,
    /// Result of the resolved case, if it produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// The delivery no longer matched anything and changed nothing.
    pub stale: bool,
    /// Scheduling requests of the checkpoint that failed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scheduling_failures: Vec<String>,
}

impl DispatchOutcome {
    fn applied(record: &WorkflowRecord) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status,
            output: record.state.output.clone(),
            stale: false,
            scheduling_failures: Vec::new(),
        }
    }

    fn stale(record: &WorkflowRecord) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status,
            output: None,
            stale: true,
            scheduling_failures: Vec::new(),
        }
    }
}

/// What a delivery asks of the instance once the record is locked.
enum Matched {
    Advance(AdvanceInput),
    /// Rewrite the record as is, arming timers that are missing a handle.
    Repair,
    Stale,
}

/// Entry point for every delivery against workflow instances.
///
/// # Example
///
/// ```rust,ignore
/// let store = Arc::new(InMemoryStore::new());
/// let locks = Arc::new(LockManager::new(store, LockConfig::default()));
/// let (scheduler, deliveries) = LocalScheduler::new();
/// let dispatcher = Arc::new(CallbackDispatcher::new(
///     locks,
///     Arc::new(scheduler),
///     InterpreterRegistry::new().register("order", OrderInterpreter::default()),
///     Duration::from_millis(100),
/// ));
///
/// tokio::spawn(DeliveryPump::new(Arc::clone(&dispatcher), 10, Duration::from_secs(1)).run(deliveries));
/// dispatcher.start("order-1", "order", Bytes::new()).await?;
/// dispatcher.on_event("order-1", "AddToCart", json!({"name": "Margherita", "qty": 1})).await?;
/// ```
pub struct CallbackDispatcher<S> {
    locks: Arc<LockManager<S>>,
    writer: CheckpointWriter<S>,
    interpreters: InterpreterRegistry,
}

impl<S> CallbackDispatcher<S>
where
    S: RecordStore + 'static,
{
    pub fn new(
        locks: Arc<LockManager<S>>,
        scheduler: Arc<dyn DeferredScheduler>,
        interpreters: InterpreterRegistry,
        resume_delay: Duration,
    ) -> Self {
        let writer = CheckpointWriter::new(Arc::clone(&locks), scheduler, resume_delay);
        Self {
            locks,
            writer,
            interpreters,
        }
    }

    fn interpreter(&self, workflow_type: &str) -> Result<Arc<dyn Interpreter>, DispatchError> {
        self.interpreters
            .get(workflow_type)
            .ok_or_else(|| DispatchError::UnknownWorkflowType(workflow_type.to_string()))
    }

    /// Create a new instance in `Running` with no lock.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the ID is taken, `UnknownWorkflowType` if no
    /// interpreter is registered for `workflow_type`.
    pub async fn create(
        &self,
        id: &str,
        workflow_type: &str,
        data: Bytes,
    ) -> Result<WorkflowRecord, DispatchError> {
        let interpreter = self.interpreter(workflow_type)?;
        let state = WorkflowState::new(data, interpreter.initial_position());
        let record = self
            .locks
            .store()
            .create(WorkflowRecord::new(id, workflow_type, state))
            .await?;
        tracing::info!(instance_id = %id, workflow_type, "Workflow created");
        Ok(record)
    }

    /// Create an instance and drive it to its first wait point.
    pub async fn start(
        &self,
        id: &str,
        workflow_type: &str,
        data: Bytes,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.create(id, workflow_type, data).await?;
        self.on_resume_fired(id).await
    }

    /// Read the current record without locking it.
    pub async fn get(&self, id: &str) -> Result<WorkflowRecord, DispatchError> {
        Ok(self.locks.store().get(id).await?)
    }

    /// Re-drive an instance with no external input.
    ///
    /// Only a `Running` instance is advanced. A `Waiting` instance is
    /// rewritten unchanged if one of its timers is missing a handle, so a
    /// manual resume re-arms it. Anything else is a no-op.
    pub async fn on_resume_fired(&self, id: &str) -> Result<DispatchOutcome, DispatchError> {
        tracing::debug!(instance_id = %id, "Resume delivered");
        self.dispatch(id, |record| match record.status {
            WorkflowStatus::Running => Ok(Matched::Advance(AdvanceInput::Resume)),
            WorkflowStatus::Waiting
                if record
                    .state
                    .waits
                    .iter()
                    .any(|(_, wait)| wait.unarmed_timers().next().is_some()) =>
            {
                Ok(Matched::Repair)
            }
            _ => Ok(Matched::Stale),
        })
        .await
    }

    /// Deliver an external event for `case`.
    ///
    /// # Errors
    ///
    /// `InvalidEvent` if no wait point of the instance has `case` armed as an
    /// event. The record is left untouched.
    pub async fn on_event(
        &self,
        id: &str,
        case: &str,
        payload: serde_json::Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        tracing::debug!(instance_id = %id, case, "Event delivered");
        self.dispatch(id, |record| {
            match record.state.waits.find_case(case) {
                Some((thread, armed)) if armed.kind == CaseKind::Event => {
                    Ok(Matched::Advance(AdvanceInput::Event {
                        thread: thread.to_string(),
                        case: case.to_string(),
                        payload: payload.clone(),
                    }))
                }
                _ => Err(DispatchError::InvalidEvent {
                    id: id.to_string(),
                    case: case.to_string(),
                }),
            }
        })
        .await
    }

    /// Deliver a timer firing.
    ///
    /// Stale deliveries are not errors: the case may have resolved another
    /// way, the instance may have finished, or the wait point may have been
    /// re-entered with a newer timer.
    pub async fn on_timer_fired(
        &self,
        delivery: &TimerDelivery,
    ) -> Result<DispatchOutcome, DispatchError> {
        let case = delivery.case_name.as_str();
        tracing::debug!(instance_id = %delivery.id, case, "Timer delivered");
        self.dispatch(&delivery.id, |record| {
            let Some((thread, armed)) = record.state.waits.find_case(case) else {
                return Ok(Matched::Stale);
            };
            if armed.kind != CaseKind::Timer {
                return Ok(Matched::Stale);
            }
            // A delivery that names its timer must name the armed one. An
            // armed case without a handle failed to re-arm, so any handle
            // delivered for it belongs to an earlier wait point.
            if let Some(delivered) = &delivery.handle
                && armed.timer.as_ref() != Some(delivered)
            {
                tracing::debug!(
                    instance_id = %record.id,
                    case,
                    current = ?armed.timer,
                    delivered = %delivered,
                    "Superseded timer"
                );
                return Ok(Matched::Stale);
            }
            Ok(Matched::Advance(AdvanceInput::Timer {
                thread: thread.to_string(),
                case: case.to_string(),
            }))
        })
        .await
    }

    async fn dispatch<F>(&self, id: &str, matcher: F) -> Result<DispatchOutcome, DispatchError>
    where
        F: FnOnce(&WorkflowRecord) -> Result<Matched, DispatchError>,
    {
        let locked = self.locks.lock_and_read(id).await?;

        let input = match matcher(locked.record()) {
            Ok(Matched::Advance(input)) => input,
            Ok(Matched::Repair) => {
                let checkpoint = Checkpoint::unchanged(locked.record());
                let report = self.writer.commit(locked, checkpoint).await?;
                return self.finish(report);
            }
            Ok(Matched::Stale) => {
                tracing::debug!(instance_id = %id, "Stale delivery, nothing to do");
                let outcome = DispatchOutcome::stale(locked.record());
                self.release(locked).await;
                return Ok(outcome);
            }
            Err(e) => {
                self.release(locked).await;
                return Err(e);
            }
        };

        let interpreter = match self.interpreter(&locked.record().workflow_type) {
            Ok(interpreter) => interpreter,
            Err(e) => {
                self.release(locked).await;
                return Err(e);
            }
        };

        let current = &locked.record().state;
        let checkpoint = match interpreter.advance(current, input.clone()) {
            Ok(advance) => match Checkpoint::plan(current, &input, advance) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    return self
                        .fail(locked, AdvanceError::Business(e.to_string()))
                        .await;
                }
            },
            Err(AdvanceError::Transient(e)) => {
                tracing::warn!(instance_id = %id, error = %e, "Transient interpreter error");
                self.release(locked).await;
                return Err(DispatchError::Interpreter(e));
            }
            Err(AdvanceError::Rejected(reason)) => {
                tracing::debug!(instance_id = %id, %reason, "Input rejected");
                self.release(locked).await;
                return Err(DispatchError::Rejected {
                    id: id.to_string(),
                    reason,
                });
            }
            Err(business) => return self.fail(locked, business).await,
        };

        let report = self.writer.commit(locked, checkpoint).await?;
        self.finish(report)
    }

    /// Persist the instance as `Failed` and report the failure.
    async fn fail(
        &self,
        locked: LockedRecord,
        error: AdvanceError,
    ) -> Result<DispatchOutcome, DispatchError> {
        let id = locked.id().to_string();
        let reason = match error {
            AdvanceError::Business(reason) | AdvanceError::Rejected(reason) => reason,
            AdvanceError::Transient(e) => e.to_string(),
        };
        tracing::error!(instance_id = %id, %reason, "Workflow failed");

        let checkpoint = Checkpoint::failed(&locked.record().state);
        self.writer.commit(locked, checkpoint).await?;
        Err(DispatchError::WorkflowFailed { id, reason })
    }

    fn finish(
        &self,
        report: CheckpointReport,
    ) -> Result<DispatchOutcome, DispatchError> {
        if !report.is_clean() {
            let mut outcome = DispatchOutcome::applied(&report.record);
            outcome.scheduling_failures = report.failures;
            return Err(DispatchError::Scheduling(Box::new(outcome)));
        }
        if report.record.status == WorkflowStatus::Waiting && report.record.state.waits.is_empty() {
            tracing::warn!(
                instance_id = %report.record.id,
                "Workflow is waiting with nothing armed"
            );
        }
        Ok(DispatchOutcome::applied(&report.record))
    }

    async fn release(&self, locked: LockedRecord) {
        let id = locked.id().to_string();
        if let Err(e) = self.locks.unlock(locked).await {
            tracing::warn!(
                instance_id = %id,
                error = %e,
                "Failed to release lock, it will expire with its lease"
            );
        }
    }
}

/// Feeds due deliveries straight into the dispatcher.
#[async_trait]
impl<S> DeliverySink for CallbackDispatcher<S>
where
    S: RecordStore + 'static,
{
    async fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        let result = match delivery {
            Delivery::Resume(resume) => self.on_resume_fired(&resume.id).await,
            Delivery::Timer(timer) => self.on_timer_fired(timer).await,
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_transient() => Err(DeliveryError::Retryable(e.to_string())),
            Err(e) => Err(DeliveryError::Permanent(e.to_string())),
        }
    }
}
