//! Test doubles shared by the runtime's unit tests.

use crate::scheduler::{DeferredScheduler, SchedulerError};
use async_trait::async_trait;
use bytes::Bytes;
use durable_core::{
    Advance, AdvanceError, AdvanceInput, CaseSpec, Interpreter, Position, TimerHandle, WaitSpec,
    WorkflowState, WorkflowStatus,
};
use serde_json::{Value, json};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub resumes: Vec<String>,
    /// `(instance, case, handle)` per armed timer.
    pub timers: Vec<(String, String, TimerHandle)>,
    pub cancelled: Vec<TimerHandle>,
}

/// Scheduler that records every request and never delivers anything.
#[derive(Default)]
pub struct RecordingScheduler {
    recorded: Mutex<Recorded>,
    next_handle: AtomicU64,
    fail_timers: AtomicBool,
    fail_resumes: AtomicBool,
    fail_cancels: AtomicBool,
}

impl RecordingScheduler {
    pub fn recorded(&self) -> Recorded {
        self.recorded.lock().unwrap().clone()
    }

    pub fn fail_timers(&self, fail: bool) {
        self.fail_timers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_resumes(&self, fail: bool) {
        self.fail_resumes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cancels(&self, fail: bool) {
        self.fail_cancels.store(fail, Ordering::SeqCst);
    }

    /// Handle of the most recently armed timer for `case`.
    pub fn last_timer(&self, case: &str) -> Option<TimerHandle> {
        self.recorded()
            .timers
            .iter()
            .rev()
            .find(|(_, c, _)| c == case)
            .map(|(_, _, handle)| handle.clone())
    }
}

#[async_trait]
impl DeferredScheduler for RecordingScheduler {
    async fn schedule_resume(&self, id: &str, _delay: Duration) -> Result<(), SchedulerError> {
        if self.fail_resumes.load(Ordering::SeqCst) {
            return Err(SchedulerError::Unavailable("queue is down".into()));
        }
        self.recorded.lock().unwrap().resumes.push(id.to_string());
        Ok(())
    }

    async fn schedule_timer(
        &self,
        id: &str,
        case_name: &str,
        _delay: Duration,
        _setup_data: Value,
    ) -> Result<TimerHandle, SchedulerError> {
        if self.fail_timers.load(Ordering::SeqCst) {
            return Err(SchedulerError::Unavailable("queue is down".into()));
        }
        let n = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = TimerHandle::new(format!("t-{}", n));
        self.recorded.lock().unwrap().timers.push((
            id.to_string(),
            case_name.to_string(),
            handle.clone(),
        ));
        Ok(handle)
    }

    async fn cancel_timer(&self, handle: &TimerHandle) -> Result<(), SchedulerError> {
        if self.fail_cancels.load(Ordering::SeqCst) {
            return Err(SchedulerError::Unavailable("queue is down".into()));
        }
        self.recorded.lock().unwrap().cancelled.push(handle.clone());
        Ok(())
    }
}

/// A one-step approval workflow.
///
/// On its first resume thread `main` parks at `approval` with the events
/// `Approve`, `Ping`, `Reject` and `Flaky` plus the timer `Expire`.
/// `Approve` and `Expire` finish the instance, `Ping` counts and re-enters the
/// same wait point, `Reject` is a business failure and `Flaky` a transient one.
/// A `Ping` payload that is not an object, or that tries to set the count, is
/// rejected.
pub struct ApprovalInterpreter;

impl ApprovalInterpreter {
    fn parked(data: Value) -> Advance {
        Advance::new(
            Bytes::from(data.to_string()),
            Position::Sequence { index: 1 },
            WorkflowStatus::Waiting,
        )
        .arm(WaitSpec::new(
            "main",
            "approval",
            vec![
                CaseSpec::event("Approve"),
                CaseSpec::event("Ping"),
                CaseSpec::event("Reject"),
                CaseSpec::event("Flaky"),
                CaseSpec::timer("Expire", Duration::from_secs(60)),
            ],
        ))
    }

    fn finished(mut data: Value, outcome: &str) -> Advance {
        data["outcome"] = json!(outcome);
        Advance::new(
            Bytes::from(data.to_string()),
            Position::Sequence { index: 2 },
            WorkflowStatus::Finished,
        )
        .with_output(json!({ "outcome": outcome }))
    }
}

impl Interpreter for ApprovalInterpreter {
    fn advance(&self, state: &WorkflowState, input: AdvanceInput) -> Result<Advance, AdvanceError> {
        let data: Value = if state.data.is_empty() {
            json!({ "pings": 0 })
        } else {
            serde_json::from_slice(&state.data)
                .map_err(|e| AdvanceError::Transient(e.into()))?
        };

        match input {
            AdvanceInput::Resume => Ok(Self::parked(data)),
            AdvanceInput::Event { case, payload, .. } => match case.as_str() {
                "Approve" => Ok(Self::finished(data, "approved").resolve("Approve")),
                "Ping" if !payload.is_object() || payload.get("pings").is_some() => Err(
                    AdvanceError::Rejected("ping payload must be an object without 'pings'".into()),
                ),
                "Ping" => {
                    let mut data = data;
                    let pings = data["pings"].as_u64().unwrap_or_default() + 1;
                    data["pings"] = json!(pings);
                    Ok(Self::parked(data)
                        .resolve("Ping")
                        .with_output(json!({ "pings": pings })))
                }
                "Reject" => Err(AdvanceError::Business("order rejected".into())),
                _ => Err(AdvanceError::Transient(anyhow::anyhow!("backend down"))),
            },
            AdvanceInput::Timer { case, .. } => Ok(Self::finished(data, "expired").resolve(case)),
        }
    }
}

/// Counts resumes and finishes after `target` of them, yielding in between.
pub struct CounterInterpreter {
    pub target: u64,
}

impl Interpreter for CounterInterpreter {
    fn advance(&self, state: &WorkflowState, _input: AdvanceInput) -> Result<Advance, AdvanceError> {
        let count: u64 = std::str::from_utf8(&state.data)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_default()
            + 1;
        let status = if count < self.target {
            WorkflowStatus::Running
        } else {
            WorkflowStatus::Finished
        };
        Ok(Advance::new(
            Bytes::from(count.to_string()),
            Position::Sequence {
                index: count as usize,
            },
            status,
        ))
    }
}
