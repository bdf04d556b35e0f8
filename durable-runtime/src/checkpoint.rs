//! Checkpoint writer.
//!
//! Turns the result of one advance into a [`Checkpoint`] and commits it while
//! the record is locked. The commit runs in a fixed order:
//!
//! 1. Arm every timer case in the new registry that has no handle yet and
//!    store the returned handle with the case.
//! 2. Write state and status and release the lease in one conditional write.
//! 3. Schedule a resume if the instance is runnable.
//! 4. Cancel torn-down timers, best effort.
//! 5. Report anything from steps 1 or 3 that could not be scheduled.
//!
//! Scheduling failures never roll back the write. A timer that fails to arm
//! keeps an empty handle, and the next checkpoint of the instance (a manual
//! resume for example) tries again.

use crate::scheduler::DeferredScheduler;
use durable_core::{
    Advance, AdvanceInput, ArmedWait, CoreError, TimerHandle, WorkflowRecord, WorkflowState,
    WorkflowStatus,
};
use durable_persistence::{LockError, LockManager, LockedRecord, RecordStore};
use futures::future;
use std::sync::Arc;
use std::time::Duration;

/// Everything one critical section writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// State to persist, with the wait registry already updated.
    pub state: WorkflowState,
    pub status: WorkflowStatus,
    /// Timers of cases that are no longer armed.
    pub teardown: Vec<TimerHandle>,
    /// Schedule a resume once the state is durable.
    pub resume: bool,
}

impl Checkpoint {
    /// Build the checkpoint for a successful advance of `current` by `input`.
    ///
    /// # Errors
    ///
    /// `CoreError::DuplicateCase` if the interpreter armed a wait point with
    /// two cases of the same name.
    pub fn plan(
        current: &WorkflowState,
        input: &AdvanceInput,
        advance: Advance,
    ) -> Result<Self, CoreError> {
        let mut waits = current.waits.clone();
        let mut teardown = Vec::new();

        // The input resolved its wait point: its siblings go, except the
        // timer that just fired.
        if advance.resolved.is_some()
            && let Some(thread) = input.thread()
            && let Some(wait) = waits.remove(thread)
        {
            let fired = match input {
                AdvanceInput::Timer { case, .. } => wait.case(case).and_then(|c| c.timer.clone()),
                _ => None,
            };
            teardown.extend(wait.timers().filter(|h| Some(*h) != fired.as_ref()).cloned());
        }

        for thread in &advance.finished_threads {
            if let Some(wait) = waits.remove(thread) {
                teardown.extend(wait.timers().cloned());
            }
        }

        for spec in advance.armed {
            let cases = spec.cases.iter().map(|case| case.to_armed()).collect();
            let wait = ArmedWait::new(spec.wait, cases)?;
            if let Some(replaced) = waits.insert(spec.thread, wait) {
                teardown.extend(replaced.timers().cloned());
            }
        }

        let status = advance.status;
        if status.is_terminal() {
            for (_, wait) in waits.drain() {
                teardown.extend(wait.timers().cloned());
            }
        }

        Ok(Self {
            state: WorkflowState {
                data: advance.data.to_vec(),
                position: advance.position,
                waits,
                output: advance.output,
            },
            status,
            teardown,
            resume: status == WorkflowStatus::Running,
        })
    }

    /// Mark the instance failed and tear down everything it had armed.
    /// Business data and position are kept for inspection.
    pub fn failed(current: &WorkflowState) -> Self {
        let mut state = current.clone();
        let teardown = state
            .waits
            .drain()
            .into_iter()
            .flat_map(|(_, wait)| wait.timers().cloned().collect::<Vec<_>>())
            .collect();
        state.output = None;
        Self {
            state,
            status: WorkflowStatus::Failed,
            teardown,
            resume: false,
        }
    }

    /// Rewrite the current state unchanged. Arms any timer still missing
    /// a handle.
    pub fn unchanged(record: &WorkflowRecord) -> Self {
        Self {
            state: record.state.clone(),
            status: record.status,
            teardown: Vec::new(),
            resume: false,
        }
    }
}

/// What a commit did.
#[derive(Debug)]
pub struct CheckpointReport {
    /// The record as written.
    pub record: WorkflowRecord,
    /// Timers armed during the commit.
    pub armed: usize,
    /// Scheduling requests that failed. The record is durable regardless.
    pub failures: Vec<String>,
}

impl CheckpointReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Commits checkpoints and issues the scheduling requests they imply.
pub struct CheckpointWriter<S> {
    locks: Arc<LockManager<S>>,
    scheduler: Arc<dyn DeferredScheduler>,
    resume_delay: Duration,
}

impl<S> CheckpointWriter<S>
where
    S: RecordStore,
{
    pub fn new(
        locks: Arc<LockManager<S>>,
        scheduler: Arc<dyn DeferredScheduler>,
        resume_delay: Duration,
    ) -> Self {
        Self {
            locks,
            scheduler,
            resume_delay,
        }
    }

    /// Commit `checkpoint` for the record held by `locked`.
    ///
    /// # Errors
    ///
    /// Lock errors from the write itself. Timers armed for a write that did
    /// not happen are cancelled before returning.
    pub async fn commit(
        &self,
        locked: LockedRecord,
        checkpoint: Checkpoint,
    ) -> Result<CheckpointReport, LockError> {
        let id = locked.id().to_string();
        let previous = locked.record().status;
        let Checkpoint {
            mut state,
            status,
            teardown,
            resume,
        } = checkpoint;

        let mut failures = Vec::new();
        let armed = self.arm_timers(&id, &mut state, &mut failures).await;

        let record = match self.locks.checkpoint_and_unlock(locked, state, status).await {
            Ok(record) => record,
            Err(e) => {
                self.cancel_all(&id, &armed).await;
                return Err(e);
            }
        };

        if record.status != previous {
            tracing::info!(
                instance_id = %id,
                from = %previous,
                to = %record.status,
                "Workflow status changed"
            );
        }
        tracing::debug!(
            instance_id = %id,
            version = record.version,
            armed = armed.len(),
            teardown = teardown.len(),
            "Checkpoint written"
        );

        if resume && let Err(e) = self.scheduler.schedule_resume(&id, self.resume_delay).await {
            tracing::error!(instance_id = %id, error = %e, "Failed to schedule resume");
            failures.push(format!("resume: {}", e));
        }

        self.cancel_all(&id, &teardown).await;

        if !failures.is_empty() {
            tracing::error!(
                instance_id = %id,
                failures = ?failures,
                "Checkpoint committed with scheduling failures, resume the instance to re-arm"
            );
        }

        Ok(CheckpointReport {
            record,
            armed: armed.len(),
            failures,
        })
    }

    async fn arm_timers(
        &self,
        id: &str,
        state: &mut WorkflowState,
        failures: &mut Vec<String>,
    ) -> Vec<TimerHandle> {
        let pending: Vec<_> = state
            .waits
            .iter()
            .flat_map(|(thread, wait)| {
                wait.unarmed_timers().map(move |case| {
                    (
                        thread.to_string(),
                        case.name.clone(),
                        Duration::from_millis(case.delay_ms.unwrap_or_default()),
                        case.setup_data.clone(),
                    )
                })
            })
            .collect();

        let mut armed = Vec::with_capacity(pending.len());
        for (thread, case, delay, setup_data) in pending {
            match self
                .scheduler
                .schedule_timer(id, &case, delay, setup_data)
                .await
            {
                Ok(handle) => {
                    if let Some(entry) = state
                        .waits
                        .get_mut(&thread)
                        .and_then(|wait| wait.case_mut(&case))
                    {
                        entry.timer = Some(handle.clone());
                    }
                    armed.push(handle);
                }
                Err(e) => {
                    tracing::error!(instance_id = %id, case = %case, error = %e, "Failed to arm timer");
                    failures.push(format!("timer {}: {}", case, e));
                }
            }
        }
        armed
    }

    async fn cancel_all(&self, id: &str, handles: &[TimerHandle]) {
        let results = future::join_all(handles.iter().map(|h| self.scheduler.cancel_timer(h))).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    instance_id = %id,
                    handle = %handle,
                    error = %e,
                    "Failed to cancel timer, its delivery will be ignored"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingScheduler;
    use bytes::Bytes;
    use durable_core::{ArmedCase, CaseKind, CaseSpec, Position, WaitSpec};
    use durable_persistence::{InMemoryStore, LockConfig};

    fn parked(cases: Vec<(&str, Option<&str>)>) -> WorkflowState {
        let mut state = WorkflowState::new(Bytes::from_static(b"{}"), Position::start());
        let cases = cases
            .into_iter()
            .map(|(name, timer)| ArmedCase {
                name: name.to_string(),
                kind: if timer.is_some() {
                    CaseKind::Timer
                } else {
                    CaseKind::Event
                },
                delay_ms: timer.map(|_| 1_000),
                setup_data: serde_json::Value::Null,
                timer: timer.map(TimerHandle::new),
            })
            .collect();
        state
            .waits
            .insert("main", ArmedWait::new("approval", cases).unwrap());
        state
    }

    fn waiting(position: usize) -> Advance {
        Advance::new(
            Bytes::from_static(b"{}"),
            Position::Sequence { index: position },
            WorkflowStatus::Waiting,
        )
    }

    #[test]
    fn test_event_tears_down_sibling_timers() {
        let state = parked(vec![("Approve", None), ("Expire", Some("t-1"))]);
        let input = AdvanceInput::Event {
            thread: "main".into(),
            case: "Approve".into(),
            payload: serde_json::Value::Null,
        };
        let advance = Advance::new(
            Bytes::from_static(b"{}"),
            Position::Sequence { index: 1 },
            WorkflowStatus::Finished,
        )
        .resolve("Approve");

        let checkpoint = Checkpoint::plan(&state, &input, advance).unwrap();
        assert_eq!(checkpoint.teardown, vec![TimerHandle::new("t-1")]);
        assert!(checkpoint.state.waits.is_empty());
        assert!(!checkpoint.resume);
    }

    #[test]
    fn test_fired_timer_is_not_cancelled() {
        let state = parked(vec![("Expire", Some("t-1")), ("Reminder", Some("t-2"))]);
        let input = AdvanceInput::Timer {
            thread: "main".into(),
            case: "Expire".into(),
        };
        let checkpoint = Checkpoint::plan(&state, &input, waiting(2).resolve("Expire")).unwrap();
        assert_eq!(checkpoint.teardown, vec![TimerHandle::new("t-2")]);
    }

    #[test]
    fn test_unresolved_event_keeps_wait_armed() {
        let state = parked(vec![("Approve", None), ("Expire", Some("t-1"))]);
        let input = AdvanceInput::Event {
            thread: "main".into(),
            case: "Approve".into(),
            payload: serde_json::Value::Null,
        };
        let checkpoint = Checkpoint::plan(&state, &input, waiting(0)).unwrap();
        assert!(checkpoint.teardown.is_empty());
        assert_eq!(checkpoint.state.waits, state.waits);
    }

    #[test]
    fn test_running_schedules_resume() {
        let state = WorkflowState::new(Bytes::new(), Position::start());
        let advance = Advance::new(
            Bytes::from_static(b"1"),
            Position::Sequence { index: 1 },
            WorkflowStatus::Running,
        );
        let checkpoint = Checkpoint::plan(&state, &AdvanceInput::Resume, advance).unwrap();
        assert!(checkpoint.resume);
        assert_eq!(checkpoint.state.data, b"1".to_vec());
    }

    #[test]
    fn test_duplicate_case_is_rejected() {
        let state = WorkflowState::new(Bytes::new(), Position::start());
        let advance = waiting(0).arm(WaitSpec::new(
            "main",
            "input",
            vec![CaseSpec::event("Add"), CaseSpec::event("Add")],
        ));
        let result = Checkpoint::plan(&state, &AdvanceInput::Resume, advance);
        assert!(matches!(result, Err(CoreError::DuplicateCase { .. })));
    }

    #[test]
    fn test_failed_tears_down_everything() {
        let state = parked(vec![("Approve", None), ("Expire", Some("t-1"))]);
        let checkpoint = Checkpoint::failed(&state);
        assert_eq!(checkpoint.status, WorkflowStatus::Failed);
        assert_eq!(checkpoint.teardown, vec![TimerHandle::new("t-1")]);
        assert!(checkpoint.state.waits.is_empty());
    }

    async fn writer(
        scheduler: Arc<RecordingScheduler>,
    ) -> (CheckpointWriter<InMemoryStore>, Arc<LockManager<InMemoryStore>>) {
        let store = Arc::new(InMemoryStore::new());
        store
            .create(WorkflowRecord::new(
                "wf-1",
                "approval",
                WorkflowState::new(Bytes::new(), Position::start()),
            ))
            .await
            .unwrap();
        let locks = Arc::new(LockManager::new(store, LockConfig::default()));
        let writer = CheckpointWriter::new(Arc::clone(&locks), scheduler, Duration::from_millis(1));
        (writer, locks)
    }

    fn arm_expire() -> Advance {
        waiting(1).arm(WaitSpec::new(
            "main",
            "approval",
            vec![
                CaseSpec::event("Approve"),
                CaseSpec::timer("Expire", Duration::from_secs(5)),
            ],
        ))
    }

    #[tokio::test]
    async fn test_commit_stores_timer_handles() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let (writer, locks) = writer(Arc::clone(&scheduler)).await;

        let locked = locks.lock_and_read("wf-1").await.unwrap();
        let checkpoint =
            Checkpoint::plan(&locked.record().state, &AdvanceInput::Resume, arm_expire()).unwrap();
        let report = writer.commit(locked, checkpoint).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.armed, 1);
        assert_eq!(report.record.status, WorkflowStatus::Waiting);
        assert_eq!(report.record.lock_until, None);

        let recorded = scheduler.recorded();
        assert_eq!(recorded.timers.len(), 1);
        let (_, case, handle) = &recorded.timers[0];
        assert_eq!(case, "Expire");
        let stored = report.record.state.waits.get("main").unwrap();
        assert_eq!(stored.case("Expire").unwrap().timer.as_ref(), Some(handle));
        assert!(recorded.resumes.is_empty());
    }

    #[tokio::test]
    async fn test_arming_failure_still_commits() {
        let scheduler = Arc::new(RecordingScheduler::default());
        scheduler.fail_timers(true);
        let (writer, locks) = writer(Arc::clone(&scheduler)).await;

        let locked = locks.lock_and_read("wf-1").await.unwrap();
        let checkpoint =
            Checkpoint::plan(&locked.record().state, &AdvanceInput::Resume, arm_expire()).unwrap();
        let report = writer.commit(locked, checkpoint).await.unwrap();

        assert!(!report.is_clean());
        assert_eq!(report.record.status, WorkflowStatus::Waiting);
        let stored = report.record.state.waits.get("main").unwrap();
        assert_eq!(stored.case("Expire").unwrap().timer, None);

        // Once the scheduler recovers, rewriting the record arms the timer.
        scheduler.fail_timers(false);
        let locked = locks.lock_and_read("wf-1").await.unwrap();
        let checkpoint = Checkpoint::unchanged(locked.record());
        let report = writer.commit(locked, checkpoint).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.armed, 1);
        let stored = report.record.state.waits.get("main").unwrap();
        assert!(stored.case("Expire").unwrap().timer.is_some());
    }

    #[tokio::test]
    async fn test_resume_failure_is_reported() {
        let scheduler = Arc::new(RecordingScheduler::default());
        scheduler.fail_resumes(true);
        let (writer, locks) = writer(Arc::clone(&scheduler)).await;

        let locked = locks.lock_and_read("wf-1").await.unwrap();
        let advance = Advance::new(
            Bytes::from_static(b"1"),
            Position::Sequence { index: 1 },
            WorkflowStatus::Running,
        );
        let checkpoint =
            Checkpoint::plan(&locked.record().state, &AdvanceInput::Resume, advance).unwrap();
        let report = writer.commit(locked, checkpoint).await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.record.state.data, b"1".to_vec());
    }

    #[tokio::test]
    async fn test_lost_lease_cancels_new_timers() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let store = Arc::new(InMemoryStore::new());
        store
            .create(WorkflowRecord::new(
                "wf-1",
                "approval",
                WorkflowState::new(Bytes::new(), Position::start()),
            ))
            .await
            .unwrap();
        let locks = Arc::new(LockManager::new(
            store,
            LockConfig {
                lease: Duration::ZERO,
                ..LockConfig::default()
            },
        ));
        let writer = CheckpointWriter::new(
            Arc::clone(&locks),
            Arc::clone(&scheduler) as Arc<dyn DeferredScheduler>,
            Duration::from_millis(1),
        );

        let first = locks.lock_and_read("wf-1").await.unwrap();
        let _second = locks.lock_and_read("wf-1").await.unwrap();
        let checkpoint =
            Checkpoint::plan(&first.record().state, &AdvanceInput::Resume, arm_expire()).unwrap();

        let result = writer.commit(first, checkpoint).await;
        assert!(matches!(result, Err(LockError::LeaseLost(_))));

        let recorded = scheduler.recorded();
        assert_eq!(recorded.cancelled.len(), 1);
        assert_eq!(recorded.cancelled[0], recorded.timers[0].2);
    }
}
