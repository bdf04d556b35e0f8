//! Lease-based locking on workflow records.
//!
//! A lock is a conditional write of `lock_until` keyed on the version just
//! read. Whoever wins the write holds the record until it checkpoints,
//! unlocks, or the lease runs out. A crashed holder never blocks an instance
//! for longer than one lease.

use crate::store::{RecordStore, StoreError};
use chrono::Utc;
use durable_core::{CoreError, Lease, WorkflowRecord, WorkflowState, WorkflowStatus};
use std::sync::Arc;
use std::time::Duration;

/// Lock behavior tuning knobs.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a lock protects the record without being released.
    pub lease: Duration,
    /// How many read-check-write cycles to try before giving up.
    pub max_attempts: u32,
    /// Backoff grows by this much after each contended attempt.
    pub backoff_step: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(60),
            max_attempts: 50,
            backoff_step: Duration::from_millis(100),
        }
    }
}

/// Error type for lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// No record exists for the ID.
    #[error("Workflow not found: {0}")]
    NotFound(String),
    /// Still contended after every attempt. Transient.
    #[error("Workflow '{id}' is still locked after {attempts} attempts")]
    Timeout { id: String, attempts: u32 },
    /// The lease expired and another writer reclaimed the record.
    #[error("Lease on '{0}' was lost before the checkpoint was written")]
    LeaseLost(String),
    /// The checkpoint asked for a status change the lifecycle forbids.
    #[error(transparent)]
    Transition(#[from] CoreError),
    /// The store failed.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LockError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => LockError::NotFound(id),
            other => LockError::Store(other),
        }
    }
}

/// A record held under a lease by the current operation.
///
/// Hand it back to [`LockManager::checkpoint_and_unlock`] or
/// [`LockManager::unlock`] on every exit path.
#[derive(Debug)]
pub struct LockedRecord {
    record: WorkflowRecord,
}

impl LockedRecord {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// The record as read under the lock.
    pub fn record(&self) -> &WorkflowRecord {
        &self.record
    }
}

/// Acquires and releases leases on records of a [`RecordStore`].
pub struct LockManager<S> {
    store: Arc<S>,
    config: LockConfig,
}

impl<S> LockManager<S>
where
    S: RecordStore,
{
    pub fn new(store: Arc<S>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Lock a record and return it as read under the lock.
    ///
    /// Waits with growing backoff while another holder's lease is live and
    /// retries the whole cycle when the conditional write loses a race.
    ///
    /// # Errors
    ///
    /// `LockError::Timeout` once `max_attempts` is exhausted (transient),
    /// `LockError::NotFound` if the record does not exist.
    pub async fn lock_and_read(&self, id: &str) -> Result<LockedRecord, LockError> {
        for attempt in 1..=self.config.max_attempts {
            let record = self.store.get(id).await?;
            let now = Utc::now();

            if record.is_locked_at(now) {
                tracing::debug!(
                    instance_id = %id,
                    attempt,
                    "Workflow is locked, waiting and trying again"
                );
                tokio::time::sleep(self.config.backoff_step * attempt).await;
                continue;
            }

            let lease = Lease::starting_at(now, self.config.lease);
            let mut claimed = record.clone();
            claimed.lock_until = Some(lease.expires_at);

            match self.store.update(&claimed, record.version).await {
                Ok(stored) => {
                    tracing::trace!(instance_id = %id, version = stored.version, "Lock acquired");
                    return Ok(LockedRecord { record: stored });
                }
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::debug!(
                        instance_id = %id,
                        attempt,
                        "Workflow was locked concurrently, trying again"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(
            instance_id = %id,
            attempts = self.config.max_attempts,
            "Gave up waiting for workflow lock"
        );
        Err(LockError::Timeout {
            id: id.to_string(),
            attempts: self.config.max_attempts,
        })
    }

    /// Persist a new state and status and release the lock in one write.
    ///
    /// The write is keyed on the version observed when locking, so it only
    /// succeeds while our lease has not been reclaimed.
    ///
    /// # Errors
    ///
    /// `LockError::LeaseLost` if another writer took over the record; the
    /// record is left alone in that case. On any other failure the lock is
    /// still released before the error is returned.
    pub async fn checkpoint_and_unlock(
        &self,
        locked: LockedRecord,
        state: WorkflowState,
        status: WorkflowStatus,
    ) -> Result<WorkflowRecord, LockError> {
        let LockedRecord { mut record } = locked;
        let expected_version = record.version;

        if let Err(e) = record.transition(status) {
            self.release_after_failure(&record.id).await;
            return Err(e.into());
        }
        record.state = state;
        record.lock_until = None;

        match self.store.update(&record, expected_version).await {
            Ok(stored) => Ok(stored),
            Err(StoreError::VersionConflict { id, .. }) => {
                tracing::error!(instance_id = %id, "Lease lost before checkpoint");
                Err(LockError::LeaseLost(id))
            }
            Err(e) => {
                self.release_after_failure(&record.id).await;
                Err(e.into())
            }
        }
    }

    /// Release the lock without writing anything else.
    ///
    /// # Errors
    ///
    /// Returns the store error if the release could not be written. The
    /// lease still expires on its own in that case.
    pub async fn unlock(&self, locked: LockedRecord) -> Result<(), LockError> {
        self.store.release_lock(locked.id()).await?;
        Ok(())
    }

    async fn release_after_failure(&self, id: &str) {
        if let Err(e) = self.store.release_lock(id).await {
            tracing::warn!(
                instance_id = %id,
                error = %e,
                "Failed to release lock, it will expire with its lease"
            );
        }
    }
}
