//! Record store trait for storing and retrieving workflow records.
//!
//! This trait abstracts the storage mechanism, allowing implementations
//! for various backends (in-memory, document databases, SQL, etc.). The only
//! requirement on the engine is a native optimistic-concurrency token that
//! can be mapped onto [`WorkflowRecord::version`].

use async_trait::async_trait;
use durable_core::WorkflowRecord;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),
    /// A record with this ID already exists.
    #[error("Record already exists: {0}")]
    AlreadyExists(String),
    /// A conditional write observed a different version than expected.
    #[error("Version conflict on '{id}': expected {expected}, found {found}")]
    VersionConflict {
        id: String,
        expected: u64,
        found: u64,
    },
    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Trait for durable storage of workflow records.
///
/// Every write is a single operation against one record, so no partial
/// writes are possible. Implementations bump `version` on each successful
/// write and return the stored record.
///
/// # Example
///
/// ```rust,ignore
/// use durable_persistence::{InMemoryStore, RecordStore};
///
/// let store = InMemoryStore::new();
/// let created = store.create(record).await?;
/// let mut next = created.clone();
/// next.lock_until = Some(lease.expires_at);
/// store.update(&next, created.version).await?;
/// ```
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if a record with the same ID exists.
    async fn create(&self, record: WorkflowRecord) -> Result<WorkflowRecord, StoreError>;

    /// Load a record by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no record exists for the given ID.
    async fn get(&self, id: &str) -> Result<WorkflowRecord, StoreError>;

    /// Replace a record, provided the stored version still equals
    /// `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::VersionConflict` if another writer got there first,
    /// `StoreError::NotFound` if the record is gone.
    async fn update(
        &self,
        record: &WorkflowRecord,
        expected_version: u64,
    ) -> Result<WorkflowRecord, StoreError>;

    /// Unconditionally clear the lease on a record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no record exists for the given ID.
    async fn release_lock(&self, id: &str) -> Result<(), StoreError>;
}
