//! In-memory implementation of RecordStore.
//!
//! This is a simple implementation that stores records in a HashMap.
//! Useful for testing, local runs, and as a reference implementation.

use crate::store::{RecordStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use durable_core::WorkflowRecord;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// In-memory store that keeps records in a HashMap.
///
/// This implementation is thread-safe and clones share the same map.
/// For production use, implement [`RecordStore`] for a durable backend.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<RwLock<HashMap<String, WorkflowRecord>>>,
}

impl InMemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_error<E: std::fmt::Display>(e: E) -> StoreError {
        StoreError::Backend(format!("Lock error: {}", e))
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn create(&self, mut record: WorkflowRecord) -> Result<WorkflowRecord, StoreError> {
        let mut records = self.records.write().map_err(Self::lock_error)?;
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        let now = Utc::now();
        record.version = 1;
        record.created_at = now;
        record.updated_at = now;
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<WorkflowRecord, StoreError> {
        let records = self.records.read().map_err(Self::lock_error)?;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update(
        &self,
        record: &WorkflowRecord,
        expected_version: u64,
    ) -> Result<WorkflowRecord, StoreError> {
        let mut records = self.records.write().map_err(Self::lock_error)?;
        let stored = records
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;

        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: record.id.clone(),
                expected: expected_version,
                found: stored.version,
            });
        }

        let mut next = record.clone();
        next.version = stored.version + 1;
        next.created_at = stored.created_at;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn release_lock(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(Self::lock_error)?;
        let stored = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        stored.lock_until = None;
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(())
    }
}
