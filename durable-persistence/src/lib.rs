//! Persistence layer for durable workflow instances.
//!
//! This crate provides the storage contract for workflow records and the
//! lease-based lock built on top of it.
//!
//! # Architecture
//!
//! - **RecordStore**: A trait that abstracts versioned storage of one
//!   record per instance, with conditional (optimistic) updates.
//! - **InMemoryStore**: A reference implementation using an in-memory HashMap.
//! - **LockManager**: Acquires a time-bounded lease on a record with a
//!   conditional write, checkpoints and releases it, and reclaims leases left
//!   behind by crashed holders.
//!
//! # Example
//!
//! ```rust,ignore
//! use durable_persistence::{InMemoryStore, LockConfig, LockManager, RecordStore};
//!
//! let store = Arc::new(InMemoryStore::new());
//! store.create(record).await?;
//!
//! let locks = LockManager::new(store, LockConfig::default());
//! let locked = locks.lock_and_read("order-1").await?;
//! let next = advance(locked.record());
//! locks.checkpoint_and_unlock(locked, next.state, next.status).await?;
//! ```
//!
//! # Implementing Custom Stores
//!
//! 1. Add `durable-persistence` as a dependency
//! 2. Implement the `RecordStore` trait
//! 3. Map the engine's native change token (row version, ETag, update time)
//!    onto `WorkflowRecord::version` and reject stale conditional writes
//!    with `StoreError::VersionConflict`

mod in_memory;
mod lock;
mod store;

pub use in_memory::InMemoryStore;
pub use lock::{LockConfig, LockError, LockManager, LockedRecord};
pub use store::{RecordStore, StoreError};
