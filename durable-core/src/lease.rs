//! Time-bounded advisory leases.
//!
//! A lease is what makes a record "locked": while `now < expires_at` the
//! holder has exclusive rights to mutate the record. A holder that crashes
//! simply stops renewing, and the record becomes lockable again once the
//! lease runs out.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// A lease taken on a workflow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// When the lease was taken.
    pub acquired_at: DateTime<Utc>,
    /// When the lease stops protecting the record.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Create a lease starting at `now` that lasts for `ttl`.
    ///
    /// A `ttl` too large to represent saturates to the maximum timestamp.
    pub fn starting_at(now: DateTime<Utc>, ttl: Duration) -> Self {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            acquired_at: now,
            expires_at,
        }
    }

    /// Check if the lease has run out at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Whether a `lock_until` marker still holds at `now`.
///
/// `None` is the released state.
pub fn is_held(lock_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    lock_until.is_some_and(|until| now < until)
}
