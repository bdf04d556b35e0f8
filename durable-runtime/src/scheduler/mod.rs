//! Deferred task scheduling.
//!
//! A [`DeferredScheduler`] accepts "deliver this later" requests: resume
//! deliveries that re-drive an instance shortly after a checkpoint, and
//! one-shot timers whose firing resolves a timer case. Deliveries are
//! at-least-once; the dispatcher turns duplicates and superseded timers into
//! no-ops, so schedulers never have to deduplicate.

mod local;

pub use local::LocalScheduler;

use async_trait::async_trait;
use durable_core::TimerHandle;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error type for scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler could not accept the request.
    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),
    /// The timer already fired or was never armed.
    #[error("Unknown timer: {0}")]
    UnknownTimer(TimerHandle),
}

/// Body of a resume delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeDelivery {
    pub id: String,
}

/// Body of a timer delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerDelivery {
    pub id: String,
    pub case_name: String,
    #[serde(default)]
    pub setup_data: serde_json::Value,
    /// Handle of the timer that produced this delivery. Lets the dispatcher
    /// tell a superseded timer from the one currently armed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<TimerHandle>,
}

/// A delivery that came due.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Resume(ResumeDelivery),
    Timer(TimerDelivery),
}

impl Delivery {
    /// The instance the delivery targets.
    pub fn instance_id(&self) -> &str {
        match self {
            Delivery::Resume(resume) => &resume.id,
            Delivery::Timer(timer) => &timer.id,
        }
    }
}

/// Trait for anything that can deliver requests to the dispatcher later.
///
/// # Example
///
/// ```rust,ignore
/// let handle = scheduler
///     .schedule_timer("order-1", "CartTimeout", Duration::from_secs(86_400), json!(null))
///     .await?;
/// // ... the case resolved some other way
/// scheduler.cancel_timer(&handle).await?;
/// ```
#[async_trait]
pub trait DeferredScheduler: Send + Sync {
    /// Deliver a resume for `id` after `delay`.
    async fn schedule_resume(&self, id: &str, delay: Duration) -> Result<(), SchedulerError>;

    /// Deliver a timer firing for `case_name` of `id` after `delay`.
    ///
    /// The returned handle is stored with the armed case and is the only way
    /// to cancel the timer.
    async fn schedule_timer(
        &self,
        id: &str,
        case_name: &str,
        delay: Duration,
        setup_data: serde_json::Value,
    ) -> Result<TimerHandle, SchedulerError>;

    /// Cancel a pending timer.
    ///
    /// # Errors
    ///
    /// `SchedulerError::UnknownTimer` if the timer already fired or never
    /// existed. Callers treat cancellation as best effort.
    async fn cancel_timer(&self, handle: &TimerHandle) -> Result<(), SchedulerError>;
}
