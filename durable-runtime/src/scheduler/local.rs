//! In-process deferred scheduler.
//!
//! Each scheduled delivery is a tokio task that sleeps for its delay and then
//! pushes the delivery onto a channel. A [`DeliveryPump`](crate::DeliveryPump)
//! drains the channel. Pending deliveries live only in memory, so they do not
//! survive a process restart.

use super::{DeferredScheduler, Delivery, ResumeDelivery, SchedulerError, TimerDelivery};
use async_trait::async_trait;
use durable_core::TimerHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

type Pending = Arc<Mutex<HashMap<TimerHandle, JoinHandle<()>>>>;

/// Scheduler backed by tokio timers.
///
/// Clones share the same pending set and channel.
#[derive(Clone)]
pub struct LocalScheduler {
    tx: mpsc::UnboundedSender<Delivery>,
    pending: Pending,
}

impl LocalScheduler {
    /// Create a scheduler and the receiving end of its delivery channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
        };
        (scheduler, rx)
    }

    /// Number of deliveries that have not come due yet.
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or_default()
    }

    fn spawn_delivery(
        &self,
        handle: TimerHandle,
        delay: Duration,
        delivery: Delivery,
    ) -> Result<(), SchedulerError> {
        // Hold the pending map while spawning so the task cannot remove its
        // own entry before it has been inserted.
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| SchedulerError::Unavailable(format!("Lock error: {}", e)))?;

        let tx = self.tx.clone();
        let shared = Arc::clone(&self.pending);
        let key = handle.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut pending) = shared.lock() {
                pending.remove(&key);
            }
            tracing::trace!(
                instance_id = %delivery.instance_id(),
                handle = %key,
                "Delivery came due"
            );
            if tx.send(delivery).is_err() {
                tracing::warn!(handle = %key, "Delivery channel closed, dropping delivery");
            }
        });
        pending.insert(handle, task);
        Ok(())
    }
}

#[async_trait]
impl DeferredScheduler for LocalScheduler {
    async fn schedule_resume(&self, id: &str, delay: Duration) -> Result<(), SchedulerError> {
        let handle = TimerHandle::new(format!("resume-{}", Uuid::new_v4()));
        tracing::trace!(instance_id = %id, ?delay, "Scheduling resume");
        self.spawn_delivery(
            handle,
            delay,
            Delivery::Resume(ResumeDelivery { id: id.to_string() }),
        )
    }

    async fn schedule_timer(
        &self,
        id: &str,
        case_name: &str,
        delay: Duration,
        setup_data: serde_json::Value,
    ) -> Result<TimerHandle, SchedulerError> {
        let handle = TimerHandle::new(format!("timer-{}", Uuid::new_v4()));
        tracing::debug!(
            instance_id = %id,
            case = %case_name,
            handle = %handle,
            ?delay,
            "Arming timer"
        );
        self.spawn_delivery(
            handle.clone(),
            delay,
            Delivery::Timer(TimerDelivery {
                id: id.to_string(),
                case_name: case_name.to_string(),
                setup_data,
                handle: Some(handle.clone()),
            }),
        )?;
        Ok(handle)
    }

    async fn cancel_timer(&self, handle: &TimerHandle) -> Result<(), SchedulerError> {
        let task = self
            .pending
            .lock()
            .map_err(|e| SchedulerError::Unavailable(format!("Lock error: {}", e)))?
            .remove(handle);

        match task {
            Some(task) => {
                task.abort();
                tracing::debug!(handle = %handle, "Timer cancelled");
                Ok(())
            }
            None => Err(SchedulerError::UnknownTimer(handle.clone())),
        }
    }
}
