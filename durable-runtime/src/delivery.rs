//! Delivery of due requests to the dispatcher.
//!
//! The [`LocalScheduler`](crate::LocalScheduler) only decides *when* a
//! delivery is due. A [`DeliveryPump`] decides *how* it reaches the
//! dispatcher: in-process through a [`DeliverySink`] implemented by the
//! dispatcher itself, or over HTTP through [`HttpSink`] against the public
//! `/resume` and `/callback/timer` endpoints.

use crate::scheduler::Delivery;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Error type for a single delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Worth another attempt after backoff.
    #[error("Delivery failed, will retry: {0}")]
    Retryable(String),
    /// Retrying cannot help.
    #[error("Delivery rejected: {0}")]
    Permanent(String),
}

/// Something that can hand a due delivery to the dispatcher.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError>;
}

/// Drains due deliveries and hands each one to a sink with bounded retries.
pub struct DeliveryPump<K> {
    sink: Arc<K>,
    max_attempts: u32,
    backoff_step: Duration,
}

impl<K> DeliveryPump<K>
where
    K: DeliverySink + 'static,
{
    pub fn new(sink: Arc<K>, max_attempts: u32, backoff_step: Duration) -> Self {
        Self {
            sink,
            max_attempts: max_attempts.max(1),
            backoff_step,
        }
    }

    /// Run until every sender of `rx` is gone.
    ///
    /// Each delivery is handled on its own task so a slow or contended
    /// instance never holds up deliveries for other instances.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        tracing::info!("Delivery pump started");
        while let Some(delivery) = rx.recv().await {
            let sink = Arc::clone(&self.sink);
            let max_attempts = self.max_attempts;
            let backoff_step = self.backoff_step;
            tokio::spawn(async move {
                deliver_with_retry(sink.as_ref(), &delivery, max_attempts, backoff_step).await;
            });
        }
        tracing::info!("Delivery pump stopped");
    }
}

/// Try a delivery up to `max_attempts` times, waiting `backoff_step * attempt`
/// between attempts. Returns whether the delivery was accepted.
pub async fn deliver_with_retry<K>(
    sink: &K,
    delivery: &Delivery,
    max_attempts: u32,
    backoff_step: Duration,
) -> bool
where
    K: DeliverySink + ?Sized,
{
    for attempt in 1..=max_attempts {
        match sink.deliver(delivery).await {
            Ok(()) => return true,
            Err(DeliveryError::Permanent(reason)) => {
                tracing::error!(
                    instance_id = %delivery.instance_id(),
                    %reason,
                    "Delivery rejected, dropping it"
                );
                return false;
            }
            Err(DeliveryError::Retryable(reason)) => {
                tracing::warn!(
                    instance_id = %delivery.instance_id(),
                    attempt,
                    %reason,
                    "Delivery failed"
                );
                if attempt < max_attempts {
                    tokio::time::sleep(backoff_step * attempt).await;
                }
            }
        }
    }

    tracing::error!(
        instance_id = %delivery.instance_id(),
        attempts = max_attempts,
        "Giving up on delivery, the instance needs a manual resume"
    );
    false
}

/// Posts deliveries to a running server's callback endpoints.
#[derive(Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    resume_url: String,
    timer_url: String,
}

impl HttpSink {
    /// `base_url` is the externally reachable root of the server, for example
    /// `http://127.0.0.1:8080`.
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client,
            resume_url: format!("{}/resume", base),
            timer_url: format!("{}/callback/timer", base),
        }
    }

    pub fn resume_url(&self) -> &str {
        &self.resume_url
    }

    pub fn timer_url(&self) -> &str {
        &self.timer_url
    }
}

#[async_trait]
impl DeliverySink for HttpSink {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        let request = match delivery {
            Delivery::Resume(resume) => self.client.post(&self.resume_url).json(resume),
            Delivery::Timer(timer) => self.client.post(&self.timer_url).json(timer),
        };

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(DeliveryError::Permanent(format!("HTTP {}", status)))
        } else {
            Err(DeliveryError::Retryable(format!("HTTP {}", status)))
        }
    }
}
