//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `DURABLE_HTTP_ADDR`: HTTP bind address (default: 0.0.0.0:8080)
//! - `DURABLE_PUBLIC_URL`: URL the scheduler posts callbacks to in `http` delivery mode (default: http://127.0.0.1:8080)
//! - `DURABLE_DELIVERY_MODE`: `inline` hands due deliveries straight to the dispatcher, `http` posts them to `/resume` and `/callback/timer` (default: inline)
//! - `DURABLE_LOCK_LEASE_SECS`: How long a lock protects a record (default: 60)
//! - `DURABLE_LOCK_MAX_ATTEMPTS`: Lock attempts before giving up (default: 50)
//! - `DURABLE_LOCK_BACKOFF_MS`: Lock backoff step (default: 100)
//! - `DURABLE_RESUME_DELAY_MS`: Delay of the resume scheduled after a yield (default: 100)
//! - `DURABLE_DELIVERY_MAX_ATTEMPTS`: Delivery attempts before giving up (default: 10)
//! - `DURABLE_DELIVERY_BACKOFF_MS`: Delivery backoff step (default: 1000)
//! - `DURABLE_DEFAULT_WORKFLOW`: Workflow type used when `/new/{id}` names none (default: order)

use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};
use durable_runtime::persistence::LockConfig;

/// Default address for the HTTP server
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

/// Default externally reachable URL of the HTTP server
pub const DEFAULT_PUBLIC_URL: &str = "http://127.0.0.1:8080";

/// How due deliveries reach the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Call the dispatcher in process.
    Inline,
    /// Post to this server's own callback endpoints.
    Http,
}

impl FromStr for DeliveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(DeliveryMode::Inline),
            "http" => Ok(DeliveryMode::Http),
            other => bail!("unknown delivery mode '{}', expected 'inline' or 'http'", other),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (host:port)
    pub http_addr: SocketAddr,

    /// Root URL used to build callback URLs
    pub public_url: String,

    pub delivery_mode: DeliveryMode,

    /// Lease, attempt bound and backoff of the record lock
    pub lock: LockConfig,

    /// Delay of the resume scheduled when an instance yields
    pub resume_delay: Duration,

    /// Delivery attempts before a delivery is dropped
    pub delivery_max_attempts: u32,

    /// Delivery backoff grows by this much per attempt
    pub delivery_backoff: Duration,

    /// Workflow type for `/new/{id}` requests that do not name one
    pub default_workflow: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_url: DEFAULT_PUBLIC_URL.to_string(),
            delivery_mode: DeliveryMode::Inline,
            lock: LockConfig::default(),
            resume_delay: Duration::from_millis(100),
            delivery_max_attempts: 10,
            delivery_backoff: Duration::from_millis(1000),
            default_workflow: "order".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key-value source. Unset keys take their
    /// defaults; set but malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let http_addr = lookup("DURABLE_HTTP_ADDR").unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());
        let http_addr =
            SocketAddr::from_str(&http_addr).context("invalid DURABLE_HTTP_ADDR format")?;

        let public_url = lookup("DURABLE_PUBLIC_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.public_url);

        let delivery_mode = match lookup("DURABLE_DELIVERY_MODE") {
            Some(mode) => mode.parse().context("invalid DURABLE_DELIVERY_MODE")?,
            None => defaults.delivery_mode,
        };

        let lease_secs = parse(&lookup, "DURABLE_LOCK_LEASE_SECS", defaults.lock.lease.as_secs())?;
        let max_attempts = parse(&lookup, "DURABLE_LOCK_MAX_ATTEMPTS", defaults.lock.max_attempts)?;
        if max_attempts == 0 {
            bail!("DURABLE_LOCK_MAX_ATTEMPTS must be at least 1");
        }
        let backoff_ms = parse(
            &lookup,
            "DURABLE_LOCK_BACKOFF_MS",
            millis(defaults.lock.backoff_step),
        )?;

        let resume_delay_ms = parse(
            &lookup,
            "DURABLE_RESUME_DELAY_MS",
            millis(defaults.resume_delay),
        )?;
        let delivery_max_attempts = parse(
            &lookup,
            "DURABLE_DELIVERY_MAX_ATTEMPTS",
            defaults.delivery_max_attempts,
        )?;
        let delivery_backoff_ms = parse(
            &lookup,
            "DURABLE_DELIVERY_BACKOFF_MS",
            millis(defaults.delivery_backoff),
        )?;

        let default_workflow =
            lookup("DURABLE_DEFAULT_WORKFLOW").unwrap_or(defaults.default_workflow);

        Ok(Self {
            http_addr,
            public_url,
            delivery_mode,
            lock: LockConfig {
                lease: Duration::from_secs(lease_secs),
                max_attempts,
                backoff_step: Duration::from_millis(backoff_ms),
            },
            resume_delay: Duration::from_millis(resume_delay_ms),
            delivery_max_attempts,
            delivery_backoff: Duration::from_millis(delivery_backoff_ms),
            default_workflow,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {} value '{}'", key, raw)),
        None => Ok(default),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
