mod config;
mod http;
mod order;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use axum::{Json, Router, routing::get};
use durable_persistence::{InMemoryStore, LockManager};
use durable_runtime::{
    CallbackDispatcher, DeliveryPump, HttpSink, InterpreterRegistry, LocalScheduler,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::config::{DeliveryMode, ServerConfig};
use crate::http::{Dispatcher, HttpState};
use crate::order::{OrderInterpreter, WORKFLOW_TYPE};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,durable_runtime=info,durable_server=info")
        }))
        .init();
}

fn build_registry() -> InterpreterRegistry {
    InterpreterRegistry::new().register(WORKFLOW_TYPE, OrderInterpreter)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

/// Start the task that hands due deliveries to the dispatcher, directly or
/// through this server's own callback endpoints.
fn spawn_pump(
    config: &ServerConfig,
    dispatcher: &Arc<Dispatcher>,
    deliveries: tokio::sync::mpsc::UnboundedReceiver<durable_runtime::Delivery>,
) -> JoinHandle<()> {
    let attempts = config.delivery_max_attempts;
    let backoff = config.delivery_backoff;
    match config.delivery_mode {
        DeliveryMode::Inline => {
            let pump = DeliveryPump::new(Arc::clone(dispatcher), attempts, backoff);
            tokio::spawn(pump.run(deliveries))
        }
        DeliveryMode::Http => {
            let sink = Arc::new(HttpSink::new(&config.public_url));
            tracing::info!(
                resume_url = sink.resume_url(),
                timer_url = sink.timer_url(),
                "Deliveries go over HTTP"
            );
            let pump = DeliveryPump::new(sink, attempts, backoff);
            tokio::spawn(pump.run(deliveries))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = ServerConfig::from_env().context("failed to load configuration")?;
    let registry = build_registry();
    if !registry.contains(&config.default_workflow) {
        bail!(
            "default workflow type '{}' is not registered (known: {})",
            config.default_workflow,
            registry.workflow_types().join(", ")
        );
    }

    let store = Arc::new(InMemoryStore::new());
    let locks = Arc::new(LockManager::new(store, config.lock.clone()));
    let (scheduler, deliveries) = LocalScheduler::new();
    let dispatcher = Arc::new(CallbackDispatcher::new(
        locks,
        Arc::new(scheduler),
        registry,
        config.resume_delay,
    ));

    let pump = spawn_pump(&config, &dispatcher, deliveries);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .merge(http::router(HttpState::new(
            dispatcher,
            config.default_workflow.as_str(),
        )));

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    tracing::info!(
        addr = %config.http_addr,
        delivery_mode = ?config.delivery_mode,
        "Durable server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    pump.abort();
    Ok(())
}
