//! HTTP surface of the dispatcher.
//!
//! - `POST /new/:id` creates an instance and drives it to its first wait point
//! - `POST /event/:id/:case` delivers an external event
//! - `POST /resume` and `POST /callback/timer` receive scheduler deliveries
//! - `GET /status/:id` returns the current record

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use durable_core::{Position, WaitRegistry, WorkflowRecord, WorkflowStatus};
use durable_persistence::InMemoryStore;
use durable_runtime::{
    CallbackDispatcher, DispatchError, DispatchOutcome, ResumeDelivery, TimerDelivery,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

pub type Dispatcher = CallbackDispatcher<InMemoryStore>;

#[derive(Clone)]
pub struct HttpState {
    pub dispatcher: Arc<Dispatcher>,
    pub default_workflow: Arc<str>,
}

impl HttpState {
    pub fn new(dispatcher: Arc<Dispatcher>, default_workflow: impl Into<Arc<str>>) -> Self {
        Self {
            dispatcher,
            default_workflow: default_workflow.into(),
        }
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/new/:id", post(new_instance))
        .route("/event/:id/:case", post(event))
        .route("/resume", post(resume))
        .route("/callback/timer", post(timer))
        .route("/status/:id", get(status))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct NewInstanceRequest {
    workflow_type: Option<String>,
    state: Option<Value>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    id: String,
    workflow_type: String,
    status: WorkflowStatus,
    state: Value,
    position: Position,
    waits: WaitRegistry,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    lock_until: Option<DateTime<Utc>>,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WorkflowRecord> for StatusResponse {
    fn from(record: WorkflowRecord) -> Self {
        let state = if record.state.data.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&record.state.data).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&record.state.data).into_owned())
            })
        };
        Self {
            id: record.id,
            workflow_type: record.workflow_type,
            status: record.status,
            state,
            position: record.state.position,
            waits: record.state.waits,
            output: record.state.output,
            lock_until: record.lock_until,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponseBody {
    message: String,
}

#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
}

impl From<DispatchError> for HttpError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::AlreadyExists(_) => StatusCode::CONFLICT,
            DispatchError::UnknownWorkflowType(_)
            | DispatchError::InvalidEvent { .. }
            | DispatchError::Rejected { .. } => StatusCode::BAD_REQUEST,
            DispatchError::WorkflowFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::Contention { .. } | DispatchError::LeaseLost(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            // The input was applied; a retry would apply it again.
            DispatchError::Scheduling(_) => StatusCode::ACCEPTED,
            DispatchError::Interpreter(_)
            | DispatchError::Lifecycle(_)
            | DispatchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(?err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponseBody {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

/// A checkpoint that was written but could not schedule everything is still
/// an applied delivery. It answers `202 Accepted` with the outcome, which
/// lists the failed requests, so callers do not retry it.
fn applied(
    result: Result<DispatchOutcome, DispatchError>,
) -> Result<(StatusCode, DispatchOutcome), HttpError> {
    match result {
        Ok(outcome) => Ok((StatusCode::OK, outcome)),
        Err(DispatchError::Scheduling(outcome)) => {
            error!(
                instance_id = %outcome.id,
                failures = %outcome.scheduling_failures.join("; "),
                "Checkpoint applied but scheduling failed"
            );
            Ok((StatusCode::ACCEPTED, *outcome))
        }
        Err(e) => Err(e.into()),
    }
}

/// An empty body reads as `null`.
fn json_body<T>(body: &Bytes) -> Result<Option<T>, HttpError>
where
    T: for<'de> Deserialize<'de>,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| HttpError::bad_request(format!("invalid JSON body: {}", e)))
}

async fn new_instance(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<DispatchOutcome>), HttpError> {
    let request: NewInstanceRequest = json_body(&body)?.unwrap_or_default();
    let workflow_type = request
        .workflow_type
        .unwrap_or_else(|| state.default_workflow.to_string());
    let data = match request.state {
        Some(initial) => serde_json::to_vec(&initial)
            .map(Bytes::from)
            .map_err(|e| HttpError::bad_request(e.to_string()))?,
        None => Bytes::new(),
    };

    let (status, outcome) = applied(state.dispatcher.start(&id, &workflow_type, data).await)?;
    let status = if status == StatusCode::OK {
        StatusCode::CREATED
    } else {
        status
    };
    Ok((status, Json(outcome)))
}

async fn event(
    State(state): State<HttpState>,
    Path((id, case)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), HttpError> {
    let payload: Value = json_body(&body)?.unwrap_or(Value::Null);
    let (status, outcome) = applied(state.dispatcher.on_event(&id, &case, payload).await)?;
    Ok((status, Json(outcome.output.unwrap_or(Value::Null))))
}

async fn resume(
    State(state): State<HttpState>,
    Json(delivery): Json<ResumeDelivery>,
) -> Result<(StatusCode, Json<DispatchOutcome>), HttpError> {
    let (status, outcome) = applied(state.dispatcher.on_resume_fired(&delivery.id).await)?;
    Ok((status, Json(outcome)))
}

async fn timer(
    State(state): State<HttpState>,
    Json(delivery): Json<TimerDelivery>,
) -> Result<(StatusCode, Json<DispatchOutcome>), HttpError> {
    let (status, outcome) = applied(state.dispatcher.on_timer_fired(&delivery).await)?;
    Ok((status, Json(outcome)))
}

async fn status(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, HttpError> {
    let record = state.dispatcher.get(&id).await?;
    Ok(Json(record.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{OrderInterpreter, WORKFLOW_TYPE};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use async_trait::async_trait;
    use durable_core::TimerHandle;
    use durable_persistence::{LockConfig, LockManager};
    use durable_runtime::{DeferredScheduler, InterpreterRegistry, LocalScheduler, SchedulerError};
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        scheduler: LocalScheduler,
        // Keeps the delivery channel open; nothing is pumped in these tests.
        _deliveries: tokio::sync::mpsc::UnboundedReceiver<durable_runtime::Delivery>,
    }

    /// Scheduler whose queue is down: nothing can be armed or scheduled.
    struct DownScheduler;

    #[async_trait]
    impl DeferredScheduler for DownScheduler {
        async fn schedule_resume(&self, _id: &str, _delay: Duration) -> Result<(), SchedulerError> {
            Err(SchedulerError::Unavailable("queue is down".into()))
        }

        async fn schedule_timer(
            &self,
            _id: &str,
            _case_name: &str,
            _delay: Duration,
            _setup_data: Value,
        ) -> Result<TimerHandle, SchedulerError> {
            Err(SchedulerError::Unavailable("queue is down".into()))
        }

        async fn cancel_timer(&self, _handle: &TimerHandle) -> Result<(), SchedulerError> {
            Err(SchedulerError::Unavailable("queue is down".into()))
        }
    }

    fn order_router(scheduler: Arc<dyn DeferredScheduler>) -> Router {
        let store = Arc::new(InMemoryStore::new());
        let locks = Arc::new(LockManager::new(
            store,
            LockConfig {
                lease: Duration::from_secs(60),
                max_attempts: 10,
                backoff_step: Duration::from_millis(1),
            },
        ));
        let dispatcher = Arc::new(CallbackDispatcher::new(
            locks,
            scheduler,
            InterpreterRegistry::new().register(WORKFLOW_TYPE, OrderInterpreter),
            Duration::from_secs(60),
        ));
        router(HttpState::new(dispatcher, WORKFLOW_TYPE))
    }

    fn app() -> TestApp {
        let (scheduler, deliveries) = LocalScheduler::new();
        TestApp {
            router: order_router(Arc::new(scheduler.clone())),
            scheduler,
            _deliveries: deliveries,
        }
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                req = req.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let resp = router.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_order_scenario() {
        let app = app();

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/new/order-1",
            Some(json!({"state": {"cart": []}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], json!("Waiting"));
        assert_eq!(app.scheduler.pending(), 1);

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/event/order-1/AddToCart",
            Some(json!({"name": "Margherita", "qty": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cart"], json!([{"name": "Margherita", "qty": 1}]));

        let (status, record) = send(&app.router, Method::GET, "/status/order-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["status"], json!("Waiting"));
        assert_eq!(record["state"]["cart"], json!([{"name": "Margherita", "qty": 1}]));
        assert_eq!(record["lock_until"], Value::Null);
        // The cart timer was re-armed for the next loop iteration, not added to.
        assert_eq!(app.scheduler.pending(), 1);

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/event/order-1/SubmitCart",
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("submitted"));

        let (_, record) = send(&app.router, Method::GET, "/status/order-1", None).await;
        assert_eq!(record["status"], json!("Waiting"));
        let main = &record["waits"]["main"];
        assert_eq!(main["wait"], json!("manager confirms order"));
        let cases = main["cases"].as_array().unwrap();
        let timers: Vec<_> = cases.iter().filter(|c| c["kind"] == json!("timer")).collect();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0]["name"], json!("ConfirmTimeout"));
        assert!(timers[0]["timer"].is_string());
        assert_eq!(app.scheduler.pending(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_event_is_a_client_error() {
        let app = app();
        send(&app.router, Method::POST, "/new/order-1", None).await;

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/event/order-1/Delivered",
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("Delivered"));

        let (status, _) = send(
            &app.router,
            Method::POST,
            "/event/order-1/AddToCart",
            Some(json!({"name": "Margherita"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, record) = send(&app.router, Method::GET, "/status/order-1", None).await;
        assert_eq!(record["state"]["cart"], json!([]));
        assert_eq!(record["waits"]["main"]["wait"], json!("wait for user input"));
        assert_eq!(record["lock_until"], Value::Null);
    }

    #[tokio::test]
    async fn test_lifecycle_errors_map_to_status_codes() {
        let app = app();

        let (status, _) = send(&app.router, Method::GET, "/status/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app.router, Method::POST, "/new/order-1", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = send(&app.router, Method::POST, "/new/order-1", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app.router,
            Method::POST,
            "/new/order-2",
            Some(json!({"workflow_type": "payroll"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app.router,
            Method::POST,
            "/resume",
            Some(json!({"id": "missing"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_scheduler_callbacks() {
        let app = app();
        send(&app.router, Method::POST, "/new/order-1", None).await;

        // Parked instances ignore resumes.
        let (status, body) = send(
            &app.router,
            Method::POST,
            "/resume",
            Some(json!({"id": "order-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stale"], json!(true));

        // A timer from a wait point that no longer exists is ignored.
        let (status, body) = send(
            &app.router,
            Method::POST,
            "/callback/timer",
            Some(json!({"id": "order-1", "caseName": "ConfirmTimeout", "setupData": null})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stale"], json!(true));

        // The armed cart timer ends the order.
        let (status, body) = send(
            &app.router,
            Method::POST,
            "/callback/timer",
            Some(json!({"id": "order-1", "caseName": "CartTimeout"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stale"], json!(false));
        assert_eq!(body["status"], json!("Finished"));
        assert_eq!(body["output"]["status"], json!("timed out"));

        let (_, record) = send(&app.router, Method::GET, "/status/order-1", None).await;
        assert_eq!(record["status"], json!("Finished"));
        assert_eq!(record["waits"], json!({}));
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_rejected() {
        let app = app();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/new/order-1")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_event_applied_without_scheduling_is_not_retryable() {
        let router = order_router(Arc::new(DownScheduler));

        let (status, body) = send(&router, Method::POST, "/new/order-1", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], json!("Waiting"));
        assert_eq!(body["scheduling_failures"].as_array().unwrap().len(), 1);

        let pizza = json!({"name": "Margherita", "qty": 1});
        let (status, body) = send(
            &router,
            Method::POST,
            "/event/order-1/AddToCart",
            Some(pizza.clone()),
        )
        .await;
        assert!(status.is_success());
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["cart"], json!([pizza]));

        let (_, record) = send(&router, Method::GET, "/status/order-1", None).await;
        assert_eq!(record["state"]["cart"], json!([pizza]));
        let cases = record["waits"]["main"]["cases"].as_array().unwrap();
        let cart_timer = cases.iter().find(|c| c["name"] == json!("CartTimeout")).unwrap();
        assert!(cart_timer.get("timer").is_none());
    }
}
