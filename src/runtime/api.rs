//! HTTP control surface.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /tasks` | add a task, waking the loop unless `wake_immediately` is false |
//! | `GET /tasks` | list tasks, `?status=` and `?limit=` |
//! | `GET /tasks/{id}` | one task with its transcript |
//! | `DELETE /tasks/{id}` | cancel a pending task or stop a running one |
//! | `POST /tasks/{id}/complete` | agent-reported success |
//! | `POST /tasks/{id}/fail` | agent-reported failure |
//! | `POST /execute_task/{id}` | run one pending task now |
//! | `GET /scheduled` | pending tasks dated in the future |
//! | `GET /running` | tasks being executed |
//! | `POST /wake` | run a cycle now |
//! | `GET /status` | scheduler state and task counts |
//! | `GET /events` | server-sent lifecycle events |
//! | `GET /health` | liveness |

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::daemon::DaemonHandle;
use crate::core::{CancelOutcome, DaemonError, NewTask, TaskId, TaskStatus};
use crate::infra::store::DEFAULT_LIST_LIMIT;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Body of `POST /tasks`.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Task fields.
    #[serde(flatten)]
    pub task: NewTask,
    /// Run a cycle right away. Defaults to true.
    #[serde(default = "wake_by_default")]
    pub wake_immediately: bool,
}

const fn wake_by_default() -> bool {
    true
}

/// Reply to `POST /tasks`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// New task id.
    pub id: TaskId,
    /// Always `pending`.
    pub status: TaskStatus,
}

/// Query of `GET /tasks`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
    /// Page size.
    pub limit: Option<usize>,
}

/// Body of `POST /tasks/{id}/complete`.
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    /// Result text.
    pub result: String,
}

/// Body of `POST /tasks/{id}/fail`.
#[derive(Debug, Deserialize)]
pub struct FailRequest {
    /// Error text.
    pub error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

/// A failed request, rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<DaemonError> for ApiError {
    fn from(err: DaemonError) -> Self {
        let status = match &err {
            DaemonError::InvalidTask(_) | DaemonError::InvalidSchedule(_) => StatusCode::BAD_REQUEST,
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::ClaimConflict(_) => StatusCode::CONFLICT,
            DaemonError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => {
                tracing::error!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

/// Routes bound to `handle`.
pub fn router(handle: DaemonHandle) -> Router {
    Router::new()
        .route("/tasks", post(handle_submit).get(handle_list))
        .route("/tasks/{id}", get(handle_get).delete(handle_cancel))
        .route("/tasks/{id}/complete", post(handle_complete))
        .route("/tasks/{id}/fail", post(handle_fail))
        .route("/execute_task/{id}", post(handle_execute))
        .route("/scheduled", get(handle_scheduled))
        .route("/running", get(handle_running))
        .route("/wake", post(handle_wake))
        .route("/status", get(handle_status))
        .route("/events", get(handle_events))
        .route("/health", get(handle_health))
        .with_state(handle)
}

async fn handle_submit(
    State(handle): State<DaemonHandle>,
    Json(body): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = handle.submit(body.task, body.wake_immediately)?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            id: task.id,
            status: task.status,
        }),
    ))
}

async fn handle_list(
    State(handle): State<DaemonHandle>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(handle.list(query.status, limit)?))
}

async fn handle_get(
    State(handle): State<DaemonHandle>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, ApiError> {
    handle
        .detail(id)?
        .map(Json)
        .ok_or_else(|| ApiError::from(DaemonError::NotFound(id)))
}

async fn handle_cancel(
    State(handle): State<DaemonHandle>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, ApiError> {
    match handle.cancel(id)? {
        CancelOutcome::Cancelled => Ok(Json(serde_json::json!({ "ok": true, "signalled": false }))),
        CancelOutcome::Signalled => Ok(Json(serde_json::json!({ "ok": true, "signalled": true }))),
        CancelOutcome::NotCancellable(status) => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("task {id} is {status}, not pending or running"),
        )),
    }
}

async fn handle_complete(
    State(handle): State<DaemonHandle>,
    Path(id): Path<TaskId>,
    Json(body): Json<CompleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let applied = handle.report_complete(id, &body.result)?;
    tracing::info!(task_id = id, applied, "completion reported");
    Ok(Json(serde_json::json!({ "ok": true, "applied": applied })))
}

async fn handle_fail(
    State(handle): State<DaemonHandle>,
    Path(id): Path<TaskId>,
    Json(body): Json<FailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let applied = handle.report_fail(id, &body.error)?;
    tracing::info!(task_id = id, applied, "failure reported");
    Ok(Json(serde_json::json!({ "ok": true, "applied": applied })))
}

async fn handle_execute(
    State(handle): State<DaemonHandle>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, ApiError> {
    let task = handle.execute_now(id)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "task_id": task.id,
        "message": format!("task {} '{}' started", task.id, task.title),
    })))
}

async fn handle_scheduled(State(handle): State<DaemonHandle>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(handle.scheduled()?))
}

async fn handle_running(State(handle): State<DaemonHandle>) -> impl IntoResponse {
    Json(handle.running())
}

async fn handle_wake(State(handle): State<DaemonHandle>) -> impl IntoResponse {
    handle.wake();
    Json(serde_json::json!({ "ok": true }))
}

async fn handle_status(State(handle): State<DaemonHandle>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(handle.status()?))
}

async fn handle_events(State(handle): State<DaemonHandle>) -> impl IntoResponse {
    let stream = handle.event_stream().filter_map(|event| async move {
        match serde_json::to_string(&event) {
            Ok(data) => Some(Ok::<_, Infallible>(Event::default().data(data))),
            Err(err) => {
                tracing::warn!(error = %err, "dropping unserialisable event");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
}

async fn handle_health(State(handle): State<DaemonHandle>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: handle.uptime_seconds(),
    })
}
