//! HTTP surface for the engine service.
//!
//! Every operation is exposed as a JSON endpoint; the log stream is a
//! server-streamed NDJSON body. Failures carry a machine-readable `code`
//! (the RPC status vocabulary) next to the human message. `GET /healthz`
//! is public; everything under `/v1` passes the auth interceptor.

use axum::body::Body;
use axum::extract::{Extension, Path, State};
use axum::http::header;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use futures_util::StreamExt;
use rocketship_types::{LogColor, LogLine, RunSummary};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::auth::{AuthState, require_auth};
use crate::error::{ApiError, ApiResult};
use crate::service::{CreateRunRequest, EngineService};

/// Shutdown signal handle injected into the admin route.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: mpsc::Sender<()>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (sender, receiver) = mpsc::channel(1);
        (Self { sender }, receiver)
    }

    pub async fn trigger(&self) {
        let _ = self.sender.send(()).await;
    }
}

/// Build the full router for one service instance.
pub fn router(
    service: Arc<EngineService>,
    auth: Arc<AuthState>,
    shutdown: ShutdownHandle,
) -> Router {
    let protected = Router::new()
        .route("/v1/runs", post(create_run).get(list_runs))
        .route("/v1/runs/:run_id", get(get_run))
        .route("/v1/runs/:run_id/logs", get(stream_logs).post(add_log))
        .route("/v1/runs/:run_id/cancel", post(cancel_run))
        .route("/v1/admin/shutdown", post(shutdown_server))
        .layer(middleware::from_fn_with_state(auth, require_auth))
        .with_state(service)
        .layer(Extension(shutdown));

    Router::new().route("/healthz", get(health)).merge(protected)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

#[derive(Serialize)]
struct CreateRunResponse {
    run_id: String,
}

async fn create_run(
    State(service): State<Arc<EngineService>>,
    Json(request): Json<CreateRunRequest>,
) -> ApiResult<Json<CreateRunResponse>> {
    let run_id = service.create_run(request)?;
    Ok(Json(CreateRunResponse { run_id }))
}

#[derive(Serialize)]
struct ListRunsResponse {
    runs: Vec<RunSummary>,
}

async fn list_runs(State(service): State<Arc<EngineService>>) -> Json<ListRunsResponse> {
    Json(ListRunsResponse {
        runs: service.list_runs(),
    })
}

async fn get_run(
    State(service): State<Arc<EngineService>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunSummary>> {
    service.get_run(&run_id).map(Json)
}

/// Server-streamed NDJSON log delivery: retained window first, then live
/// lines until the run reaches a terminal state and the buffer drains.
async fn stream_logs(
    State(service): State<Arc<EngineService>>,
    Path(run_id): Path<String>,
) -> ApiResult<Response> {
    let receiver = service.stream_logs(&run_id)?;
    let stream = ReceiverStream::new(receiver).map(|line| {
        let mut encoded = serde_json::to_vec(&line).unwrap_or_default();
        encoded.push(b'\n');
        Ok::<_, std::convert::Infallible>(encoded)
    });
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .map_err(|error| ApiError::internal(format!("failed to build log stream: {error}")))?;
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct AddLogRequest {
    #[serde(default)]
    workflow_id: String,
    message: String,
    #[serde(default)]
    color: LogColor,
    #[serde(default)]
    bold: bool,
    #[serde(default)]
    test_name: String,
    #[serde(default)]
    step_name: String,
}

/// Worker-side ingress: one log line fans out to subscribers and the store.
async fn add_log(
    State(service): State<Arc<EngineService>>,
    Path(run_id): Path<String>,
    Json(request): Json<AddLogRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let _ = &request.workflow_id;
    let mut line = LogLine::info(chrono::Utc::now(), request.message)
        .scoped(request.test_name, request.step_name)
        .colored(request.color);
    line.bold = request.bold;
    service.add_log(&run_id, line)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn cancel_run(
    State(service): State<Arc<EngineService>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    service.cancel(&run_id)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn shutdown_server(
    Extension(shutdown): Extension<ShutdownHandle>,
) -> Json<serde_json::Value> {
    shutdown.trigger().await;
    Json(serde_json::json!({"ok": true}))
}
