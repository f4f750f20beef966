//! HTTP surface: the WebSocket endpoint, job submission and queue stats.

pub mod ws;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::orchestrator::Orchestrator;
use crate::protocol::{Job, JobRequest};
use crate::queue::{JobQueue, QueueSnapshot};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub queue: JobQueue,
    pub uploads_dir: PathBuf,
}

/// Errors returned by HTTP handlers as JSON bodies
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/jobs", post(submit_job))
        .route("/api/stats", get(stats))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub display_name: String,
    pub outstanding: usize,
}

/// Resolve a submitted path to a file inside the uploads directory
///
/// Paths may be given relative to the uploads directory or prefixed with it.
/// Uploads are stored flat, so anything but a single file name is rejected.
fn resolve_upload(uploads_dir: &Path, path: &Path) -> ApiResult<PathBuf> {
    let relative = path.strip_prefix(uploads_dir).unwrap_or(path);
    let mut components = relative
        .components()
        .filter(|c| !matches!(c, Component::CurDir));

    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Ok(uploads_dir.join(name)),
        _ => Err(ApiError::BadRequest(format!(
            "uploadedFilePath {} must name a file inside the uploads directory",
            path.display()
        ))),
    }
}

/// Queue a job for a file the upload layer already stored
async fn submit_job(
    State(state): State<AppState>,
    Json(mut request): Json<JobRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    if request.original_file_name.trim().is_empty() {
        return Err(ApiError::BadRequest("originalFileName is required".to_string()));
    }

    if !state.orchestrator.hub().is_open(&request.client_id).await {
        return Err(ApiError::NotFound(format!("client {} is not connected", request.client_id)));
    }

    request.uploaded_file_path = resolve_upload(&state.uploads_dir, &request.uploaded_file_path)?;
    match tokio::fs::metadata(&request.uploaded_file_path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => {
            return Err(ApiError::BadRequest(format!(
                "uploaded file {} is not a regular file",
                request.uploaded_file_path.display()
            )))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::BadRequest(format!(
                "uploaded file {} does not exist",
                request.uploaded_file_path.display()
            )))
        }
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    }

    let job = Job::from_request(request);
    let snapshot = state.queue.stats();
    let response = SubmitResponse {
        job_id: job.id,
        display_name: job.display_file_name(),
        outstanding: snapshot.queued + snapshot.running + 1,
    };
    info!("Accepted job {} ({}) for client {}", job.id, response.display_name, job.client_id);

    // The queue records the outcome; the handle is not awaited
    let _ = state.queue.submit(job).await;

    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub queue: QueueSnapshot,
    pub concurrency: usize,
    pub connections: usize,
    pub live_processes: usize,
    pub assigned_devices: u64,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let orchestrator = &state.orchestrator;
    Json(StatsResponse {
        queue: state.queue.stats(),
        concurrency: state.queue.concurrency(),
        connections: orchestrator.hub().connection_count().await,
        live_processes: orchestrator.registry().live_count().await,
        assigned_devices: orchestrator.scheduler().assigned_count(),
    })
}
