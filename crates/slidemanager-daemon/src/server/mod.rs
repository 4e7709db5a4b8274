//! HTTP control plane: job lifecycle endpoints and the SSE event stream.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;

use crate::config::{AppConfig, JobOptions};
use crate::services::event_bus::EventBus;
use crate::services::job_manager::{JobError, JobManager};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen_addr `{configured}` is not a host:port pair: {source}")]
    BadListenAddr {
        configured: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("could not serve on {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub bus: Arc<EventBus>,
}

/// JSON error body `{error, message}`; the `error` slug is stable for UI
/// dispatch.
struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn invalid_root(message: String) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            error: "invalid_library_root",
            message,
        }
    }

    fn not_found(job_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "job_not_found",
            message: format!("no job with id {job_id}"),
        }
    }

    fn internal(message: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal",
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(json!({ "error": self.error, "message": self.message })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::internal(err.to_string())
    }
}

pub fn build_router(state: AppState) -> Router {
    // A localhost tool: the desktop UI talks to us from file:// and
    // http://localhost origins, so CORS stays permissive.
    Router::new()
        .route("/jobs/index", post(create_job))
        .route("/jobs/{job_id}", get(job_status))
        .route("/jobs/{job_id}/pause", post(pause_job))
        .route("/jobs/{job_id}/resume", post(resume_job))
        .route("/jobs/{job_id}/cancel", post(cancel_job))
        .route("/jobs/{job_id}/events", get(job_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(config: &AppConfig, state: AppState) -> Result<(), ServerError> {
    let addr: SocketAddr = config.server.listen_addr.trim().parse().map_err(|source| {
        ServerError::BadListenAddr {
            configured: config.server.listen_addr.clone(),
            source,
        }
    })?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Io { addr, source })?;
    tracing::info!(%addr, "slidemanager daemon listening");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|source| ServerError::Io { addr, source })?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "failed to capture Ctrl+C signal");
    }
}

#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    library_root: String,
    #[serde(default)]
    options: JobOptions,
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state
        .manager
        .create_job(FsPath::new(&request.library_root), request.options)
    {
        Ok(job_id) => Ok(Json(json!({ "job_id": job_id }))),
        Err(JobError::InvalidRoot { path }) => Err(ApiError::invalid_root(format!(
            "{} does not exist or is not a directory",
            path.display()
        ))),
        Err(err) => Err(ApiError::internal(err.to_string())),
    }
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.manager.store();
    let Some(job) = store.job_row(&job_id)? else {
        return Err(ApiError::not_found(&job_id));
    };
    let counters = store.job_counters(&job_id)?;
    let now_running = store.now_running(&job_id)?;
    let errors: Vec<serde_json::Value> = store
        .errors_summary(&job_id)?
        .into_iter()
        .map(|(code, count)| json!({ "error_code": code, "count": count }))
        .collect();
    Ok(Json(json!({
        "job_id": job.job_id,
        "status": job.status.as_str(),
        "counters": counters,
        "now_running": now_running,
        "errors_summary": errors,
    })))
}

async fn pause_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.pause_job(&job_id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.resume_job(&job_id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.cancel_job(&job_id)?;
    Ok(Json(json!({ "ok": true })))
}

/// `text/event-stream` of the job's events. The first frame is always a
/// `hello` carrying the job id; a consumer that lags simply skips the
/// dropped span and resumes at the most recent event.
async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let receiver = state.bus.subscribe(&job_id);
    let hello = SseEvent::default().data(
        json!({ "type": "hello", "job_id": job_id }).to_string(),
    );
    let stream = stream::once(async move { Ok(hello) }).chain(
        BroadcastStream::new(receiver).filter_map(|item| async move {
            match item {
                Ok(event) => {
                    let body = serde_json::to_string(&event).ok()?;
                    Some(Ok(SseEvent::default().data(body)))
                }
                // Lagged receiver: events were dropped, keep streaming.
                Err(_) => None,
            }
        }),
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}
