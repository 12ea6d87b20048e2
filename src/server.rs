//! HTTP front door: job submission, result streaming and health.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::Utc;
use futures::{Stream, StreamExt, stream};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::ConnectionState;
use crate::config::ServerConfig;
use crate::dispatch::{DispatchCoordinator, DispatchResult, JobRequest};
use crate::error::DispatchError;
use crate::results::SseResultSink;
use crate::store::{JobStore, STATUS_COMPLETED};

/// Header carrying the caller's session id.
pub const SESSION_HEADER: &str = "x-session-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<DispatchCoordinator>,
    pub store: Arc<dyn JobStore>,
    pub results: Arc<SseResultSink>,
}

/// Body of `POST /submit-to-broker`.
#[derive(Debug, Deserialize)]
struct SubmitBody {
    text: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// Build the router with CORS and request tracing.
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/submit-to-broker", post(submit_job))
        .route("/listen-for-results/{job_id}", get(listen_for_results))
        .route("/health", get(health))
        .layer(cors_layer(config.allowed_origin.as_deref()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origin: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match allowed_origin.map(HeaderValue::from_str) {
        Some(Ok(origin)) => layer.allow_origin(origin),
        Some(Err(e)) => {
            warn!(error = %e, "Invalid ALLOWED_ORIGIN, allowing any origin");
            layer.allow_origin(Any)
        }
        None => layer.allow_origin(Any),
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ── Submission ──────────────────────────────────────────────────────────

async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SubmitBody>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return bad_request("Request body must be JSON with text and userId");
    };
    let (Some(text), Some(user_id)) = (non_empty(body.text), non_empty(body.user_id)) else {
        return bad_request("text and userId are required");
    };
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if session_id.is_empty() {
        return bad_request("x-session-id header is required");
    }

    let job_id = Uuid::new_v4().to_string();
    let record = json!({
        "jobID": job_id,
        "text": text,
        "userId": user_id,
        "sessionId": session_id,
        "status": "pending",
        "createdAt": Utc::now().to_rfc3339(),
    });
    if let Err(e) = state.store.put(&job_id, record).await {
        warn!(job_id = %job_id, error = %e, "Failed to record job");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Failed to record job" })),
        )
            .into_response();
    }

    let request = JobRequest::new(text, session_id).with_job_id(&job_id);
    match state.coordinator.submit(request).await {
        Ok(result) => {
            mark_status(&state, &job_id, &result).await;
            (
                StatusCode::OK,
                Json(json!({
                    "status": result.status,
                    "message": result.status.message(),
                    "jobID": job_id,
                })),
            )
                .into_response()
        }
        Err(e) => {
            let status = match &e {
                DispatchError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                DispatchError::ChannelUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::DispatchFailed { .. } => StatusCode::BAD_GATEWAY,
            };
            (status, Json(json!({ "error": e.to_string(), "jobID": job_id }))).into_response()
        }
    }
}

/// Record the dispatch outcome. A result that already arrived wins.
async fn mark_status(state: &AppState, job_id: &str, result: &DispatchResult) {
    match state.store.update_status(job_id, result.status.as_str()).await {
        Ok(true) => {}
        Ok(false) => debug!(job_id = %job_id, "Job already completed, status left as is"),
        Err(e) => warn!(job_id = %job_id, error = %e, "Failed to update job status"),
    }
}

// ── Results (SSE) ───────────────────────────────────────────────────────

async fn listen_for_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Register before looking at the store so a result landing in between is not missed
    let rx = state.results.register(&job_id);

    let finished = match state.store.get(&job_id).await {
        Ok(Some(record)) if record["status"] == STATUS_COMPLETED => record.get("result").cloned(),
        Ok(_) => None,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Failed to look up job record");
            None
        }
    };
    if finished.is_some() {
        debug!(job_id = %job_id, "Result already available");
    } else {
        info!(job_id = %job_id, "Client listening for result");
    }

    let result = stream::once(async move {
        match finished {
            Some(payload) => Some(payload),
            None => rx.await.ok(),
        }
    })
    .filter_map(|payload| async move {
        payload.map(|payload| Ok::<_, Infallible>(Event::default().data(payload.to_string())))
    });

    Sse::new(result).keep_alive(KeepAlive::default())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let broker = state.coordinator.connection_state();
    let status = if broker == ConnectionState::Connected {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "service": "job-dispatch",
        "broker": broker,
        "activeSessions": state.coordinator.active_count(),
        "maxActiveSessions": state.coordinator.max_active_sessions(),
        "buffered": state.coordinator.buffered(),
    }))
}
