//! HTTP control surface for the job queue.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::queue::{JobQueue, StopOutcome};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    /// Drain timeout when a stop request does not name one.
    pub stop_timeout: Duration,
}

/// Build the Axum router with the queue control routes.
pub fn queue_routes(queue: Arc<JobQueue>, stop_timeout: Duration) -> Router {
    let state = AppState {
        queue,
        stop_timeout,
    };

    Router::new()
        .route("/health", get(health))
        .route("/queue/start", get(start_queue))
        .route("/queue/stop", get(stop_queue))
        .route("/queue/status", get(queue_status))
        .route("/queue/chains/{id}", get(chain_status))
        .route("/queue/inject", post(inject_chain))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "harvest-agent",
        "queue": state.queue.status(),
    }))
}

// ── Lifecycle ───────────────────────────────────────────────────────────

async fn start_queue(State(state): State<AppState>) -> impl IntoResponse {
    let response = state.queue.start().await;
    let code = if response.result {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (code, Json(response))
}

#[derive(Debug, Deserialize)]
struct StopParams {
    #[serde(default = "default_finish")]
    finish_running_jobs: bool,
    /// Seconds to wait for admitted chains.
    timeout: Option<f64>,
}

fn default_finish() -> bool {
    true
}

async fn stop_queue(
    State(state): State<AppState>,
    Query(params): Query<StopParams>,
) -> impl IntoResponse {
    let timeout = match params.timeout {
        None => state.stop_timeout,
        Some(secs) => match Duration::try_from_secs_f64(secs) {
            Ok(timeout) => timeout,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("Invalid timeout: {secs}")})),
                );
            }
        },
    };

    info!(finish_running_jobs = params.finish_running_jobs, ?timeout, "Stop requested");
    let response = state.queue.stop(params.finish_running_jobs, timeout).await;
    let code = match response.outcome {
        StopOutcome::Drained => StatusCode::OK,
        StopOutcome::TimedOut => StatusCode::ACCEPTED,
        StopOutcome::Rejected => StatusCode::CONFLICT,
    };
    (code, Json(json!(response)))
}

// ── Status ──────────────────────────────────────────────────────────────

async fn queue_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.queue.detailed_status().await)
}

async fn chain_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.queue.chain_status(&id).await {
        Ok(progress) => (StatusCode::OK, Json(json!({ id: progress }))),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))),
    }
}

// ── Inject ──────────────────────────────────────────────────────────────

async fn inject_chain(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match state.queue.inject(&body).await {
        Ok(admission) => (
            StatusCode::OK,
            Json(json!({"id": admission.id, "name": admission.chain.name()})),
        ),
        Err(e) => {
            warn!(error = %e, "Inject rejected");
            (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})))
        }
    }
}
