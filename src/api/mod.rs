use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::cluster::ClusterView;
use crate::error::ScootError;
use crate::scheduler::{JobDefinition, SchedulerHandle};

/// Shared state for the ingress handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: SchedulerHandle,
    pub cluster: ClusterView,
}

#[derive(Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub job_id: String,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
struct ClusterResponse {
    nodes: Vec<NodeResponse>,
}

#[derive(Serialize)]
struct NodeResponse {
    id: String,
    addr: String,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);
    Router::new()
        .route("/jobs", post(schedule_job))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/kill", post(kill_job))
        .route("/cluster", get(cluster_members))
        .layer(cors)
        .with_state(state)
}

/// Serve the ingress until the shutdown token fires.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn schedule_job(State(state): State<ApiState>, body: Bytes) -> Response {
    // Deserialize by hand so a malformed definition (bad JSON, unknown
    // priority, missing fields) rejects exactly like the other admission
    // failures instead of through the extractor's own response.
    let definition: JobDefinition = match serde_json::from_slice(&body) {
        Ok(definition) => definition,
        Err(e) => {
            return error_response(ScootError::InvalidJob(format!(
                "malformed job definition: {}",
                e
            )))
        }
    };
    match state.scheduler.schedule(definition).await {
        Ok(job_id) => (
            StatusCode::OK,
            Json(ScheduleResponse {
                job_id: job_id.to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn job_status(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let Ok(job_id) = id.parse::<Uuid>() else {
        return error_response(ScootError::InvalidJob(format!("bad job id {}", id)));
    };
    match state.scheduler.status(job_id).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn kill_job(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let Ok(job_id) = id.parse::<Uuid>() else {
        return error_response(ScootError::InvalidJob(format!("bad job id {}", id)));
    };
    match state.scheduler.kill(job_id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn cluster_members(State(state): State<ApiState>) -> Response {
    let nodes = state
        .cluster
        .members()
        .await
        .into_iter()
        .map(|n| NodeResponse {
            id: n.id.to_string(),
            addr: n.addr,
        })
        .collect();
    (StatusCode::OK, Json(ClusterResponse { nodes })).into_response()
}

fn error_response(e: ScootError) -> Response {
    let status = match &e {
        ScootError::InvalidJob(_) => StatusCode::BAD_REQUEST,
        ScootError::JobNotFound(_) => StatusCode::NOT_FOUND,
        ScootError::AlreadyTerminal(_) | ScootError::AlreadyStarted(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}
