//! REST endpoints for submitting and inspecting jobs.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, JobError};
use crate::jobs::{CheckVariant, JobEngine, JobKind};

/// Config label used when a request does not name one.
pub const DEFAULT_CONFIG: &str = "config.yaml";

const DEFAULT_LIMIT: usize = 50;

type ApiResponse = (StatusCode, Json<Value>);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<JobEngine>,
}

/// Build the Axum router with the job REST routes.
pub fn job_routes(engine: Arc<JobEngine>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/health", get(health))
        .route("/api/backup-create", post(create_backup))
        .route("/api/prune", post(prune))
        .route("/api/check", post(check))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job).delete(delete_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "dashborg"
    }))
}

// ── Submission ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateRequest {
    config: Option<String>,
}

#[derive(Deserialize)]
struct PruneRequest {
    config: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Deserialize)]
struct CheckRequest {
    config: Option<String>,
    variant: Option<String>,
}

async fn create_backup(
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> impl IntoResponse {
    submit(&state, JobKind::CreateBackup, body.config, "Backup job started").await
}

async fn prune(State(state): State<AppState>, Json(body): Json<PruneRequest>) -> impl IntoResponse {
    let (kind, message) = if body.dry_run {
        (JobKind::PruneDryRun, "Prune dry run started")
    } else {
        (JobKind::Prune, "Prune job started")
    };
    submit(&state, kind, body.config, message).await
}

async fn check(State(state): State<AppState>, Json(body): Json<CheckRequest>) -> impl IntoResponse {
    let variant = match body.variant.as_deref() {
        None => CheckVariant::Repository,
        Some(raw) => match raw.parse::<CheckVariant>() {
            Ok(variant) => variant,
            Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({"error": e}))),
        },
    };
    submit(&state, JobKind::Check(variant), body.config, "Check job started").await
}

async fn submit(
    state: &AppState,
    kind: JobKind,
    config: Option<String>,
    message: &str,
) -> ApiResponse {
    let config = config.unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    match state.engine.submit_kind(kind, &config).await {
        Ok(job_id) => {
            info!(job_id = %job_id, kind = %kind, config = %config, "Job accepted via API");
            (
                StatusCode::OK,
                Json(json!({"job_id": job_id, "message": message})),
            )
        }
        Err(Error::Config(e)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        ),
        Err(e) => {
            warn!(kind = %kind, error = %e, "Job submission failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

// ── Queries ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let jobs = state
        .engine
        .list_jobs(
            params.limit.unwrap_or(DEFAULT_LIMIT),
            params.offset.unwrap_or(0),
        )
        .await;
    Json(jobs)
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.engine.get_job(job_id).await {
        Ok(job) => (StatusCode::OK, Json(json!(job))),
        Err(e) => job_error(e),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.engine.cancel_job(job_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"message": "Job cancellation requested"})),
        ),
        Err(e) => job_error(e),
    }
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.engine.delete_job(job_id).await {
        Ok(()) => {
            info!(job_id = %job_id, "Job deleted via API");
            (StatusCode::OK, Json(json!({"message": "Job deleted"})))
        }
        Err(e) => job_error(e),
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid job ID"})),
        )
    })
}

fn job_error(e: JobError) -> ApiResponse {
    let status = match e {
        JobError::NotFound { .. } => StatusCode::NOT_FOUND,
        JobError::InvalidTransition { .. } => StatusCode::CONFLICT,
        JobError::Duplicate { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()})))
}
