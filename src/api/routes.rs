//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::{meta, ApiError};
use crate::model::{ConfirmationFilter, ConfirmationResponse, RunFilter, RunRequest};

type ApiResult = Result<Json<Value>, ApiError>;

/// Header set by the authentication layer in front of the engine.
const USER_HEADER: &str = "x-user-id";

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs).post(create_run))
        .route("/runs/{id}", get(get_run).delete(delete_run))
        .route("/runs/{id}/pause", post(pause_run))
        .route("/runs/{id}/resume", post(resume_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/executions", get(run_executions))
        .route("/runs/{id}/logs", get(run_logs))
        .route("/confirmations", get(list_confirmations))
        .route("/confirmations/{id}", get(get_confirmation))
        .route("/confirmations/{id}/respond", post(respond_confirmation))
}

fn envelope(data: impl serde::Serialize) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta() }))
}

fn acting_user(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn health(State(state): State<AppState>) -> ApiResult {
    let queue = state.queue.snapshot().await?;
    Ok(envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "queue": queue,
    })))
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

async fn list_runs(State(state): State<AppState>, Query(filter): Query<RunFilter>) -> ApiResult {
    let runs = state.queue.list(&filter)?;
    let total = runs.len();
    Ok(Json(json!({
        "data": runs,
        "meta": { "total": total, "timestamp": chrono::Utc::now().to_rfc3339() },
    })))
}

async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<RunRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if request.supervisor.is_none() {
        request.supervisor = acting_user(&headers);
    }
    let run = state.queue.enqueue(request).await?;
    Ok((StatusCode::CREATED, envelope(run)))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(envelope(state.queue.get(&id)?))
}

async fn delete_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.queue.delete(&id).await?;
    Ok(envelope(json!({ "deleted": id })))
}

async fn pause_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(envelope(state.queue.pause(&id).await?))
}

async fn resume_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(envelope(state.queue.resume(&id).await?))
}

async fn cancel_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let user = acting_user(&headers);
    Ok(envelope(state.queue.cancel(&id, user.as_deref()).await?))
}

async fn run_executions(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(envelope(state.queue.executions(&id)?))
}

#[derive(Debug, Default, Deserialize)]
struct LogQuery {
    /// Only entries with a larger id.
    after: Option<i64>,
    limit: Option<u32>,
}

async fn run_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult {
    Ok(envelope(state.queue.logs(&id, query.after, query.limit)?))
}

// ---------------------------------------------------------------------------
// Confirmations
// ---------------------------------------------------------------------------

async fn list_confirmations(
    State(state): State<AppState>,
    Query(filter): Query<ConfirmationFilter>,
) -> ApiResult {
    let requests = state.gate.list(&filter)?;
    let total = requests.len();
    Ok(Json(json!({
        "data": requests,
        "meta": { "total": total, "timestamp": chrono::Utc::now().to_rfc3339() },
    })))
}

async fn get_confirmation(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(envelope(state.gate.get(&id)?))
}

async fn respond_confirmation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(mut response): Json<ConfirmationResponse>,
) -> ApiResult {
    if response.responder.is_none() {
        response.responder = acting_user(&headers);
    }
    Ok(envelope(state.gate.resolve(&id, response).await?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
