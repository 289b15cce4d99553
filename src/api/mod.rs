//! API layer -- axum routes, handlers, and middleware.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::error::EngineError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

pub(crate) fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

/// Error response: `{"error": {"code", "message"}, "meta": …}`.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl From<crate::gate::GateError> for ApiError {
    fn from(err: crate::gate::GateError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            EngineError::Conflict(_) | EngineError::InvalidTransition(_) => {
                (StatusCode::CONFLICT, "conflict")
            }
            EngineError::Config(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_configuration"),
            EngineError::QueueClosed => (StatusCode::INTERNAL_SERVER_ERROR, "queue_closed"),
            EngineError::Transport(_)
            | EngineError::Llm(_)
            | EngineError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = Json(json!({
            "error": { "code": code, "message": self.0.to_string() },
            "meta": meta(),
        }));
        (status, body).into_response()
    }
}
