mod events;
mod generate;
mod health;
mod jobs;
mod metrics;
mod references;
mod streams;

pub use events::events_handler;
pub use generate::generate_handler;
pub use health::health_handler;
pub use jobs::{backlog_handler, job_handler, retry_handler};
pub use metrics::metrics_handler;
pub use references::reference_handler;
pub use streams::{begin_handler, delta_handler, end_handler, snapshot_handler, sse_handler};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use std::sync::Arc;

use crate::backend::BackendError;
use crate::models::ErrorClass;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/api/streams/{id}",
            post(snapshot_handler).put(begin_handler).delete(end_handler),
        )
        .route("/api/streams/{id}/delta", post(delta_handler))
        .route("/api/streams/{id}/sse", post(sse_handler))
        .route("/api/jobs/{fingerprint}", get(job_handler))
        .route("/api/jobs/{fingerprint}/retry", post(retry_handler))
        .route("/api/backlog", post(backlog_handler))
        .route("/api/references/{name}", put(reference_handler))
        .route("/api/events", get(events_handler))
        .route("/api/generate", post(generate_handler))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    class: Option<ErrorClass>,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            class: None,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            class: None,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            class: None,
            message: message.into(),
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        let status = match &err {
            BackendError::MissingReference(_) => StatusCode::BAD_REQUEST,
            BackendError::MissingCredential(_) | BackendError::MissingEndpoint(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BackendError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BackendError::NoResultProduced(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BackendError::Http { .. }
            | BackendError::Transport(_)
            | BackendError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            class: Some(err.class()),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "class": self.class,
        });
        (self.status, Json(body)).into_response()
    }
}
