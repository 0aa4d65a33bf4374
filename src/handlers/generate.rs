use axum::{Json, extract::State};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::ApiError;
use crate::models::{GenerateBody, GenerateResponse, GenerationRequest};
use crate::state::AppState;

// One-off generation: cache first, then the active backend
pub async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let prompt = body.prompt.trim();
    if prompt.is_empty() {
        return Err(ApiError::bad_request("prompt is empty"));
    }
    let request = match body.reference.as_deref().map(str::trim) {
        Some(reference) if !reference.is_empty() => {
            GenerationRequest::with_reference(prompt, reference)
        }
        _ => GenerationRequest::new(prompt),
    };

    let start_time = Instant::now();
    let (payload, cached) = state.runner.generate_once(&request).await?;
    info!(
        fingerprint = %request.fingerprint(),
        cached,
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "one-off generation finished"
    );

    Ok(Json(GenerateResponse {
        fingerprint: request.fingerprint(),
        payload,
        cached,
    }))
}
