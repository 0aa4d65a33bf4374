use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::Json;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use super::ApiError;
use crate::models::ReferenceImage;
use crate::state::AppState;

// Registers a named reference image from the raw request body
pub async fn reference_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let name = name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(ApiError::bad_request("invalid reference name"));
    }
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(str::trim)
        .filter(|value| value.starts_with("image/"))
        .ok_or_else(|| ApiError::bad_request("content type must be image/*"))?
        .to_string();
    if body.is_empty() {
        return Err(ApiError::bad_request("empty image"));
    }

    info!(name, bytes = body.len(), %mime_type, "reference image registered");
    state.references.insert(ReferenceImage {
        name: name.to_string(),
        data: body.to_vec(),
        mime_type: mime_type.clone(),
    });
    Ok(Json(json!({
        "name": name,
        "bytes": body.len(),
        "mime_type": mime_type,
    })))
}
