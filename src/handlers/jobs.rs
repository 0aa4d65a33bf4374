use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use std::sync::Arc;

use super::ApiError;
use crate::models::{Fingerprint, JobRecord, JobStatus};
use crate::scheduler::DrainSummary;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct JobQuery {
    #[serde(default)]
    pub wait: bool,
}

pub async fn job_handler(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
    Query(query): Query<JobQuery>,
) -> Result<Json<JobRecord>, ApiError> {
    let fingerprint = Fingerprint::from(fingerprint);
    let mut record = None;
    if query.wait {
        record = state.dispatcher.await_record(&fingerprint).await;
    }
    // waiting gave up: report whatever state the job is in
    record
        .or_else(|| state.runner.record(&fingerprint))
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no job {}", fingerprint)))
}

pub async fn retry_handler(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let fingerprint = Fingerprint::from(fingerprint);
    let Some(record) = state.runner.record(&fingerprint) else {
        return Err(ApiError::not_found(format!("no job {}", fingerprint)));
    };
    if record.status != JobStatus::Failed || !state.dispatcher.retry(&fingerprint) {
        return Err(ApiError::conflict(format!(
            "job {} is {:?}, only failed jobs can be retried",
            fingerprint, record.status
        )));
    }
    state
        .runner
        .record(&fingerprint)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no job {}", fingerprint)))
}

pub async fn backlog_handler(State(state): State<Arc<AppState>>) -> Json<DrainSummary> {
    Json(state.scheduler.drain_pending().await)
}
