use axum::extract::{Path, Query, State};
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::{ClearResponse, RetryFailedQuery, RetryFailedResponse};
use crate::routes::error::ApiError;
use crate::services::queue::{self, QueueStats};

const DEFAULT_RETRY_LIMIT: usize = 100;
const MAX_RETRY_LIMIT: usize = 1000;

/// GET /api/v1/admin/queues
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<Vec<QueueStats>>, ApiError> {
    let mut stats = Vec::with_capacity(state.queues.all().len());
    for q in state.queues.all() {
        stats.push(q.stats().await?);
    }
    Ok(Json(stats))
}

/// POST /api/v1/admin/queues/{name}/pause
pub async fn pause_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<QueueStats>, ApiError> {
    let q = state.queues.by_name(&name)?;
    q.pause().await?;
    Ok(Json(q.stats().await?))
}

/// POST /api/v1/admin/queues/{name}/resume
pub async fn resume_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<QueueStats>, ApiError> {
    let q = state.queues.by_name(&name)?;
    q.resume().await?;
    Ok(Json(q.stats().await?))
}

/// POST /api/v1/admin/queues/{name}/clear — drop every pending job.
pub async fn clear_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ClearResponse>, ApiError> {
    let q = state.queues.by_name(&name)?;
    let removed = q.clear().await?;
    Ok(Json(ClearResponse {
        queue: name,
        removed,
    }))
}

/// POST /api/v1/admin/queues/{name}/retry-failed?limit=N
pub async fn retry_failed(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RetryFailedQuery>,
) -> Result<Json<RetryFailedResponse>, ApiError> {
    let q = state.queues.by_name(&name)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RETRY_LIMIT)
        .clamp(1, MAX_RETRY_LIMIT);
    let resubmitted = queue::retry_failed(q.as_ref(), limit).await?;
    Ok(Json(RetryFailedResponse {
        queue: name,
        resubmitted,
    }))
}
