use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::api::{
    CreateAnalysisRequest, CreateBatchRequest, JobDetail, ListQuery, SubmitResponse,
};
use crate::models::job::{ImageInput, JobId, JobInput, NewJob};
use crate::models::tier::ServiceTier;
use crate::routes::error::ApiError;

const OWNER_HEADER: &str = "x-owner-id";
const TIER_HEADER: &str = "x-service-tier";
const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

/// Identity forwarded by the gateway.
#[derive(Debug, Clone)]
pub struct Caller {
    pub owner_id: String,
    pub tier: ServiceTier,
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner_id = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {OWNER_HEADER} header")))?;

        let tier = ServiceTier::from_header(
            parts.headers.get(TIER_HEADER).and_then(|v| v.to_str().ok()),
        );

        Ok(Caller {
            owner_id: owner_id.to_string(),
            tier,
        })
    }
}

/// POST /api/v1/analysis — queue one photo for analysis.
pub async fn submit_analysis(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateAnalysisRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    req.validate()?;

    let job = state
        .queues
        .submit(NewJob {
            owner_id: caller.owner_id,
            input: JobInput::Single {
                image: req.image.into(),
            },
            meal_type: req.meal_type,
            priority: caller.tier.priority(),
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            status: job.status,
            total: None,
        }),
    ))
}

/// POST /api/v1/analysis/batch — queue several photos as one job.
pub async fn submit_batch(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateBatchRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    req.validate()?;

    let images: Vec<ImageInput> = req.images.into_iter().map(ImageInput::from).collect();
    let total = images.len() as u32;

    let job = state
        .queues
        .submit(NewJob {
            owner_id: caller.owner_id,
            input: JobInput::Batch { images },
            meal_type: req.meal_type,
            priority: caller.tier.priority(),
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            status: job.status,
            total: Some(total),
        }),
    ))
}

/// GET /api/v1/analysis/{job_id} — status of a job owned by the caller.
pub async fn get_job(
    State(state): State<AppState>,
    caller: Caller,
    Path(job_id): Path<String>,
) -> Result<Json<JobDetail>, ApiError> {
    let job = state
        .queues
        .get(&JobId::new(job_id), &caller.owner_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(job.into()))
}

/// GET /api/v1/analysis — the caller's jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobDetail>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let jobs = state.queues.list_for_owner(&caller.owner_id, limit).await?;
    Ok(Json(jobs.into_iter().map(JobDetail::from).collect()))
}
