use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::{
    AnalysisJob, BatchProgress, ImageInput, JobId, JobResult, JobStatus,
};

/// One image in a submission request.
#[derive(Debug, Deserialize, Validate)]
pub struct ImagePayload {
    #[garde(length(min = 1, max = 2048))]
    pub image_url: String,

    #[garde(length(max = 2048))]
    pub thumbnail_url: Option<String>,

    #[garde(length(min = 1))]
    pub image_base64: String,
}

impl From<ImagePayload> for ImageInput {
    fn from(p: ImagePayload) -> Self {
        ImageInput {
            image_url: p.image_url,
            thumbnail_url: p.thumbnail_url,
            image_base64: p.image_base64,
        }
    }
}

/// Request to analyze a single food photo.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateAnalysisRequest {
    #[garde(dive)]
    #[serde(flatten)]
    pub image: ImagePayload,

    #[garde(length(min = 1, max = 50))]
    pub meal_type: String,
}

/// Request to analyze several photos under one job.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateBatchRequest {
    #[garde(length(min = 1, max = 20), dive)]
    pub images: Vec<ImagePayload>,

    #[garde(length(min = 1, max = 50))]
    pub meal_type: String,
}

/// Response after submitting a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
}

/// Caller-visible projection of a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobDetail {
    pub job_id: JobId,
    pub status: JobStatus,
    pub meal_type: String,
    pub result: Option<JobResult>,
    pub meal_id: Option<String>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub progress: Option<BatchProgress>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<AnalysisJob> for JobDetail {
    fn from(job: AnalysisJob) -> Self {
        let meal_id = job.meal_id().map(str::to_string);
        JobDetail {
            job_id: job.id,
            status: job.status,
            meal_type: job.meal_type,
            result: job.result,
            meal_id,
            error: job.error,
            retry_count: job.retry_count,
            progress: job.progress,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RetryFailedQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetryFailedResponse {
    pub queue: String,
    pub resubmitted: Vec<JobId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub queue: String,
    pub removed: u64,
}
