use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::analysis::{AnalysisResult, BatchItemOutcome};

/// Opaque job identifier.
///
/// Polling-backend ids are bare hyphenated UUIDs. Broker-backend ids carry the
/// name of the queue that owns them: `<queue>-<uuid simple>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The UUID form of a polling-backend id.
    pub fn as_uuid(&self) -> Option<Uuid> {
        if self.0.len() != 36 {
            return None;
        }
        Uuid::parse_str(&self.0).ok()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id.hyphenated().to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of an analysis job.
///
/// `Pending -> Processing -> {Completed | Failed}`, with `Processing -> Pending`
/// for retries. `Completed` and `Failed` are terminal.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Reference to one food photo. Opaque to the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageInput {
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    /// Base64-encoded image bytes handed to the analysis service.
    pub image_base64: String,
}

impl ImageInput {
    pub fn decode_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(self.image_base64.trim())
    }
}

/// What a job analyzes: one photo, or a batch processed sequentially.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobInput {
    Single { image: ImageInput },
    Batch { images: Vec<ImageInput> },
}

impl JobInput {
    pub fn item_count(&self) -> usize {
        match self {
            JobInput::Single { .. } => 1,
            JobInput::Batch { images } => images.len(),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, JobInput::Batch { .. })
    }
}

/// Output stored on a `Completed` job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobResult {
    Single {
        analysis: AnalysisResult,
        meal_id: String,
    },
    Batch {
        items: Vec<BatchItemOutcome>,
    },
}

/// Incremental progress of a batch job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchProgress {
    pub processed: u32,
    pub total: u32,
}

/// Submission parameters for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: String,
    pub input: JobInput,
    pub meal_type: String,
    pub priority: i32,
}

/// An image analysis job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: JobId,
    pub owner_id: String,
    pub input: JobInput,
    pub meal_type: String,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub retry_count: i32,
    /// Lower is served first.
    pub priority: i32,
    pub progress: Option<BatchProgress>,
    /// Fencing token of the current claim. Set only while `Processing`.
    pub claim_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    /// Earliest instant a `Pending` job may be claimed (retry backoff).
    pub available_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// When an admin resubmitted a copy of this failed job.
    #[serde(default)]
    pub resubmitted_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    /// Build a fresh `Pending` job.
    pub fn pending(id: JobId, new: NewJob, now: DateTime<Utc>, expiry: chrono::Duration) -> Self {
        let progress = match &new.input {
            JobInput::Batch { images } => Some(BatchProgress {
                processed: 0,
                total: images.len() as u32,
            }),
            JobInput::Single { .. } => None,
        };

        Self {
            id,
            owner_id: new.owner_id,
            input: new.input,
            meal_type: new.meal_type,
            status: JobStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            priority: new.priority,
            progress,
            claim_token: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            expires_at: now + expiry,
            available_at: now,
            lease_expires_at: None,
            updated_at: now,
            resubmitted_at: None,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.expires_at > now && self.available_at <= now
    }

    pub fn meal_id(&self) -> Option<&str> {
        match &self.result {
            Some(JobResult::Single { meal_id, .. }) => Some(meal_id),
            _ => None,
        }
    }
}
