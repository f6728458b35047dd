//! Job queue capability shared by the polling and broker backends.
//!
//! Both backends expose the same lifecycle (`Pending -> Processing ->
//! {Completed | Failed}`, retries back to `Pending`) so callers cannot tell
//! which one served a job except by its id format.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::{AnalysisJob, BatchProgress, JobId, JobInput, JobStatus, NewJob};
use crate::services::store::{StoreError, Transition};

pub mod broker;
pub mod polling;

pub use broker::BrokerQueue;
pub use polling::PollingQueue;

/// Timing knobs common to every backend.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// How long a job may stay `Pending` before it is no longer claimable.
    pub job_expiry: chrono::Duration,
    /// How long a claim stays valid without a heartbeat.
    pub lease: chrono::Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            job_expiry: chrono::Duration::hours(24),
            lease: chrono::Duration::minutes(2),
        }
    }
}

/// Counts reported by the admin surface.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: String,
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a job id was minted by this queue.
    fn owns(&self, id: &JobId) -> bool;

    async fn submit(&self, job: NewJob) -> Result<AnalysisJob, QueueError>;

    /// Claim up to `limit` jobs for exclusive execution by the caller.
    async fn claim(&self, limit: usize) -> Result<Vec<AnalysisJob>, QueueError>;

    async fn transition(&self, id: &JobId, change: Transition) -> Result<AnalysisJob, QueueError>;

    async fn renew_lease(&self, id: &JobId, claim_token: Uuid) -> Result<(), QueueError>;

    async fn report_progress(
        &self,
        id: &JobId,
        claim_token: Uuid,
        progress: BatchProgress,
    ) -> Result<(), QueueError>;

    async fn get(&self, id: &JobId, owner_id: &str) -> Result<Option<AnalysisJob>, QueueError>;

    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    async fn pause(&self) -> Result<(), QueueError>;

    async fn resume(&self) -> Result<(), QueueError>;

    /// Drop every job that is still `Pending`.
    async fn clear(&self) -> Result<u64, QueueError>;

    /// Newest `Failed` jobs not yet resubmitted.
    async fn recent_failed(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError>;

    /// Claim the right to resubmit a failed job. `false` means another caller
    /// already did, or the job is not `Failed`.
    async fn mark_resubmitted(&self, id: &JobId) -> Result<bool, QueueError>;

    async fn stale_leases(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError>;

    async fn expired_pending(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError>;

    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Resubmit copies of the most recent failed jobs as fresh `Pending` jobs.
///
/// The originals keep their `Failed` status and are marked as resubmitted
/// before the copy is queued, so each one is resubmitted at most once.
pub async fn retry_failed(queue: &dyn JobQueue, limit: usize) -> Result<Vec<JobId>, QueueError> {
    let failed = queue.recent_failed(limit as i64).await?;
    let mut resubmitted = Vec::with_capacity(failed.len());

    for job in failed {
        if !queue.mark_resubmitted(&job.id).await? {
            continue;
        }
        let copy = queue
            .submit(NewJob {
                owner_id: job.owner_id,
                input: job.input,
                meal_type: job.meal_type,
                priority: job.priority,
            })
            .await?;
        tracing::info!(
            queue = queue.name(),
            failed_job_id = %job.id,
            job_id = %copy.id,
            "Resubmitted failed job"
        );
        resubmitted.push(copy.id);
    }

    Ok(resubmitted)
}

/// The named queues of the configured backend.
#[derive(Clone)]
pub struct QueueRegistry {
    queues: Vec<Arc<dyn JobQueue>>,
    single: usize,
    batch: usize,
}

impl QueueRegistry {
    /// One queue serving single and batch jobs.
    pub fn single(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queues: vec![queue],
            single: 0,
            batch: 0,
        }
    }

    /// Separate queues for single and batch jobs.
    pub fn split(single: Arc<dyn JobQueue>, batch: Arc<dyn JobQueue>) -> Self {
        Self {
            queues: vec![single, batch],
            single: 0,
            batch: 1,
        }
    }

    pub fn all(&self) -> &[Arc<dyn JobQueue>] {
        &self.queues
    }

    pub fn by_name(&self, name: &str) -> Result<&Arc<dyn JobQueue>, QueueError> {
        self.queues
            .iter()
            .find(|q| q.name() == name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    pub fn for_input(&self, input: &JobInput) -> &Arc<dyn JobQueue> {
        if input.is_batch() {
            &self.queues[self.batch]
        } else {
            &self.queues[self.single]
        }
    }

    pub fn for_id(&self, id: &JobId) -> Option<&Arc<dyn JobQueue>> {
        self.queues.iter().find(|q| q.owns(id))
    }

    pub async fn submit(&self, job: NewJob) -> Result<AnalysisJob, QueueError> {
        let queue = self.for_input(&job.input);
        let created = queue.submit(job).await?;
        metrics::counter!("analysis_jobs_submitted_total", "queue" => queue.name().to_string())
            .increment(1);
        Ok(created)
    }

    pub async fn get(&self, id: &JobId, owner_id: &str) -> Result<Option<AnalysisJob>, QueueError> {
        match self.for_id(id) {
            Some(queue) => queue.get(id, owner_id).await,
            None => Ok(None),
        }
    }

    /// Newest first across every queue.
    pub async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, QueueError> {
        let mut jobs = Vec::new();
        for queue in &self.queues {
            jobs.extend(queue.list_for_owner(owner_id, limit).await?);
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job not found")]
    NotFound,

    #[error("Job {id} is no longer in the expected state")]
    Conflict { id: JobId },

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl QueueError {
    /// The backing store or broker is unavailable or misbehaving.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            QueueError::Database(_)
                | QueueError::Redis(_)
                | QueueError::Serialize(_)
                | QueueError::Corrupt { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, QueueError::Conflict { .. } | QueueError::NotFound)
    }
}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => QueueError::NotFound,
            StoreError::Conflict { id } => QueueError::Conflict { id },
            StoreError::IllegalTransition { from, to } => QueueError::IllegalTransition { from, to },
            StoreError::Database(e) => QueueError::Database(e),
        }
    }
}
