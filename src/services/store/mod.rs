//! Durable record of job lifecycle state.
//!
//! The store is the single shared mutable resource of the pipeline. Every
//! mutation after creation goes through [`JobStore::transition`], a
//! compare-and-set on the job's current status (and, while `Processing`, its
//! claim token), so two callers can never apply conflicting transitions.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::job::{AnalysisJob, BatchProgress, JobId, JobResult, JobStatus, NewJob};

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

/// A conditional status change.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Status the job must currently be in.
    pub expected: JobStatus,
    /// Claim token the job must currently hold. Ignored when `None`.
    pub claim_token: Option<Uuid>,
    pub to: JobStatus,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub increment_retry: bool,
    /// New visibility instant for a job returning to `Pending`.
    pub available_at: Option<DateTime<Utc>>,
}

impl Transition {
    pub fn complete(claim_token: Uuid, result: JobResult) -> Self {
        Self {
            expected: JobStatus::Processing,
            claim_token: Some(claim_token),
            to: JobStatus::Completed,
            result: Some(result),
            error: None,
            increment_retry: false,
            available_at: None,
        }
    }

    /// Failed attempt that goes back to `Pending` after a backoff delay.
    pub fn retry(claim_token: Uuid, error: String, available_at: DateTime<Utc>) -> Self {
        Self {
            expected: JobStatus::Processing,
            claim_token: Some(claim_token),
            to: JobStatus::Pending,
            result: None,
            error: Some(error),
            increment_retry: true,
            available_at: Some(available_at),
        }
    }

    /// Terminal failure of a claimed job.
    pub fn fail(claim_token: Uuid, error: String, increment_retry: bool) -> Self {
        Self {
            expected: JobStatus::Processing,
            claim_token: Some(claim_token),
            to: JobStatus::Failed,
            result: None,
            error: Some(error),
            increment_retry,
            available_at: None,
        }
    }

    /// Terminal failure of a job that never got claimed.
    pub fn expire(error: String) -> Self {
        Self {
            expected: JobStatus::Pending,
            claim_token: None,
            to: JobStatus::Failed,
            result: None,
            error: Some(error),
            increment_retry: false,
            available_at: None,
        }
    }

    /// Hand a claimed job back without counting an attempt.
    pub fn release(claim_token: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            expected: JobStatus::Processing,
            claim_token: Some(claim_token),
            to: JobStatus::Pending,
            result: None,
            error: None,
            increment_retry: false,
            available_at: Some(now),
        }
    }
}

/// Whether `from -> to` is an edge of the job lifecycle.
pub fn is_legal(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Pending, Failed)
            | (Processing, Pending)
            | (Processing, Completed)
            | (Processing, Failed)
    )
}

/// Apply a validated transition to an in-memory job record.
pub(crate) fn apply(job: &mut AnalysisJob, change: Transition, now: DateTime<Utc>) {
    job.status = change.to;
    if let Some(result) = change.result {
        job.result = Some(result);
    }
    if let Some(error) = change.error {
        job.error = Some(error);
    }
    if change.increment_retry {
        job.retry_count += 1;
    }
    if let Some(at) = change.available_at {
        job.available_at = at;
    }
    if change.to != JobStatus::Processing {
        job.claim_token = None;
        job.lease_expires_at = None;
    }
    job.completed_at = if change.to.is_terminal() { Some(now) } else { None };
    job.updated_at = now;
}

/// Check a transition against the job's current state.
pub(crate) fn check(job: &AnalysisJob, change: &Transition) -> Result<(), StoreError> {
    if !is_legal(change.expected, change.to) {
        return Err(StoreError::IllegalTransition {
            from: change.expected,
            to: change.to,
        });
    }
    if job.status != change.expected {
        return Err(StoreError::Conflict { id: job.id.clone() });
    }
    if let Some(token) = change.claim_token {
        if job.claim_token != Some(token) {
            return Err(StoreError::Conflict { id: job.id.clone() });
        }
    }
    Ok(())
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// `Pending`, visible and unexpired.
    pub waiting: u64,
    /// `Pending`, hidden by retry backoff.
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `Pending` job with `expires_at = now + expiry`.
    async fn create(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> Result<AnalysisJob, StoreError>;

    /// Fetch a job, visible only to its owner.
    async fn get(&self, id: &JobId, owner_id: &str) -> Result<Option<AnalysisJob>, StoreError>;

    /// Newest first.
    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, StoreError>;

    /// Atomically move up to `limit` claimable jobs, oldest first, to
    /// `Processing`. Rows held by a concurrent claimer are skipped, never
    /// waited on.
    async fn claim(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<AnalysisJob>, StoreError>;

    async fn transition(
        &self,
        id: &JobId,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<AnalysisJob, StoreError>;

    async fn renew_lease(
        &self,
        id: &JobId,
        claim_token: Uuid,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn report_progress(
        &self,
        id: &JobId,
        claim_token: Uuid,
        progress: BatchProgress,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// `Processing` jobs whose lease ran out before `now`.
    async fn stale_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, StoreError>;

    /// `Pending` jobs past their `expires_at`.
    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, StoreError>;

    /// Delete terminal jobs that finished before their retention cutoff.
    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn counts(&self, now: DateTime<Utc>) -> Result<StatusCounts, StoreError>;

    /// Most recently failed jobs first, skipping those already resubmitted.
    async fn recent_failed(&self, limit: i64) -> Result<Vec<AnalysisJob>, StoreError>;

    /// Stamp `resubmitted_at` on a `Failed` job. Returns `false` if the job is
    /// not failed or was already marked.
    async fn mark_resubmitted(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Drop every job still `Pending`.
    async fn delete_pending(&self) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found")]
    NotFound,

    #[error("Job {id} is no longer in the expected state")]
    Conflict { id: JobId },

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Storage is unreachable or misbehaving, as opposed to a lost race.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}
