//! In-process job store.
//!
//! Backs the `memory` queue backend and the test suite. A single write lock
//! around the job map makes every claim and transition atomic.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{apply, check, JobStore, StatusCounts, StoreError, Transition};
use crate::models::job::{AnalysisJob, BatchProgress, JobId, JobStatus, NewJob};

#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, AnalysisJob>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a job regardless of owner.
    pub async fn snapshot(&self, id: &JobId) -> Option<AnalysisJob> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> Result<AnalysisJob, StoreError> {
        let job = AnalysisJob::pending(JobId::from(Uuid::new_v4()), job, now, expiry);
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &JobId, owner_id: &str) -> Result<Option<AnalysisJob>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(id).filter(|j| j.owner_id == owner_id).cloned())
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut owned: Vec<AnalysisJob> = jobs
            .values()
            .filter(|j| j.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        owned.truncate(limit.max(0) as usize);
        Ok(owned)
    }

    async fn claim(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = self.jobs.write().await;
        let mut eligible: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .map(|j| (j.created_at, j.id.clone()))
            .collect();
        eligible.sort();
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.claim_token = Some(Uuid::new_v4());
                job.started_at = Some(now);
                job.lease_expires_at = Some(now + lease);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn transition(
        &self,
        id: &JobId,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<AnalysisJob, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(StoreError::NotFound)?;
        check(job, &change)?;
        apply(job, change, now);
        Ok(job.clone())
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        claim_token: Uuid,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(StoreError::NotFound)?;
        if job.status != JobStatus::Processing || job.claim_token != Some(claim_token) {
            return Err(StoreError::Conflict { id: id.clone() });
        }
        job.lease_expires_at = Some(until);
        Ok(())
    }

    async fn report_progress(
        &self,
        id: &JobId,
        claim_token: Uuid,
        progress: BatchProgress,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(StoreError::NotFound)?;
        if job.status != JobStatus::Processing || job.claim_token != Some(claim_token) {
            return Err(StoreError::Conflict { id: id.clone() });
        }
        job.progress = Some(progress);
        job.updated_at = now;
        Ok(())
    }

    async fn stale_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.lease_expires_at.is_some_and(|lease| lease < now)
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.expires_at <= now)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| match (j.status, j.completed_at) {
            (JobStatus::Completed, Some(at)) => at >= completed_before,
            (JobStatus::Failed, Some(at)) => at >= failed_before,
            _ => true,
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<StatusCounts, StoreError> {
        let jobs = self.jobs.read().await;
        let mut counts = StatusCounts::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending if job.expires_at <= now => {}
                JobStatus::Pending if job.available_at > now => counts.delayed += 1,
                JobStatus::Pending => counts.waiting += 1,
                JobStatus::Processing => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn recent_failed(&self, limit: i64) -> Result<Vec<AnalysisJob>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut failed: Vec<AnalysisJob> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed && j.resubmitted_at.is_none())
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }

    async fn mark_resubmitted(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Failed && job.resubmitted_at.is_none() => {
                job.resubmitted_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_pending(&self) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| j.status != JobStatus::Pending);
        Ok((before - jobs.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
