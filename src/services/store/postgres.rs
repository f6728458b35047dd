//! Postgres-backed job store used by the polling queue.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{is_legal, JobStore, StatusCounts, StoreError, Transition};
use crate::db::queries;
use crate::models::job::{AnalysisJob, BatchProgress, JobId, NewJob};

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn require_uuid(id: &JobId) -> Result<Uuid, StoreError> {
    id.as_uuid().ok_or(StoreError::NotFound)
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> Result<AnalysisJob, StoreError> {
        let created = queries::create_job(&self.pool, Uuid::new_v4(), &job, now, now + expiry).await?;
        Ok(created)
    }

    async fn get(&self, id: &JobId, owner_id: &str) -> Result<Option<AnalysisJob>, StoreError> {
        let Some(uuid) = id.as_uuid() else {
            return Ok(None);
        };
        Ok(queries::get_job(&self.pool, uuid, owner_id).await?)
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        Ok(queries::list_jobs_for_owner(&self.pool, owner_id, limit).await?)
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
        Ok(queries::claim_jobs(&self.pool, limit as i64, now, now + lease).await?)
    }

    async fn transition(
        &self,
        id: &JobId,
        change: Transition,
        now: DateTime<Utc>,
    ) -> Result<AnalysisJob, StoreError> {
        if !is_legal(change.expected, change.to) {
            return Err(StoreError::IllegalTransition {
                from: change.expected,
                to: change.to,
            });
        }

        let uuid = require_uuid(id)?;
        match queries::transition_job(&self.pool, uuid, &change, now).await? {
            Some(job) => Ok(job),
            None => match queries::get_status(&self.pool, uuid).await? {
                Some(_) => Err(StoreError::Conflict { id: id.clone() }),
                None => Err(StoreError::NotFound),
            },
        }
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        claim_token: Uuid,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let uuid = require_uuid(id)?;
        if queries::renew_lease(&self.pool, uuid, claim_token, until).await? {
            Ok(())
        } else {
            Err(StoreError::Conflict { id: id.clone() })
        }
    }

    async fn report_progress(
        &self,
        id: &JobId,
        claim_token: Uuid,
        progress: BatchProgress,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let uuid = require_uuid(id)?;
        if queries::update_progress(&self.pool, uuid, claim_token, progress, now).await? {
            Ok(())
        } else {
            Err(StoreError::Conflict { id: id.clone() })
        }
    }

    async fn stale_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        Ok(queries::get_stale_leases(&self.pool, now, limit).await?)
    }

    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        Ok(queries::get_expired_pending(&self.pool, now, limit).await?)
    }

    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(queries::delete_terminal_before(&self.pool, completed_before, failed_before).await?)
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<StatusCounts, StoreError> {
        Ok(queries::count_jobs(&self.pool, now).await?)
    }

    async fn recent_failed(&self, limit: i64) -> Result<Vec<AnalysisJob>, StoreError> {
        Ok(queries::get_recent_failed(&self.pool, limit).await?)
    }

    async fn mark_resubmitted(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(id) = id.as_uuid() else {
            return Ok(false);
        };
        Ok(queries::mark_resubmitted(&self.pool, id, now).await?)
    }

    async fn delete_pending(&self) -> Result<u64, StoreError> {
        Ok(queries::delete_pending(&self.pool).await?)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
