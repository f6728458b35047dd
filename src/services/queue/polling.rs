//! Store-polling queue: the dispatcher periodically claims rows straight from
//! the job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::{JobQueue, QueueError, QueueSettings, QueueStats};
use crate::models::job::{AnalysisJob, BatchProgress, JobId, NewJob};
use crate::services::store::{JobStore, Transition};

pub struct PollingQueue {
    name: String,
    store: Arc<dyn JobStore>,
    settings: QueueSettings,
    /// Process-local; other instances keep claiming.
    paused: AtomicBool,
}

impl PollingQueue {
    pub fn new(name: impl Into<String>, store: Arc<dyn JobStore>, settings: QueueSettings) -> Self {
        Self {
            name: name.into(),
            store,
            settings,
            paused: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }
}

#[async_trait]
impl JobQueue for PollingQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn owns(&self, id: &JobId) -> bool {
        id.as_uuid().is_some()
    }

    async fn submit(&self, job: NewJob) -> Result<AnalysisJob, QueueError> {
        let created = self
            .store
            .create(job, Utc::now(), self.settings.job_expiry)
            .await?;
        tracing::info!(
            queue = %self.name,
            job_id = %created.id,
            owner_id = %created.owner_id,
            items = created.input.item_count(),
            "Job submitted"
        );
        Ok(created)
    }

    async fn claim(&self, limit: usize) -> Result<Vec<AnalysisJob>, QueueError> {
        if self.paused.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }
        Ok(self.store.claim(limit, Utc::now(), self.settings.lease).await?)
    }

    async fn transition(&self, id: &JobId, change: Transition) -> Result<AnalysisJob, QueueError> {
        Ok(self.store.transition(id, change, Utc::now()).await?)
    }

    async fn renew_lease(&self, id: &JobId, claim_token: Uuid) -> Result<(), QueueError> {
        let until = Utc::now() + self.settings.lease;
        Ok(self.store.renew_lease(id, claim_token, until).await?)
    }

    async fn report_progress(
        &self,
        id: &JobId,
        claim_token: Uuid,
        progress: BatchProgress,
    ) -> Result<(), QueueError> {
        Ok(self
            .store
            .report_progress(id, claim_token, progress, Utc::now())
            .await?)
    }

    async fn get(&self, id: &JobId, owner_id: &str) -> Result<Option<AnalysisJob>, QueueError> {
        Ok(self.store.get(id, owner_id).await?)
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, QueueError> {
        Ok(self.store.list_for_owner(owner_id, limit).await?)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let counts = self.store.counts(Utc::now()).await?;
        Ok(QueueStats {
            queue: self.name.clone(),
            waiting: counts.waiting,
            delayed: counts.delayed,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            paused: self.paused.load(Ordering::Acquire),
        })
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.paused.store(true, Ordering::Release);
        tracing::info!(queue = %self.name, "Queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.paused.store(false, Ordering::Release);
        tracing::info!(queue = %self.name, "Queue resumed");
        Ok(())
    }

    async fn clear(&self) -> Result<u64, QueueError> {
        let removed = self.store.delete_pending().await?;
        tracing::warn!(queue = %self.name, removed, "Queue cleared");
        Ok(removed)
    }

    async fn recent_failed(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError> {
        Ok(self.store.recent_failed(limit).await?)
    }

    async fn mark_resubmitted(&self, id: &JobId) -> Result<bool, QueueError> {
        Ok(self.store.mark_resubmitted(id, Utc::now()).await?)
    }

    async fn stale_leases(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError> {
        Ok(self.store.stale_leases(Utc::now(), limit).await?)
    }

    async fn expired_pending(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError> {
        Ok(self.store.expired_pending(Utc::now(), limit).await?)
    }

    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        Ok(self
            .store
            .purge_terminal(completed_before, failed_before)
            .await?)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(self.store.health_check().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{ImageInput, JobInput, JobStatus};
    use crate::services::queue::retry_failed;
    use crate::services::store::MemoryJobStore;

    fn queue() -> PollingQueue {
        PollingQueue::new(
            "analysis",
            Arc::new(MemoryJobStore::new()),
            QueueSettings::default(),
        )
    }

    fn new_job() -> NewJob {
        NewJob {
            owner_id: "owner".to_string(),
            input: JobInput::Single {
                image: ImageInput {
                    image_url: "https://cdn.example/x.jpg".to_string(),
                    thumbnail_url: None,
                    image_base64: "aGVsbG8=".to_string(),
                },
            },
            meal_type: "snack".to_string(),
            priority: 5,
        }
    }

    #[tokio::test]
    async fn test_paused_queue_claims_nothing() {
        let q = queue();
        q.submit(new_job()).await.unwrap();
        q.pause().await.unwrap();
        assert!(q.claim(5).await.unwrap().is_empty());
        assert!(q.stats().await.unwrap().paused);

        q.resume().await.unwrap();
        assert_eq!(q.claim(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_failed_leaves_original_terminal() {
        let q = queue();
        let job = q.submit(new_job()).await.unwrap();
        let claimed = q.claim(1).await.unwrap().remove(0);
        q.transition(
            &job.id,
            Transition::fail(claimed.claim_token.unwrap(), "bad image".into(), false),
        )
        .await
        .unwrap();

        let resubmitted = retry_failed(&q, 10).await.unwrap();
        assert_eq!(resubmitted.len(), 1);
        assert_ne!(resubmitted[0], job.id);

        let original = q.get(&job.id, "owner").await.unwrap().unwrap();
        assert_eq!(original.status, JobStatus::Failed);
        assert!(original.resubmitted_at.is_some());
        let copy = q.get(&resubmitted[0], "owner").await.unwrap().unwrap();
        assert_eq!(copy.status, JobStatus::Pending);
        assert_eq!(copy.input, original.input);
    }

    #[tokio::test]
    async fn test_retry_failed_resubmits_each_job_once() {
        let q = queue();
        let job = q.submit(new_job()).await.unwrap();
        let claimed = q.claim(1).await.unwrap().remove(0);
        q.transition(
            &job.id,
            Transition::fail(claimed.claim_token.unwrap(), "bad image".into(), false),
        )
        .await
        .unwrap();

        assert_eq!(retry_failed(&q, 10).await.unwrap().len(), 1);
        assert!(retry_failed(&q, 10).await.unwrap().is_empty());
        assert!(!q.mark_resubmitted(&job.id).await.unwrap());

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_only_failed_jobs_can_be_marked_resubmitted() {
        let q = queue();
        let job = q.submit(new_job()).await.unwrap();
        assert!(!q.mark_resubmitted(&job.id).await.unwrap());
        assert!(!q.mark_resubmitted(&JobId::from(Uuid::new_v4())).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_drops_only_pending() {
        let q = queue();
        q.submit(new_job()).await.unwrap();
        q.submit(new_job()).await.unwrap();
        q.claim(1).await.unwrap();

        assert_eq!(q.clear().await.unwrap(), 1);
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.active, 1);
    }
}
