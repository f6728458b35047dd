//! Periodic housekeeping: retention purge, pending expiry and stale leases.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::services::queue::{JobQueue, QueueError};
use crate::services::retry::{FailureKind, RetryDecision, RetryPolicy};
use crate::services::store::Transition;

const SWEEP_BATCH: i64 = 500;

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed: chrono::Duration,
    pub failed: chrono::Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: chrono::Duration::hours(24),
            failed: chrono::Duration::days(7),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub purged: u64,
    pub expired: u64,
    pub requeued: u64,
    pub failed: u64,
}

pub struct Maintenance {
    queues: Vec<Arc<dyn JobQueue>>,
    retention: RetentionPolicy,
    policy: RetryPolicy,
}

impl Maintenance {
    pub fn new(queues: Vec<Arc<dyn JobQueue>>, retention: RetentionPolicy, policy: RetryPolicy) -> Self {
        Self {
            queues,
            retention,
            policy,
        }
    }

    /// Run every task against every queue. Errors are logged per queue.
    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for queue in &self.queues {
            match self.purge(queue.as_ref(), now).await {
                Ok(n) => report.purged += n,
                Err(e) => error!(queue = queue.name(), error = %e, "Retention purge failed"),
            }
            match expire_pending(queue.as_ref()).await {
                Ok(n) => report.expired += n,
                Err(e) => error!(queue = queue.name(), error = %e, "Pending expiry failed"),
            }
            match self.reap_stale_leases(queue.as_ref()).await {
                Ok((requeued, failed)) => {
                    report.requeued += requeued;
                    report.failed += failed;
                }
                Err(e) => error!(queue = queue.name(), error = %e, "Lease reaping failed"),
            }
        }

        if report != SweepReport::default() {
            info!(
                purged = report.purged,
                expired = report.expired,
                requeued = report.requeued,
                failed = report.failed,
                "Maintenance sweep finished"
            );
        }
        report
    }

    /// Delete terminal jobs older than their retention window, measured from
    /// `now`.
    pub async fn purge(&self, queue: &dyn JobQueue, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let removed = queue
            .purge_terminal(now - self.retention.completed, now - self.retention.failed)
            .await?;
        if removed > 0 {
            metrics::counter!("analysis_jobs_purged_total", "queue" => queue.name().to_string())
                .increment(removed);
        }
        Ok(removed)
    }

    /// Return jobs whose lease lapsed to `Pending`, counting the lost attempt.
    pub async fn reap_stale_leases(&self, queue: &dyn JobQueue) -> Result<(u64, u64), QueueError> {
        let stale = queue.stale_leases(SWEEP_BATCH).await?;
        let mut requeued = 0;
        let mut failed = 0;

        for job in stale {
            let Some(token) = job.claim_token else {
                continue;
            };

            let change = match self.policy.decide(job.retry_count, FailureKind::Infrastructure) {
                RetryDecision::Retry { delay, .. } => {
                    let at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    Transition::retry(token, "lease expired".to_string(), at)
                }
                RetryDecision::Fail { retry_count } => Transition::fail(
                    token,
                    format!("failed after {retry_count} attempts: lease expired"),
                    true,
                ),
            };
            let to = change.to;

            match queue.transition(&job.id, change).await {
                Ok(_) if to.is_terminal() => {
                    failed += 1;
                    metrics::counter!("analysis_jobs_failed_total", "queue" => queue.name().to_string())
                        .increment(1);
                    warn!(job_id = %job.id, "Lease expired on final attempt, job failed");
                }
                Ok(_) => {
                    requeued += 1;
                    metrics::counter!("analysis_jobs_requeued_total", "queue" => queue.name().to_string())
                        .increment(1);
                    warn!(job_id = %job.id, retry_count = job.retry_count + 1, "Lease expired, job requeued");
                }
                // The worker finished between the scan and the write.
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }

        Ok((requeued, failed))
    }

    /// Sweep once immediately, then every `interval` until shutdown.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Maintenance loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("Maintenance loop stopped");
    }
}

/// Fail `Pending` jobs that outlived their expiry without being claimed.
pub async fn expire_pending(queue: &dyn JobQueue) -> Result<u64, QueueError> {
    let expired = queue.expired_pending(SWEEP_BATCH).await?;
    let mut count = 0;

    for job in expired {
        match queue
            .transition(&job.id, Transition::expire("expired before processing".to_string()))
            .await
        {
            Ok(_) => {
                count += 1;
                metrics::counter!("analysis_jobs_failed_total", "queue" => queue.name().to_string())
                    .increment(1);
            }
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }
    }

    if count > 0 {
        info!(queue = queue.name(), count, "Expired pending jobs");
    }
    Ok(count)
}
