//! Runs one claimed job to a final write.
//!
//! The executor calls the analysis service, creates the meal record and then
//! asks the queue for exactly one transition out of `Processing`: `Completed`,
//! back to `Pending` with a backoff delay, or `Failed`. A lease heartbeat runs
//! alongside the work so the reaper leaves a live job alone.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::analysis::{AnalysisResult, BatchItemOutcome};
use crate::models::job::{AnalysisJob, BatchProgress, ImageInput, JobInput, JobResult};
use crate::services::analysis::ImageAnalyzer;
use crate::services::meals::MealCreator;
use crate::services::queue::{JobQueue, QueueError};
use crate::services::retry::{FailureKind, JobFailure, RetryDecision, RetryPolicy};
use crate::services::store::Transition;

/// How a single execution ended, from the executor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Retrying { retry_count: i32, delay: Duration },
    Failed { retry_count: i32 },
    /// The final write was rejected (claim lost) or could not reach the store.
    Abandoned,
}

pub struct Executor {
    queue: Arc<dyn JobQueue>,
    analyzer: Arc<dyn ImageAnalyzer>,
    meals: Arc<dyn MealCreator>,
    policy: RetryPolicy,
    analysis_timeout: Duration,
    heartbeat: Duration,
}

impl Executor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        analyzer: Arc<dyn ImageAnalyzer>,
        meals: Arc<dyn MealCreator>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            analyzer,
            meals,
            policy,
            analysis_timeout: Duration::from_secs(60),
            heartbeat: Duration::from_secs(30),
        }
    }

    pub fn with_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis_timeout = timeout;
        self
    }

    /// Lease renewal period. Zero is raised to one millisecond.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval.max(Duration::from_millis(1));
        self
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub async fn run(&self, job: AnalysisJob) -> ExecutionOutcome {
        let Some(token) = job.claim_token else {
            tracing::warn!(job_id = %job.id, "Refusing to run a job without a claim token");
            return ExecutionOutcome::Abandoned;
        };

        tracing::info!(
            queue = self.queue.name(),
            job_id = %job.id,
            owner_id = %job.owner_id,
            retry_count = job.retry_count,
            items = job.input.item_count(),
            "Processing analysis job"
        );

        let start = Instant::now();
        let attempt = self.drive_with_heartbeat(&job, token).await;
        let elapsed = start.elapsed();
        metrics::histogram!("analysis_job_duration_seconds", "queue" => self.queue.name().to_string())
            .record(elapsed.as_secs_f64());

        match attempt {
            Ok(result) => self.complete(&job, token, result, elapsed).await,
            Err(failure) => self.fail(&job, token, failure).await,
        }
    }

    /// Drive the work while renewing the lease on every heartbeat tick.
    async fn drive_with_heartbeat(&self, job: &AnalysisJob, token: Uuid) -> Result<JobResult, JobFailure> {
        let work = self.execute(job, token);
        tokio::pin!(work);

        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.renew_lease(&job.id, token).await {
                        tracing::warn!(job_id = %job.id, error = %e, "Lease renewal failed");
                    }
                }
            }
        }
    }

    async fn execute(&self, job: &AnalysisJob, token: Uuid) -> Result<JobResult, JobFailure> {
        match &job.input {
            JobInput::Single { image } => {
                let (analysis, meal_id) = self.process_image(job, image).await?;
                Ok(JobResult::Single { analysis, meal_id })
            }
            JobInput::Batch { images } => self.process_batch(job, token, images).await,
        }
    }

    /// Images are processed one at a time; progress is reported after each.
    async fn process_batch(
        &self,
        job: &AnalysisJob,
        token: Uuid,
        images: &[ImageInput],
    ) -> Result<JobResult, JobFailure> {
        if images.is_empty() {
            return Err(JobFailure::permanent("batch contains no images"));
        }

        let total = images.len() as u32;
        let mut items = Vec::with_capacity(images.len());
        let mut last_failure: Option<JobFailure> = None;
        let mut any_transient = false;

        for (index, image) in images.iter().enumerate() {
            let index = index as u32;
            match self.process_image(job, image).await {
                Ok((analysis, meal_id)) => items.push(BatchItemOutcome {
                    index,
                    meal_id: Some(meal_id),
                    analysis: Some(analysis),
                    error: None,
                }),
                Err(failure) => {
                    tracing::warn!(
                        job_id = %job.id,
                        item = index,
                        kind = ?failure.kind,
                        error = %failure.message,
                        "Batch item failed"
                    );
                    any_transient |= failure.kind != FailureKind::Permanent;
                    items.push(BatchItemOutcome {
                        index,
                        meal_id: None,
                        analysis: None,
                        error: Some(failure.message.clone()),
                    });
                    last_failure = Some(failure);
                }
            }

            let progress = BatchProgress {
                processed: index + 1,
                total,
            };
            if let Err(e) = self.queue.report_progress(&job.id, token, progress).await {
                tracing::warn!(job_id = %job.id, error = %e, "Progress update rejected");
            }
        }

        let succeeded = items.iter().filter(|i| i.succeeded()).count();
        if succeeded == 0 && any_transient {
            let message = last_failure
                .map(|f| f.message)
                .unwrap_or_else(|| "every batch item failed".to_string());
            return Err(JobFailure::transient(format!(
                "all {total} batch items failed: {message}"
            )));
        }

        tracing::info!(job_id = %job.id, succeeded, total, "Batch processed");
        Ok(JobResult::Batch { items })
    }

    async fn process_image(
        &self,
        job: &AnalysisJob,
        image: &ImageInput,
    ) -> Result<(AnalysisResult, String), JobFailure> {
        let bytes = image
            .decode_bytes()
            .map_err(|e| JobFailure::permanent(format!("invalid image encoding: {e}")))?;

        let analysis = match tokio::time::timeout(self.analysis_timeout, self.analyzer.analyze(&bytes)).await {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(e)) => {
                return Err(JobFailure {
                    kind: e.kind(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(JobFailure::transient(format!(
                    "analysis timed out after {}s",
                    self.analysis_timeout.as_secs_f64()
                )))
            }
        };

        tracing::debug!(
            job_id = %job.id,
            foods = analysis.foods.len(),
            total_calories = analysis.total_calories,
            confidence = analysis.confidence,
            "Analysis complete"
        );

        let meal_id = self
            .meals
            .create_meal(&job.owner_id, image, &job.meal_type, &analysis)
            .await
            .map_err(|e| JobFailure::transient(e.to_string()))?;

        Ok((analysis, meal_id))
    }

    async fn complete(
        &self,
        job: &AnalysisJob,
        token: Uuid,
        result: JobResult,
        elapsed: Duration,
    ) -> ExecutionOutcome {
        match self
            .queue
            .transition(&job.id, Transition::complete(token, result))
            .await
        {
            Ok(_) => {
                metrics::counter!("analysis_jobs_completed_total", "queue" => self.queue.name().to_string())
                    .increment(1);
                tracing::info!(
                    job_id = %job.id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
                ExecutionOutcome::Completed
            }
            Err(e) => self.abandon(job, e),
        }
    }

    async fn fail(&self, job: &AnalysisJob, token: Uuid, failure: JobFailure) -> ExecutionOutcome {
        let decision = self.policy.decide(job.retry_count, failure.kind);
        let (change, outcome) = match decision {
            RetryDecision::Retry { retry_count, delay } => {
                let available_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                (
                    Transition::retry(token, failure.message.clone(), available_at),
                    ExecutionOutcome::Retrying { retry_count, delay },
                )
            }
            RetryDecision::Fail { retry_count } => {
                let increment = retry_count > job.retry_count;
                let message = if failure.kind == FailureKind::Permanent {
                    failure.message.clone()
                } else {
                    format!("failed after {} attempts: {}", retry_count, failure.message)
                };
                (
                    Transition::fail(token, message, increment),
                    ExecutionOutcome::Failed { retry_count },
                )
            }
        };

        match self.queue.transition(&job.id, change).await {
            Ok(_) => {
                match outcome {
                    ExecutionOutcome::Retrying { retry_count, delay } => {
                        metrics::counter!("analysis_jobs_retried_total", "queue" => self.queue.name().to_string())
                            .increment(1);
                        tracing::info!(
                            job_id = %job.id,
                            retry_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure.message,
                            "Job failed, scheduled retry with backoff"
                        );
                    }
                    _ => {
                        metrics::counter!("analysis_jobs_failed_total", "queue" => self.queue.name().to_string())
                            .increment(1);
                        tracing::warn!(
                            job_id = %job.id,
                            kind = ?failure.kind,
                            error = %failure.message,
                            "Job failed"
                        );
                    }
                }
                outcome
            }
            Err(e) => self.abandon(job, e),
        }
    }

    fn abandon(&self, job: &AnalysisJob, error: QueueError) -> ExecutionOutcome {
        if error.is_conflict() {
            tracing::warn!(job_id = %job.id, error = %error, "Claim lost, discarding result");
        } else {
            tracing::error!(
                job_id = %job.id,
                error = %error,
                "Final write failed, leaving job for the lease reaper"
            );
        }
        ExecutionOutcome::Abandoned
    }
}
