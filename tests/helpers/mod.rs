//! Scripted collaborators and a memory-backed pipeline harness

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use meal_analysis_queue::models::analysis::AnalysisResult;
use meal_analysis_queue::models::job::{AnalysisJob, BatchProgress, ImageInput, JobId, NewJob};
use meal_analysis_queue::services::analysis::{AnalysisError, ImageAnalyzer};
use meal_analysis_queue::services::dispatcher::{Dispatcher, DispatcherConfig};
use meal_analysis_queue::services::executor::Executor;
use meal_analysis_queue::services::meals::{MealCreator, MealError};
use meal_analysis_queue::services::queue::{
    JobQueue, PollingQueue, QueueError, QueueSettings, QueueStats,
};
use meal_analysis_queue::services::retry::RetryPolicy;
use meal_analysis_queue::services::store::{MemoryJobStore, Transition};

use crate::fixtures;

/// One scripted analyzer response.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Succeed,
    Transient,
    RateLimited,
    Permanent,
    /// Sleep longer than any test timeout would allow.
    Hang,
}

/// Analyzer that replays a script, then falls back to a default step.
pub struct ScriptedAnalyzer {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedAnalyzer {
    pub fn new(script: Vec<Step>, fallback: Step) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn always(step: Step) -> Self {
        Self::new(Vec::new(), step)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageAnalyzer for ScriptedAnalyzer {
    async fn analyze(&self, _image_bytes: &[u8]) -> Result<AnalysisResult, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = match step {
            Step::Succeed => Ok(fixtures::salad()),
            Step::Transient => Err(AnalysisError::Upstream {
                status: 502,
                body: "bad gateway".to_string(),
            }),
            Step::RateLimited => Err(AnalysisError::RateLimited),
            Step::Permanent => Err(AnalysisError::UnsupportedImage("heic".to_string())),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(fixtures::salad())
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Meal service fake that records every created meal.
#[derive(Default)]
pub struct RecordingMeals {
    failures_left: AtomicUsize,
    created: Mutex<Vec<(String, String)>>,
}

impl RecordingMeals {
    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<(String, String)> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl MealCreator for RecordingMeals {
    async fn create_meal(
        &self,
        owner_id: &str,
        image: &ImageInput,
        _meal_type: &str,
        _analysis: &AnalysisResult,
    ) -> Result<String, MealError> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(MealError::Rejected {
                status: 503,
                body: "meal service unavailable".to_string(),
            });
        }

        let mut created = self.created.lock().unwrap();
        created.push((owner_id.to_string(), image.image_url.clone()));
        Ok(format!("meal-{}", created.len()))
    }
}

/// Wraps a queue so that, as each claim returns, a competing dispatcher on the
/// same budget takes `steal` slots.
pub struct ContendedQueue {
    inner: Arc<PollingQueue>,
    slots: Arc<Semaphore>,
    steal: u32,
    taken: Mutex<Vec<OwnedSemaphorePermit>>,
}

impl ContendedQueue {
    pub fn new(inner: Arc<PollingQueue>, slots: Arc<Semaphore>, steal: u32) -> Self {
        Self {
            inner,
            slots,
            steal,
            taken: Mutex::new(Vec::new()),
        }
    }

    /// The competing dispatcher finishes and hands its slots back.
    pub fn give_back(&self) {
        self.taken.lock().unwrap().clear();
    }
}

#[async_trait]
impl JobQueue for ContendedQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn owns(&self, id: &JobId) -> bool {
        self.inner.owns(id)
    }

    async fn submit(&self, job: NewJob) -> Result<AnalysisJob, QueueError> {
        self.inner.submit(job).await
    }

    async fn claim(&self, limit: usize) -> Result<Vec<AnalysisJob>, QueueError> {
        let claimed = self.inner.claim(limit).await?;
        if let Ok(permit) = self.slots.clone().try_acquire_many_owned(self.steal) {
            self.taken.lock().unwrap().push(permit);
        }
        Ok(claimed)
    }

    async fn transition(&self, id: &JobId, change: Transition) -> Result<AnalysisJob, QueueError> {
        self.inner.transition(id, change).await
    }

    async fn renew_lease(&self, id: &JobId, claim_token: Uuid) -> Result<(), QueueError> {
        self.inner.renew_lease(id, claim_token).await
    }

    async fn report_progress(
        &self,
        id: &JobId,
        claim_token: Uuid,
        progress: BatchProgress,
    ) -> Result<(), QueueError> {
        self.inner.report_progress(id, claim_token, progress).await
    }

    async fn get(&self, id: &JobId, owner_id: &str) -> Result<Option<AnalysisJob>, QueueError> {
        self.inner.get(id, owner_id).await
    }

    async fn list_for_owner(&self, owner_id: &str, limit: i64) -> Result<Vec<AnalysisJob>, QueueError> {
        self.inner.list_for_owner(owner_id, limit).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.inner.stats().await
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.inner.pause().await
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.inner.resume().await
    }

    async fn clear(&self) -> Result<u64, QueueError> {
        self.inner.clear().await
    }

    async fn recent_failed(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError> {
        self.inner.recent_failed(limit).await
    }

    async fn mark_resubmitted(&self, id: &JobId) -> Result<bool, QueueError> {
        self.inner.mark_resubmitted(id).await
    }

    async fn stale_leases(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError> {
        self.inner.stale_leases(limit).await
    }

    async fn expired_pending(&self, limit: i64) -> Result<Vec<AnalysisJob>, QueueError> {
        self.inner.expired_pending(limit).await
    }

    async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        self.inner.purge_terminal(completed_before, failed_before).await
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.inner.health_check().await
    }
}

/// Retries become claimable again immediately.
pub fn instant_retries(max_retries: i32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

/// A polling queue over the in-memory store plus scripted collaborators.
pub struct Harness {
    pub store: MemoryJobStore,
    pub queue: Arc<PollingQueue>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub meals: Arc<RecordingMeals>,
    pub policy: RetryPolicy,
    pub analysis_timeout: Duration,
}

impl Harness {
    pub fn new(analyzer: ScriptedAnalyzer) -> Self {
        Self::with_settings(analyzer, QueueSettings::default())
    }

    pub fn with_settings(analyzer: ScriptedAnalyzer, settings: QueueSettings) -> Self {
        let store = MemoryJobStore::new();
        let queue = Arc::new(PollingQueue::new(
            "analysis",
            Arc::new(store.clone()),
            settings,
        ));
        Self {
            store,
            queue,
            analyzer: Arc::new(analyzer),
            meals: Arc::new(RecordingMeals::default()),
            policy: instant_retries(3),
            analysis_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_meals(mut self, meals: RecordingMeals) -> Self {
        self.meals = Arc::new(meals);
        self
    }

    pub fn executor(&self) -> Arc<Executor> {
        let queue: Arc<dyn JobQueue> = self.queue.clone();
        Arc::new(
            Executor::new(queue, self.analyzer.clone(), self.meals.clone(), self.policy)
                .with_analysis_timeout(self.analysis_timeout)
                .with_heartbeat(Duration::from_millis(50)),
        )
    }

    pub fn dispatcher(&self, max_concurrent_jobs: usize) -> Dispatcher {
        Dispatcher::new(
            self.executor(),
            DispatcherConfig {
                max_concurrent_jobs,
                poll_interval: Duration::from_millis(10),
            },
        )
    }

    /// Run a dispatcher in the background until the returned sender fires.
    pub fn start(&self, max_concurrent_jobs: usize) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(self.dispatcher(max_concurrent_jobs).run(rx));
        (tx, handle)
    }

    pub async fn submit(&self, job: NewJob) -> AnalysisJob {
        self.queue.submit(job).await.unwrap()
    }

    pub async fn job(&self, id: &JobId) -> AnalysisJob {
        self.store.snapshot(id).await.expect("job exists")
    }

    /// Poll the store until the job is terminal.
    pub async fn wait_terminal(&self, id: &JobId) -> AnalysisJob {
        for _ in 0..500 {
            let job = self.job(id).await;
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish: {:?}", self.job(id).await.status);
    }
}

pub async fn stop(tx: watch::Sender<bool>, handle: JoinHandle<()>) {
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("dispatcher drained")
        .unwrap();
}
