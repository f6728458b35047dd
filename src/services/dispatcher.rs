//! Claims jobs on a fixed tick and runs them under a concurrency cap.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::models::job::{AnalysisJob, JobId};
use crate::services::executor::Executor;
use crate::services::queue::{JobQueue, QueueError};
use crate::services::store::Transition;

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            poll_interval: Duration::from_secs(2),
        }
    }
}

type ActiveSet = Arc<Mutex<HashSet<JobId>>>;

/// Jobs running under the (possibly shared) concurrency budget.
fn record_in_use(slots: &Semaphore, capacity: usize) {
    let in_use = capacity.saturating_sub(slots.available_permits());
    metrics::gauge!("analysis_jobs_active").set(in_use as f64);
}

/// Removes the job from the active set and frees its slot, even if the task
/// panics.
struct Slot {
    id: JobId,
    active: ActiveSet,
    slots: Arc<Semaphore>,
    capacity: usize,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        drop(self.permit.take());
        record_in_use(&self.slots, self.capacity);
    }
}

pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    executor: Arc<Executor>,
    config: DispatcherConfig,
    slots: Arc<Semaphore>,
    active: ActiveSet,
}

impl Dispatcher {
    pub fn new(executor: Arc<Executor>, config: DispatcherConfig) -> Self {
        Self {
            queue: executor.queue().clone(),
            executor,
            config,
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Share one concurrency budget between several dispatchers. The budget
    /// must hold `max_concurrent_jobs` permits.
    pub fn with_slots(mut self, slots: Arc<Semaphore>) -> Self {
        self.slots = slots;
        self
    }

    /// Permits taken from the concurrency budget, by this dispatcher or any
    /// other sharing it.
    pub fn slots_in_use(&self) -> usize {
        self.config
            .max_concurrent_jobs
            .saturating_sub(self.slots.available_permits())
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_active(&self, id: &JobId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    /// One claim cycle. Returns how many jobs were started.
    pub async fn tick(&self, tasks: &mut JoinSet<()>) -> Result<usize, QueueError> {
        let capacity = self.slots.available_permits();
        if capacity == 0 {
            debug!(queue = self.queue.name(), "At capacity, skipping claim");
            return Ok(0);
        }

        let jobs = self.queue.claim(capacity).await?;
        let mut started = 0;

        for job in jobs {
            let permit = match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.release(job).await;
                    continue;
                }
            };
            self.spawn(job, permit, tasks);
            started += 1;
        }

        if started > 0 {
            debug!(queue = self.queue.name(), started, "Claimed jobs");
        }
        Ok(started)
    }

    fn spawn(&self, job: AnalysisJob, permit: OwnedSemaphorePermit, tasks: &mut JoinSet<()>) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id.clone());
        record_in_use(&self.slots, self.config.max_concurrent_jobs);

        let slot = Slot {
            id: job.id.clone(),
            active: self.active.clone(),
            slots: self.slots.clone(),
            capacity: self.config.max_concurrent_jobs,
            permit: Some(permit),
        };
        let executor = self.executor.clone();

        tasks.spawn(async move {
            let _slot = slot;
            executor.run(job).await;
        });
    }

    /// Hand back a claimed job we have no room for.
    async fn release(&self, job: AnalysisJob) {
        let Some(token) = job.claim_token else {
            return;
        };
        let change = Transition::release(token, chrono::Utc::now());
        match self.queue.transition(&job.id, change).await {
            Ok(_) => debug!(job_id = %job.id, "Released job over capacity"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to release job, lease will expire"),
        }
    }

    /// Poll until `shutdown` flips to `true`, then wait for in-flight jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = self.queue.name(),
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Dispatcher started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    while let Some(finished) = tasks.try_join_next() {
                        log_join(finished);
                    }
                    if let Err(e) = self.tick(&mut tasks).await {
                        error!(queue = self.queue.name(), error = %e, "Claim failed, retrying next tick");
                    }
                }
            }
        }

        info!(
            queue = self.queue.name(),
            in_flight = tasks.len(),
            "Dispatcher draining"
        );
        while let Some(finished) = tasks.join_next().await {
            log_join(finished);
        }
        info!(queue = self.queue.name(), "Dispatcher stopped");
    }
}

fn log_join(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        error!(error = %e, "Job task panicked");
    }
}
