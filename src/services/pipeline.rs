//! Wires dispatchers and the maintenance loop for a set of queues.

use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::services::analysis::{AnalysisError, ImageAnalyzer, WorkersAiClient};
use crate::services::dispatcher::{Dispatcher, DispatcherConfig};
use crate::services::executor::Executor;
use crate::services::maintenance::Maintenance;
use crate::services::meals::{HttpMealClient, MealCreator, MealError};
use crate::services::queue::QueueRegistry;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to build analysis client: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Failed to build meal client: {0}")]
    Meals(#[from] MealError),
}

/// Collaborators configured from the environment.
pub fn collaborators(
    config: &AppConfig,
) -> Result<(Arc<dyn ImageAnalyzer>, Arc<dyn MealCreator>), PipelineError> {
    let mut analyzer = WorkersAiClient::new(&config.cf_account_id, &config.cf_api_token)?;
    if let Some(base) = &config.cf_api_base {
        analyzer = analyzer.with_api_base(base.clone());
    }
    if let Some(model) = &config.analysis_model {
        analyzer = analyzer.with_model(model.clone());
    }
    let meals = HttpMealClient::new(&config.meal_service_url)?;
    Ok((Arc::new(analyzer), Arc::new(meals)))
}

/// Start one dispatcher per queue, sharing a single concurrency budget, plus
/// the maintenance loop. Every task stops when `shutdown` flips to `true`.
pub fn spawn_workers(
    config: &AppConfig,
    queues: &QueueRegistry,
    analyzer: Arc<dyn ImageAnalyzer>,
    meals: Arc<dyn MealCreator>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs));
    let dispatcher_config = DispatcherConfig {
        max_concurrent_jobs: config.max_concurrent_jobs,
        poll_interval: config.poll_interval(),
    };

    let mut handles = Vec::with_capacity(queues.all().len() + 1);
    for queue in queues.all() {
        let executor = Executor::new(
            queue.clone(),
            analyzer.clone(),
            meals.clone(),
            config.retry_policy(),
        )
        .with_analysis_timeout(config.analysis_timeout())
        .with_heartbeat(config.heartbeat());

        let dispatcher =
            Dispatcher::new(Arc::new(executor), dispatcher_config).with_slots(slots.clone());
        handles.push(tokio::spawn(dispatcher.run(shutdown.clone())));
    }

    let maintenance = Maintenance::new(
        queues.all().to_vec(),
        config.retention(),
        config.retry_policy(),
    );
    handles.push(tokio::spawn(
        maintenance.run(config.cleanup_interval(), shutdown),
    ));

    handles
}

/// Register metric descriptions emitted by the worker side.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "analysis_jobs_submitted_total",
        "Total analysis jobs submitted"
    );
    metrics::describe_histogram!(
        "analysis_job_duration_seconds",
        "Time to process an analysis job"
    );
    metrics::describe_counter!("analysis_jobs_completed_total", "Analysis jobs completed");
    metrics::describe_counter!("analysis_jobs_failed_total", "Analysis jobs that failed");
    metrics::describe_counter!("analysis_jobs_retried_total", "Failed attempts scheduled for retry");
    metrics::describe_counter!("analysis_jobs_requeued_total", "Jobs requeued after a lease expired");
    metrics::describe_counter!("analysis_jobs_purged_total", "Terminal jobs removed by retention");
    metrics::describe_gauge!("analysis_jobs_active", "Jobs currently executing in this process");
}
