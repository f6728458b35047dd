use meal_analysis_queue::{
    app_state::build_queues,
    config::AppConfig,
    services::pipeline::{collaborators, describe_metrics, spawn_workers},
    shutdown_signal,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting meal analysis worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    let queues = build_queues(&config, false)
        .await
        .expect("Failed to initialize job queues");

    let (analyzer, meals) = collaborators(&config).expect("Failed to initialize collaborators");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_workers(&config, &queues, analyzer, meals, shutdown_rx);

    tracing::info!(
        queues = queues.all().len(),
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Worker ready"
    );

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    tracing::info!("Worker stopped");
}
