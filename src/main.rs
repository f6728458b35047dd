use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use meal_analysis_queue::{
    app_state::{build_queues, AppState},
    config::{AppConfig, QueueBackendKind},
    routes,
    services::pipeline::{collaborators, describe_metrics, spawn_workers},
    shutdown_signal,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(backend = %config.queue_backend, "Initializing meal analysis API");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    describe_metrics();

    let queues = build_queues(&config, true)
        .await
        .expect("Failed to initialize job queues");

    // The in-memory store is invisible to other processes, so run the
    // pipeline here.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();
    if config.queue_backend == QueueBackendKind::Memory {
        let (analyzer, meals) =
            collaborators(&config).expect("Failed to initialize collaborators");
        workers = spawn_workers(&config, &queues, analyzer, meals, shutdown_rx);
    }

    let state = AppState::new(queues);

    let app = routes::router(state, Some(prometheus_handle))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(routes::MAX_REQUEST_BODY_BYTES));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
}
