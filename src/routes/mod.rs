pub mod admin;
pub mod analysis;
pub mod error;
pub mod health;
pub mod metrics;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::app_state::AppState;

/// Largest accepted request body. A batch carries up to twenty base64 photos.
pub const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

/// All HTTP routes. The Prometheus handle is optional so tests can build the
/// router without installing a global recorder.
pub fn router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let app = Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/analysis",
            post(analysis::submit_analysis).get(analysis::list_jobs),
        )
        .route("/api/v1/analysis/batch", post(analysis::submit_batch))
        .route("/api/v1/analysis/{job_id}", get(analysis::get_job))
        .route("/api/v1/admin/queues", get(admin::queue_stats))
        .route("/api/v1/admin/queues/{name}/pause", post(admin::pause_queue))
        .route("/api/v1/admin/queues/{name}/resume", post(admin::resume_queue))
        .route("/api/v1/admin/queues/{name}/clear", post(admin::clear_queue))
        .route(
            "/api/v1/admin/queues/{name}/retry-failed",
            post(admin::retry_failed),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state);

    match prometheus {
        Some(handle) => app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        ),
        None => app,
    }
}
