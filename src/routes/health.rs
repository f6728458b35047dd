use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub queues: Vec<ComponentHealth>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// GET /health — reachability of every queue backend.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let mut queues = Vec::with_capacity(state.queues.all().len());

    for queue in state.queues.all() {
        let start = std::time::Instant::now();
        let check = match queue.health_check().await {
            Ok(_) => ComponentHealth {
                name: queue.name().to_string(),
                status: "ok".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(e) => {
                tracing::warn!(queue = queue.name(), error = %e, "Health check failed");
                ComponentHealth {
                    name: queue.name().to_string(),
                    status: "error".to_string(),
                    latency_ms: None,
                }
            }
        };
        queues.push(check);
    }

    let all_healthy = queues.iter().all(|c| c.status == "ok");
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        queues,
    };

    (status_code, Json(response))
}
