use std::sync::Arc;

use crate::config::{AppConfig, QueueBackendKind};
use crate::db;
use crate::services::queue::{BrokerQueue, JobQueue, PollingQueue, QueueError, QueueRegistry};
use crate::services::store::{MemoryJobStore, PgJobStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queues: QueueRegistry,
}

impl AppState {
    pub fn new(queues: QueueRegistry) -> Self {
        Self { queues }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Missing setting for the {0} backend")]
    MissingUrl(QueueBackendKind),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Connect the backend selected in `config`. With `migrate`, pending schema
/// migrations are applied first.
pub async fn build_queues(config: &AppConfig, migrate: bool) -> Result<QueueRegistry, BootstrapError> {
    let settings = config.queue_settings();

    match config.queue_backend {
        QueueBackendKind::Polling => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(BootstrapError::MissingUrl(QueueBackendKind::Polling))?;
            tracing::info!("Connecting to PostgreSQL database");
            let pool = db::init_pool(url, config.max_concurrent_jobs).await?;
            if migrate {
                tracing::info!("Running database migrations");
                db::run_migrations(&pool).await?;
            }
            let store = Arc::new(PgJobStore::new(pool));
            Ok(QueueRegistry::single(Arc::new(PollingQueue::new(
                config.broker_queue.clone(),
                store,
                settings,
            ))))
        }
        QueueBackendKind::Memory => {
            tracing::warn!("Using the in-memory job store; jobs are lost on restart");
            Ok(QueueRegistry::single(Arc::new(PollingQueue::new(
                config.broker_queue.clone(),
                Arc::new(MemoryJobStore::new()),
                settings,
            ))))
        }
        QueueBackendKind::Broker => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or(BootstrapError::MissingUrl(QueueBackendKind::Broker))?;
            tracing::info!("Connecting to Redis broker");
            let single: Arc<dyn JobQueue> =
                Arc::new(BrokerQueue::new(url, config.broker_queue.clone(), settings)?);
            let batch: Arc<dyn JobQueue> =
                Arc::new(BrokerQueue::new(url, config.broker_batch_queue.clone(), settings)?);
            Ok(QueueRegistry::split(single, batch))
        }
    }
}
