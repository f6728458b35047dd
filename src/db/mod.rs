use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Connections kept beyond the job cap for API requests and maintenance sweeps.
const RESERVED_CONNECTIONS: u32 = 4;

/// Open the job-table pool. Every in-flight job may hold a connection for its
/// heartbeat and final transition, so the pool grows with `max_concurrent_jobs`.
pub async fn init_pool(database_url: &str, max_concurrent_jobs: usize) -> Result<PgPool, sqlx::Error> {
    let jobs = u32::try_from(max_concurrent_jobs).unwrap_or(u32::MAX);
    PgPoolOptions::new()
        .max_connections(jobs.saturating_add(RESERVED_CONNECTIONS))
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await
}

/// Apply pending schema migrations for the job table.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

pub mod queries;
