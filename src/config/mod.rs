use serde::Deserialize;
use std::time::Duration;

use crate::services::maintenance::RetentionPolicy;
use crate::services::queue::QueueSettings;
use crate::services::retry::RetryPolicy;

/// Which queue implementation backs the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QueueBackendKind {
    /// Workers poll the Postgres job table.
    #[default]
    Polling,
    /// Redis-backed priority queues.
    Broker,
    /// Single-process, in-memory store. Jobs do not survive a restart.
    Memory,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub queue_backend: QueueBackendKind,

    /// PostgreSQL connection string, required by the polling backend
    pub database_url: Option<String>,

    /// Redis connection string, required by the broker backend
    pub redis_url: Option<String>,

    /// Cloudflare account ID
    #[serde(default)]
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    #[serde(default)]
    pub cf_api_token: String,

    /// Override for the Workers AI API root
    pub cf_api_base: Option<String>,

    /// Override for the vision model name
    pub analysis_model: Option<String>,

    /// Base URL of the meal service
    #[serde(default = "default_meal_service_url")]
    pub meal_service_url: String,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    #[serde(default = "default_job_expiry_secs")]
    pub job_expiry_secs: i64,

    #[serde(default = "default_analysis_timeout_secs")]
    pub analysis_timeout_secs: u64,

    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: i64,

    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: i64,

    #[serde(default = "default_broker_queue")]
    pub broker_queue: String,

    #[serde(default = "default_broker_batch_queue")]
    pub broker_batch_queue: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_meal_service_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_retries() -> i32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_secs() -> u64 {
    300
}

fn default_job_expiry_secs() -> i64 {
    86_400
}

fn default_analysis_timeout_secs() -> u64 {
    60
}

fn default_lease_secs() -> i64 {
    120
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_completed_retention_secs() -> i64 {
    86_400
}

fn default_failed_retention_secs() -> i64 {
    604_800
}

fn default_broker_queue() -> String {
    "analysis".to_string()
}

fn default_broker_batch_queue() -> String {
    "analysis-batch".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "MAX_CONCURRENT_JOBS must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "POLL_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid(
                "HEARTBEAT_SECS must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "CLEANUP_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }
        if self.analysis_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "ANALYSIS_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        if self.max_retries < 1 {
            return Err(ConfigError::Invalid(
                "MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        if self.lease_secs <= 0 || self.heartbeat_secs as i64 >= self.lease_secs {
            return Err(ConfigError::Invalid(
                "HEARTBEAT_SECS must be shorter than LEASE_SECS".to_string(),
            ));
        }
        if self.broker_queue == self.broker_batch_queue {
            return Err(ConfigError::Invalid(
                "BROKER_QUEUE and BROKER_BATCH_QUEUE must differ".to_string(),
            ));
        }
        match self.queue_backend {
            QueueBackendKind::Polling if self.database_url.is_none() => Err(ConfigError::Invalid(
                "DATABASE_URL is required for the polling backend".to_string(),
            )),
            QueueBackendKind::Broker if self.redis_url.is_none() => Err(ConfigError::Invalid(
                "REDIS_URL is required for the broker backend".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            job_expiry: chrono::Duration::seconds(self.job_expiry_secs),
            lease: chrono::Duration::seconds(self.lease_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            completed: chrono::Duration::seconds(self.completed_retention_secs),
            failed: chrono::Duration::seconds(self.failed_retention_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}
