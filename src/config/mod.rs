use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::job::Durability;

/// Process-wide worker configuration, loaded once from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Redis connection string for the job, model and callback queues
    pub broker_url: String,

    #[serde(default = "default_worker_queue")]
    pub worker_queue: String,

    #[serde(default = "default_callback_queue")]
    pub callback_queue: String,

    #[serde(default = "default_model_queue")]
    pub model_queue: String,

    /// Maximum unacknowledged task-queue messages held at once
    #[serde(default = "default_task_prefetch")]
    pub task_prefetch: usize,

    /// Maximum unacknowledged model-queue messages held at once
    #[serde(default = "default_model_prefetch")]
    pub model_prefetch: usize,

    /// Names this worker's processing lists so restarts can recover them
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    /// Path to the bouncer conversion binary
    pub bouncer_path: PathBuf,

    /// Root directory for per-job conversion output
    #[serde(default = "default_work_dir")]
    pub bouncer_work_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub bouncer_log_dir: PathBuf,

    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Exit codes the conversion binary uses for retryable failures
    #[serde(default = "default_transient_codes")]
    pub transient_exit_codes: Vec<i32>,

    /// Non-zero exit codes below this value are treated as retryable
    #[serde(default)]
    pub fatal_exit_threshold: Option<i32>,

    #[serde(default = "default_max_attempts")]
    pub max_convert_attempts: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_db_host")]
    pub db_host: String,

    #[serde(default = "default_db_port")]
    pub db_port: u16,

    #[serde(default = "default_db_name")]
    pub db_name: String,

    pub db_username: String,

    pub db_password: String,

    /// Write durability for imports (PostgreSQL `synchronous_commit`)
    #[serde(default)]
    pub db_durability: Durability,

    /// Asset bundling tool; bundled jobs fail when unset
    #[serde(default)]
    pub bundler_path: Option<PathBuf>,

    /// Script handed to the bundling tool
    #[serde(default)]
    pub bundler_script: Option<PathBuf>,

    #[serde(default = "default_bundle_timeout")]
    pub bundle_timeout_secs: u64,

    /// How long shutdown waits for in-flight pipelines before aborting them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Bind address for the health and metrics endpoint
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_worker_queue() -> String {
    "jobq".to_string()
}

fn default_callback_queue() -> String {
    "callbackq".to_string()
}

fn default_model_queue() -> String {
    "modelq".to_string()
}

fn default_task_prefetch() -> usize {
    4
}

fn default_model_prefetch() -> usize {
    1
}

fn default_worker_name() -> String {
    "bouncer-worker".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/bouncer")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/bouncer")
}

fn default_tool_timeout() -> u64 {
    3600
}

// EX_TEMPFAIL from sysexits.h
fn default_transient_codes() -> Vec<i32> {
    vec![75]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "bouncer".to_string()
}

fn default_bundle_timeout() -> u64 {
    1800
}

fn default_shutdown_grace() -> u64 {
    600
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9102".to_string()
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from explicit key/value pairs (upper-case keys, as in the environment).
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_prefetch == 0 {
            return Err(ConfigError::Invalid("TASK_PREFETCH must be at least 1".into()));
        }
        if self.model_prefetch == 0 {
            return Err(ConfigError::Invalid("MODEL_PREFETCH must be at least 1".into()));
        }
        if self.max_convert_attempts == 0 {
            return Err(ConfigError::Invalid(
                "MAX_CONVERT_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.transient_exit_codes.contains(&0) {
            return Err(ConfigError::Invalid(
                "TRANSIENT_EXIT_CODES must not contain 0".into(),
            ));
        }
        if self.worker_queue == self.model_queue {
            return Err(ConfigError::Invalid(
                "WORKER_QUEUE and MODEL_QUEUE must differ".into(),
            ));
        }
        Ok(())
    }

    /// PostgreSQL connection options from the DB_* settings. Credentials are
    /// passed as-is, never through a URL.
    pub fn db_connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.db_host)
            .port(self.db_port)
            .username(&self.db_username)
            .password(&self.db_password)
            .database(&self.db_name)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn bundle_timeout(&self) -> Duration {
        Duration::from_secs(self.bundle_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
