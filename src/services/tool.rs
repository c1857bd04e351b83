//! Adapter around the bouncer conversion binary.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::config::WorkerConfig;
use crate::models::job::{Job, JobResult};
use crate::services::process::{self, ProcessError, ProcessOutput, ProcessSpec};

/// Name of the federation description written for federation jobs.
pub const FEDERATION_SPEC_FILE: &str = "federation.json";

/// Runs the conversion stage for a job.
#[async_trait]
pub trait ConversionTool: Send + Sync {
    async fn convert(&self, job: &Job) -> Result<JobResult, ToolError>;
}

/// How an exit code should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    Transient,
    Fatal,
}

/// Maps tool exit codes onto [`ExitClass`].
#[derive(Debug, Clone, Default)]
pub struct ExitCodeTable {
    pub transient: Vec<i32>,
    /// Non-zero codes strictly below this value are transient.
    pub fatal_threshold: Option<i32>,
}

impl ExitCodeTable {
    pub fn new(transient: Vec<i32>, fatal_threshold: Option<i32>) -> Self {
        Self {
            transient,
            fatal_threshold,
        }
    }

    pub fn classify(&self, code: Option<i32>) -> ExitClass {
        match code {
            Some(0) => ExitClass::Success,
            // Killed by a signal: usually the OOM killer or an operator.
            None => ExitClass::Transient,
            Some(c) if self.transient.contains(&c) => ExitClass::Transient,
            Some(c) if self.fatal_threshold.is_some_and(|t| c > 0 && c < t) => {
                ExitClass::Transient
            }
            Some(_) => ExitClass::Fatal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Conversion tool failed transiently (exit code {code:?})")]
    Transient { code: Option<i32>, excerpt: String },

    #[error("Conversion tool failed (exit code {code:?})")]
    Fatal { code: Option<i32>, excerpt: String },

    #[error("Conversion tool timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Conversion tool could not be started: {0}")]
    Launch(String),

    #[error("Failed to prepare conversion workspace: {0}")]
    Workspace(#[from] std::io::Error),
}

impl ToolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Transient { .. } | ToolError::Timeout(_))
    }

    /// Diagnostic text for the failure callback.
    pub fn detail(&self) -> String {
        match self {
            ToolError::Transient { excerpt, .. } | ToolError::Fatal { excerpt, .. }
                if !excerpt.is_empty() =>
            {
                format!("{self}\n{excerpt}")
            }
            _ => self.to_string(),
        }
    }
}

/// Connection and filesystem settings handed to the conversion binary.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub binary: PathBuf,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub timeout: Duration,
    pub exit_codes: ExitCodeTable,
}

impl From<&WorkerConfig> for ToolSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            binary: config.bouncer_path.clone(),
            work_dir: config.bouncer_work_dir.clone(),
            log_dir: config.bouncer_log_dir.clone(),
            db_host: config.db_host.clone(),
            db_port: config.db_port,
            db_user: config.db_username.clone(),
            db_password: config.db_password.clone(),
            timeout: config.tool_timeout(),
            exit_codes: ExitCodeTable::new(
                config.transient_exit_codes.clone(),
                config.fatal_exit_threshold,
            ),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FederationSpec<'a> {
    job_id: &'a str,
    members: &'a [String],
    target_project: Option<&'a str>,
    target_revision: Option<&'a str>,
}

/// Invokes the bouncer binary once per source reference.
pub struct BouncerTool {
    settings: ToolSettings,
}

impl BouncerTool {
    pub fn new(settings: ToolSettings) -> Self {
        Self { settings }
    }

    pub fn output_dir(&self, job: &Job) -> PathBuf {
        self.settings.work_dir.join(&job.id)
    }

    /// Build the invocation for one source reference.
    pub fn command_for(&self, source_ref: &str, output_dir: &Path) -> ProcessSpec {
        let s = &self.settings;
        ProcessSpec::new(&s.binary, s.timeout)
            .arg(source_ref)
            .arg(output_dir.display().to_string())
            .arg("--db-host")
            .arg(s.db_host.clone())
            .arg("--db-port")
            .arg(s.db_port.to_string())
            .arg("--user")
            .arg(s.db_user.clone())
            .env("BOUNCER_DB_PASSWORD", s.db_password.clone())
            .env("BOUNCER_LOG_DIR", s.log_dir.display().to_string())
    }

    /// Source references to convert, writing the federation description first
    /// for federation jobs.
    async fn prepare_sources(&self, job: &Job, output_dir: &Path) -> Result<Vec<String>, ToolError> {
        if !job.kind.is_federation() {
            return Ok(job.source_refs.clone());
        }

        let spec = FederationSpec {
            job_id: &job.id,
            members: &job.member_revisions,
            target_project: job.target_project.as_deref(),
            target_revision: job.target_revision.as_deref(),
        };
        let body = serde_json::to_vec_pretty(&spec).map_err(std::io::Error::other)?;
        let path = output_dir.join(FEDERATION_SPEC_FILE);
        tokio::fs::write(&path, body).await?;
        Ok(vec![path.display().to_string()])
    }

    fn interpret(&self, output: &ProcessOutput) -> Result<(), ToolError> {
        match self.settings.exit_codes.classify(output.exit_code) {
            ExitClass::Success => Ok(()),
            ExitClass::Transient => Err(ToolError::Transient {
                code: output.exit_code,
                excerpt: output.excerpt(),
            }),
            ExitClass::Fatal => Err(ToolError::Fatal {
                code: output.exit_code,
                excerpt: output.excerpt(),
            }),
        }
    }
}

#[async_trait]
impl ConversionTool for BouncerTool {
    async fn convert(&self, job: &Job) -> Result<JobResult, ToolError> {
        let start = Instant::now();
        let output_dir = self.output_dir(job);
        reset_dir(&output_dir).await?;
        tokio::fs::create_dir_all(&self.settings.log_dir).await?;

        let sources = self.prepare_sources(job, &output_dir).await?;
        let mut excerpts = Vec::with_capacity(sources.len());
        let mut exit_code = None;

        for source in &sources {
            tracing::info!(job_id = %job.id, source = %source, "Running conversion tool");

            let output = process::run_supervised(&self.command_for(source, &output_dir))
                .await
                .map_err(|e| match e {
                    ProcessError::Timeout { after, .. } => ToolError::Timeout(after),
                    other => ToolError::Launch(other.to_string()),
                })?;

            tracing::info!(
                job_id = %job.id,
                source = %source,
                exit_code = ?output.exit_code,
                duration_ms = output.duration.as_millis() as u64,
                "Conversion tool exited"
            );

            self.interpret(&output)?;
            exit_code = output.exit_code;
            excerpts.push(output.excerpt());
        }

        let artifacts = collect_artifacts(&output_dir).await?;

        Ok(JobResult {
            job_id: job.id.clone(),
            output_dir,
            artifacts,
            log_excerpt: excerpts.join("\n"),
            exit_code,
            duration: start.elapsed(),
        })
    }
}

/// Empty `dir`, creating it if needed. Every attempt starts from a clean
/// directory so earlier attempts never leak into the artifacts.
async fn reset_dir(dir: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

/// Files the tool produced in `dir`; the federation description is an input.
async fn collect_artifacts(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut files = collect_files(dir).await?;
    files.retain(|f| f.file_name() != Some(OsStr::new(FEDERATION_SPEC_FILE)));
    Ok(files)
}

/// Regular files directly under `dir`, sorted for stable persistence.
pub async fn collect_files(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
