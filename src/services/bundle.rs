//! Adapter around the asset bundling tool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::WorkerConfig;
use crate::models::job::{BundleOutcome, ImportOutcome, Job};
use crate::services::process::{self, ProcessSpec};
use crate::services::tool::collect_files;

/// Directory under the asset directory where bundles are written.
pub const BUNDLE_DIR: &str = "bundles";

/// Packages imported assets into a runtime-loadable bundle.
#[async_trait]
pub trait AssetBundler: Send + Sync {
    async fn bundle(&self, job: &Job, import: &ImportOutcome) -> Result<BundleOutcome, BundleError>;
}

/// Bundling failures are never retried.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("No bundling tool is configured")]
    NotConfigured,

    #[error("Bundling tool failed: {0}")]
    Process(#[from] process::ProcessError),

    #[error("Bundling tool exited with code {code:?}")]
    Failed { code: Option<i32>, excerpt: String },

    #[error("Failed to read bundle output: {0}")]
    Output(#[from] std::io::Error),
}

impl BundleError {
    pub fn detail(&self) -> String {
        match self {
            BundleError::Failed { excerpt, .. } if !excerpt.is_empty() => {
                format!("{self}\n{excerpt}")
            }
            _ => self.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BundleSettings {
    pub tool: Option<PathBuf>,
    pub script: Option<PathBuf>,
    pub timeout: Duration,
}

impl From<&WorkerConfig> for BundleSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            tool: config.bundler_path.clone(),
            script: config.bundler_script.clone(),
            timeout: config.bundle_timeout(),
        }
    }
}

/// Runs `<tool> [<script>] <assetDir>` and collects `<assetDir>/bundles`.
pub struct ScriptBundler {
    settings: BundleSettings,
}

impl ScriptBundler {
    pub fn new(settings: BundleSettings) -> Self {
        Self { settings }
    }

    pub fn command_for(&self, asset_dir: &Path) -> Result<ProcessSpec, BundleError> {
        let tool = self.settings.tool.as_ref().ok_or(BundleError::NotConfigured)?;
        let mut spec = ProcessSpec::new(tool, self.settings.timeout);
        if let Some(script) = &self.settings.script {
            spec = spec.arg(script.display().to_string());
        }
        Ok(spec.arg(asset_dir.display().to_string()).current_dir(asset_dir))
    }
}

#[async_trait]
impl AssetBundler for ScriptBundler {
    async fn bundle(&self, job: &Job, import: &ImportOutcome) -> Result<BundleOutcome, BundleError> {
        let spec = self.command_for(&import.asset_dir)?;

        tracing::info!(
            job_id = %job.id,
            asset_dir = %import.asset_dir.display(),
            "Running bundling tool"
        );

        let output = process::run_supervised(&spec).await?;
        if !output.success() {
            tracing::error!(
                job_id = %job.id,
                exit_code = ?output.exit_code,
                "Bundling tool failed"
            );
            return Err(BundleError::Failed {
                code: output.exit_code,
                excerpt: output.excerpt(),
            });
        }

        let bundles = collect_files(&import.asset_dir.join(BUNDLE_DIR)).await?;
        tracing::info!(
            job_id = %job.id,
            bundles = bundles.len(),
            duration_ms = output.duration.as_millis() as u64,
            "Bundling complete"
        );

        Ok(BundleOutcome {
            job_id: job.id.clone(),
            bundles,
            log_excerpt: output.excerpt(),
        })
    }
}
