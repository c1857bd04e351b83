use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use strum::{Display, EnumString};

/// Kind of work a queue message asks for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum JobKind {
    /// Convert source files and import the result.
    Conversion,
    /// Conversion followed by packaging a runtime asset bundle.
    BundledConversion,
    /// Aggregate of previously imported member revisions.
    Federation,
}

impl JobKind {
    pub fn requires_bundle(self) -> bool {
        matches!(self, JobKind::BundledConversion)
    }

    pub fn is_federation(self) -> bool {
        matches!(self, JobKind::Federation)
    }
}

/// Pipeline state a job has reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PipelineState {
    Received,
    Converting,
    Retrying,
    Importing,
    Bundling,
    Completed,
    Failed,
    Abandoned,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Failed | PipelineState::Abandoned
        )
    }
}

/// Stage names carried on callback messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Convert,
    Import,
    Bundle,
    /// The job as a whole; used for the terminal completion event.
    Job,
}

/// Write durability for imports, expressed as PostgreSQL `synchronous_commit` levels.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Display, EnumString, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Durability {
    /// Acknowledge before the WAL is flushed.
    Off,
    /// Acknowledge once flushed on the primary.
    #[default]
    Local,
    /// Acknowledge once a standby has received the WAL.
    RemoteWrite,
    /// Acknowledge once a standby has flushed the WAL.
    On,
    /// Acknowledge once a standby has applied the change.
    RemoteApply,
}

impl Durability {
    pub fn as_setting(self) -> &'static str {
        match self {
            Durability::Off => "off",
            Durability::Local => "local",
            Durability::RemoteWrite => "remote_write",
            Durability::On => "on",
            Durability::RemoteApply => "remote_apply",
        }
    }
}

/// A unit of work extracted from a queue message, owned by one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub source_refs: Vec<String>,
    pub member_revisions: Vec<String>,
    pub target_project: Option<String>,
    pub target_revision: Option<String>,
    pub state: PipelineState,
    /// Conversion attempts started so far.
    pub attempts: u32,
    pub received_at: DateTime<Utc>,
}

/// Output of a successful conversion stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub output_dir: PathBuf,
    pub artifacts: Vec<PathBuf>,
    pub log_excerpt: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

/// Result of persisting a [`JobResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportOutcome {
    pub job_id: String,
    pub durability: Durability,
    pub artifact_count: usize,
    pub asset_dir: PathBuf,
    /// False when the row already existed (a redelivered job).
    pub inserted: bool,
}

/// Result of the optional bundling stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleOutcome {
    pub job_id: String,
    pub bundles: Vec<PathBuf>,
    pub log_excerpt: String,
}
