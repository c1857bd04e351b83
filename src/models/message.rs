use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::{Job, JobKind, PipelineState};

/// Which queue a message arrived on; each accepts a different set of kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSource {
    Task,
    Model,
}

impl JobSource {
    pub fn accepts(self, kind: JobKind) -> bool {
        match self {
            JobSource::Task => !kind.is_federation(),
            JobSource::Model => kind.is_federation(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            JobSource::Task => "task",
            JobSource::Model => "model",
        }
    }
}

/// Wire payload of both inbound queues.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Also names the job's output directory, so path syntax is rejected.
    #[garde(length(min = 1, max = 128), pattern(r"^[A-Za-z0-9_-]+$"))]
    pub job_id: String,

    #[garde(skip)]
    pub kind: JobKind,

    #[serde(default)]
    #[garde(length(max = 256), inner(length(min = 1)))]
    pub source_refs: Vec<String>,

    #[serde(default)]
    #[garde(length(max = 1024), inner(length(min = 1)))]
    pub member_revisions: Vec<String>,

    #[serde(default)]
    #[garde(length(min = 1, max = 128))]
    pub target_project: Option<String>,

    #[serde(default)]
    #[garde(length(min = 1, max = 128))]
    pub target_revision: Option<String>,
}

impl InboundMessage {
    /// Parse and validate a raw payload received from `source`.
    pub fn parse(payload: &str, source: JobSource) -> Result<Job, MessageError> {
        let message: InboundMessage = serde_json::from_str(payload)?;
        message.validate()?;

        if !source.accepts(message.kind) {
            return Err(MessageError::WrongQueue {
                kind: message.kind,
                queue: source.label(),
            });
        }

        match message.kind {
            JobKind::Federation if message.member_revisions.is_empty() => {
                return Err(MessageError::Missing("memberRevisions"));
            }
            JobKind::Conversion | JobKind::BundledConversion => {
                if message.source_refs.is_empty() {
                    return Err(MessageError::Missing("sourceRefs"));
                }
                if message.target_project.is_none() {
                    return Err(MessageError::Missing("targetProject"));
                }
            }
            _ => {}
        }

        Ok(message.into_job())
    }

    fn into_job(self) -> Job {
        Job {
            id: self.job_id,
            kind: self.kind,
            source_refs: self.source_refs,
            member_revisions: self.member_revisions,
            target_project: self.target_project,
            target_revision: self.target_revision,
            state: PipelineState::Received,
            attempts: 0,
            received_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Message is not valid JSON for a job: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message failed validation: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Message is missing required field {0}")]
    Missing(&'static str),

    #[error("Job kind {kind} is not accepted on the {queue} queue")]
    WrongQueue { kind: JobKind, queue: &'static str },
}
