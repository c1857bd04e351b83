use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::models::job::Stage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallbackStatus {
    Started,
    Completed,
    Failed,
}

/// Status event published to the callback queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackMessage {
    pub job_id: String,
    pub stage: Stage,
    pub status: CallbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl CallbackMessage {
    pub fn new(job_id: &str, stage: Stage, status: CallbackStatus, detail: Option<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage,
            status,
            detail,
            emitted_at: Utc::now(),
        }
    }

    pub fn stage_started(job_id: &str, stage: Stage) -> Self {
        Self::new(job_id, stage, CallbackStatus::Started, None)
    }

    pub fn stage_completed(job_id: &str, stage: Stage) -> Self {
        Self::new(job_id, stage, CallbackStatus::Completed, None)
    }

    /// Terminal failure, reported against the stage that failed.
    pub fn job_failed(job_id: &str, stage: Stage, detail: String) -> Self {
        Self::new(job_id, stage, CallbackStatus::Failed, Some(detail))
    }

    /// Terminal success; `detail` references the imported assets.
    pub fn job_completed(job_id: &str, detail: String) -> Self {
        Self::new(job_id, Stage::Job, CallbackStatus::Completed, Some(detail))
    }

    pub fn is_terminal(&self) -> bool {
        self.status == CallbackStatus::Failed
            || (self.stage == Stage::Job && self.status == CallbackStatus::Completed)
    }
}
