//! Per-job state machine: convert → import → bundle.
//!
//! A pipeline owns its [`Job`] for the job's whole lifetime and reports one
//! [`JobOutcome`] back to the consumer that dispatched it. Shutdown is only
//! observed between stages, never while a tool is running.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::app_state::AppState;
use crate::models::callback::CallbackMessage;
use crate::models::job::{Job, JobResult, PipelineState, Stage};

/// Terminal result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Acknowledge the delivery.
    Completed,
    /// Negatively acknowledge the delivery.
    Failed {
        stage: Stage,
        requeue: bool,
        detail: String,
    },
    /// Shutdown interrupted the job; leave the delivery unsettled.
    Abandoned,
}

pub struct JobPipeline {
    state: AppState,
}

impl JobPipeline {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Drive `job` to a terminal state.
    pub async fn run(&self, mut job: Job, shutdown: &CancellationToken) -> JobOutcome {
        let start = Instant::now();
        let outcome = self.drive(&mut job, shutdown).await;

        let label = match &outcome {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::Abandoned => "abandoned",
        };
        metrics::counter!("bouncer_jobs_total", "kind" => job.kind.to_string(), "outcome" => label)
            .increment(1);
        metrics::histogram!("bouncer_job_duration_seconds", "kind" => job.kind.to_string())
            .record(start.elapsed().as_secs_f64());
        tracing::info!(
            job_id = %job.id,
            outcome = label,
            attempts = job.attempts,
            age_ms = (chrono::Utc::now() - job.received_at).num_milliseconds(),
            "Job finished"
        );

        outcome
    }

    async fn drive(&self, job: &mut Job, shutdown: &CancellationToken) -> JobOutcome {
        if shutdown.is_cancelled() {
            return self.abandon(job);
        }

        let result = match self.convert(job, shutdown).await {
            Ok(result) => result,
            Err(outcome) => return outcome,
        };
        self.publish(CallbackMessage::stage_completed(&job.id, Stage::Convert))
            .await;

        if shutdown.is_cancelled() {
            return self.abandon(job);
        }

        self.transition(job, PipelineState::Importing);
        self.publish(CallbackMessage::stage_started(&job.id, Stage::Import))
            .await;
        let stage_start = Instant::now();
        let import = match self.state.importer.upsert(job, &result).await {
            Ok(import) => import,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Import failed");
                let requeue = e.should_requeue();
                return self.fail(job, Stage::Import, e.to_string(), requeue).await;
            }
        };
        record_stage(Stage::Import, stage_start);
        self.publish(CallbackMessage::stage_completed(&job.id, Stage::Import))
            .await;

        let mut bundles = Vec::new();
        if job.kind.requires_bundle() {
            if shutdown.is_cancelled() {
                return self.abandon(job);
            }

            self.transition(job, PipelineState::Bundling);
            self.publish(CallbackMessage::stage_started(&job.id, Stage::Bundle))
                .await;
            let stage_start = Instant::now();
            match self.state.bundler.bundle(job, &import).await {
                Ok(outcome) => bundles = outcome.bundles,
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Bundling failed");
                    return self.fail(job, Stage::Bundle, e.detail(), false).await;
                }
            }
            record_stage(Stage::Bundle, stage_start);
            self.publish(CallbackMessage::stage_completed(&job.id, Stage::Bundle))
                .await;
        }

        self.transition(job, PipelineState::Completed);
        self.publish(CallbackMessage::job_completed(
            &job.id,
            artifact_reference(&import.asset_dir, &bundles),
        ))
        .await;
        JobOutcome::Completed
    }

    /// Run the conversion tool, retrying transient failures up to the
    /// configured number of attempts.
    async fn convert(
        &self,
        job: &mut Job,
        shutdown: &CancellationToken,
    ) -> Result<JobResult, JobOutcome> {
        let max_attempts = self.state.config.max_convert_attempts;

        self.transition(job, PipelineState::Converting);
        self.publish(CallbackMessage::stage_started(&job.id, Stage::Convert))
            .await;

        loop {
            job.attempts += 1;
            let stage_start = Instant::now();

            match self.state.tool.convert(job).await {
                Ok(result) => {
                    record_stage(Stage::Convert, stage_start);
                    tracing::info!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        artifacts = result.artifacts.len(),
                        "Conversion succeeded"
                    );
                    return Ok(result);
                }
                Err(e) if e.is_transient() && job.attempts < max_attempts => {
                    tracing::warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        max_attempts,
                        error = %e,
                        "Conversion failed transiently, retrying"
                    );
                    metrics::counter!("bouncer_convert_retries_total").increment(1);
                    self.transition(job, PipelineState::Retrying);

                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(self.abandon(job)),
                        _ = tokio::time::sleep(self.state.config.retry_delay()) => {}
                    }
                    self.transition(job, PipelineState::Converting);
                }
                Err(e) => {
                    let detail = if e.is_transient() {
                        format!("Gave up after {} attempts: {}", job.attempts, e.detail())
                    } else {
                        e.detail()
                    };
                    tracing::error!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        error = %e,
                        "Conversion failed"
                    );
                    return Err(self.fail(job, Stage::Convert, detail, false).await);
                }
            }
        }
    }

    async fn fail(&self, job: &mut Job, stage: Stage, detail: String, requeue: bool) -> JobOutcome {
        self.transition(job, PipelineState::Failed);
        self.publish(CallbackMessage::job_failed(&job.id, stage, detail.clone()))
            .await;
        JobOutcome::Failed {
            stage,
            requeue,
            detail,
        }
    }

    fn abandon(&self, job: &mut Job) -> JobOutcome {
        tracing::warn!(
            job_id = %job.id,
            state = %job.state,
            "Shutdown requested, abandoning job for redelivery"
        );
        self.transition(job, PipelineState::Abandoned);
        JobOutcome::Abandoned
    }

    fn transition(&self, job: &mut Job, next: PipelineState) {
        tracing::info!(
            job_id = %job.id,
            kind = %job.kind,
            from = %job.state,
            to = %next,
            attempt = job.attempts,
            "Job state changed"
        );
        job.state = next;
    }

    async fn publish(&self, message: CallbackMessage) {
        self.state.callbacks.publish(&message).await;
    }
}

/// Completion detail: the asset directory, then one line per bundle.
fn artifact_reference(asset_dir: &Path, bundles: &[PathBuf]) -> String {
    std::iter::once(asset_dir)
        .chain(bundles.iter().map(PathBuf::as_path))
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn record_stage(stage: Stage, started: Instant) {
    metrics::histogram!("bouncer_stage_duration_seconds", "stage" => stage.to_string())
        .record(started.elapsed().as_secs_f64());
}
