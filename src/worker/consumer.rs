//! Bounded consumer loop for one queue.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::app_state::AppState;
use crate::models::message::{InboundMessage, JobSource};
use crate::services::broker::{Backoff, Delivery};
use crate::worker::pipeline::{JobOutcome, JobPipeline};

/// How long a single receive blocks waiting for a message.
const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(1);

/// Delay before handing back a delivery whose job is already running here.
const DUPLICATE_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Attempts made to ack or nack a delivery.
const SETTLE_ATTEMPTS: u32 = 3;

/// Consumes one queue with at most `prefetch` deliveries in flight.
pub struct QueueConsumer {
    state: AppState,
    pipeline: Arc<JobPipeline>,
    source: JobSource,
    queue: String,
    prefetch: usize,
    receive_wait: Duration,
}

impl QueueConsumer {
    pub fn new(state: AppState, pipeline: Arc<JobPipeline>, source: JobSource) -> Self {
        let (queue, prefetch) = match source {
            JobSource::Task => (state.config.worker_queue.clone(), state.config.task_prefetch),
            JobSource::Model => (state.config.model_queue.clone(), state.config.model_prefetch),
        };
        Self {
            state,
            pipeline,
            source,
            queue,
            prefetch,
            receive_wait: DEFAULT_RECEIVE_WAIT,
        }
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Consume until `shutdown` fires, then wait for in-flight pipelines.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            queue = %self.queue,
            source = self.source.label(),
            prefetch = self.prefetch,
            "Consumer started"
        );

        let semaphore = Arc::new(Semaphore::new(self.prefetch));
        let mut in_flight = JoinSet::new();
        let mut backoff = Backoff::default();

        loop {
            // A permit is held from receipt until the delivery is settled.
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                r = self.state.broker.receive(&self.queue, self.receive_wait) => r,
            };

            match received {
                Ok(Some(delivery)) => {
                    backoff.reset();
                    self.dispatch(&mut in_flight, delivery, permit, &shutdown);
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    let delay = backoff.next_delay();
                    tracing::error!(
                        queue = %self.queue,
                        error = %e,
                        connectivity = e.is_connectivity(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to receive from broker"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(queue = %self.queue, error = %e, "Pipeline task failed");
                }
            }
        }

        self.drain(in_flight).await;
        tracing::info!(queue = %self.queue, "Consumer stopped");
    }

    fn dispatch(
        &self,
        in_flight: &mut JoinSet<()>,
        delivery: Delivery,
        permit: OwnedSemaphorePermit,
        shutdown: &CancellationToken,
    ) {
        let state = self.state.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let source = self.source;
        let shutdown = shutdown.clone();

        in_flight.spawn(async move {
            let _permit = permit;
            handle_delivery(&state, &pipeline, source, delivery, &shutdown).await;
        });
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }

        tracing::info!(
            queue = %self.queue,
            in_flight = in_flight.len(),
            "Waiting for in-flight pipelines to reach a stage boundary"
        );

        let grace = self.state.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(queue = %self.queue, error = %e, "Pipeline task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                queue = %self.queue,
                remaining = in_flight.len(),
                "Shutdown grace period elapsed, aborting pipelines"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
    }
}

/// Removes a job id from the active set when the owning task ends, however it ends.
struct ActiveJob {
    active: Arc<DashSet<String>>,
    id: String,
}

impl ActiveJob {
    fn claim(active: &Arc<DashSet<String>>, id: &str) -> Option<Self> {
        active.insert(id.to_string()).then(|| Self {
            active: Arc::clone(active),
            id: id.to_string(),
        })
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

async fn handle_delivery(
    state: &AppState,
    pipeline: &JobPipeline,
    source: JobSource,
    delivery: Delivery,
    shutdown: &CancellationToken,
) {
    let job = match InboundMessage::parse(&delivery.payload, source) {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(
                queue = %delivery.queue,
                error = %e,
                payload = %truncate(&delivery.payload, 256),
                "Rejecting malformed message"
            );
            metrics::counter!("bouncer_malformed_messages_total", "queue" => delivery.queue.clone())
                .increment(1);
            settle(state, &delivery, Settlement::Nack { requeue: false }).await;
            return;
        }
    };

    let Some(_owned) = ActiveJob::claim(&state.active_jobs, &job.id) else {
        tracing::warn!(
            job_id = %job.id,
            queue = %delivery.queue,
            "Job is already running on this worker, requeueing delivery"
        );
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(DUPLICATE_REQUEUE_DELAY) => {}
        }
        settle(state, &delivery, Settlement::Nack { requeue: true }).await;
        return;
    };

    tracing::info!(
        job_id = %job.id,
        kind = %job.kind,
        queue = %delivery.queue,
        "Processing job"
    );

    metrics::gauge!("bouncer_pipelines_active", "queue" => delivery.queue.clone()).increment(1.0);
    let job_id = job.id.clone();
    let outcome = pipeline.run(job, shutdown).await;
    metrics::gauge!("bouncer_pipelines_active", "queue" => delivery.queue.clone()).decrement(1.0);

    match outcome {
        JobOutcome::Completed => {
            tracing::info!(job_id = %job_id, "Job completed");
            settle(state, &delivery, Settlement::Ack).await;
        }
        JobOutcome::Failed {
            stage, requeue, ..
        } => {
            tracing::warn!(job_id = %job_id, %stage, requeue, "Job failed");
            settle(state, &delivery, Settlement::Nack { requeue }).await;
        }
        JobOutcome::Abandoned => {
            tracing::info!(job_id = %job_id, "Job abandoned, delivery left unacknowledged");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

async fn settle(state: &AppState, delivery: &Delivery, settlement: Settlement) {
    let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(2), 2.0);

    for attempt in 1..=SETTLE_ATTEMPTS {
        let result = match settlement {
            Settlement::Ack => state.broker.ack(delivery).await,
            Settlement::Nack { requeue } => state.broker.nack(delivery, requeue).await,
        };

        match result {
            Ok(()) => return,
            Err(e) if attempt < SETTLE_ATTEMPTS => {
                tracing::warn!(
                    queue = %delivery.queue,
                    ?settlement,
                    attempt,
                    error = %e,
                    "Failed to settle delivery, retrying"
                );
                tokio::time::sleep(backoff.next_delay()).await;
            }
            Err(e) => {
                // Left in the processing list; recovered on next start.
                tracing::error!(
                    queue = %delivery.queue,
                    ?settlement,
                    error = %e,
                    "Failed to settle delivery"
                );
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
