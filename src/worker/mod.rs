//! Worker process: recovery, the two queue consumers, and shutdown.

pub mod consumer;
pub mod pipeline;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::app_state::AppState;
use crate::models::message::JobSource;
use crate::services::broker::Backoff;
use consumer::QueueConsumer;
use pipeline::JobPipeline;

pub struct Worker {
    state: AppState,
}

impl Worker {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Return deliveries a previous run left unsettled to their queues.
    ///
    /// Retries with backoff while the broker is unreachable; returns early on shutdown.
    pub async fn recover(&self, shutdown: &CancellationToken) {
        let queues = [
            self.state.config.worker_queue.as_str(),
            self.state.config.model_queue.as_str(),
        ];

        for queue in queues {
            let mut backoff = Backoff::default();
            loop {
                match self.state.broker.recover(queue).await {
                    Ok(0) => break,
                    Ok(moved) => {
                        tracing::warn!(queue, moved, "Requeued deliveries left by a previous run");
                        break;
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        tracing::error!(
                            queue,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Failed to recover unacknowledged deliveries"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    /// Run both consumers until `shutdown` fires and their pipelines settle.
    pub async fn run(self, shutdown: CancellationToken) {
        self.recover(&shutdown).await;

        let pipeline = Arc::new(JobPipeline::new(self.state.clone()));
        let task = QueueConsumer::new(self.state.clone(), Arc::clone(&pipeline), JobSource::Task);
        let model = QueueConsumer::new(self.state.clone(), pipeline, JobSource::Model);

        tokio::join!(task.run(shutdown.clone()), model.run(shutdown.clone()));

        tracing::info!("Worker stopped");
    }
}
