use std::sync::Arc;

use crate::models::callback::CallbackMessage;
use crate::services::broker::Broker;

/// Best-effort publisher for job progress events.
///
/// Callers await each publish before moving on, which keeps events for a
/// single job in emission order on the callback queue.
#[derive(Clone)]
pub struct CallbackPublisher {
    broker: Arc<dyn Broker>,
    queue: String,
}

impl CallbackPublisher {
    pub fn new(broker: Arc<dyn Broker>, queue: &str) -> Self {
        Self {
            broker,
            queue: queue.to_string(),
        }
    }

    /// Publish a message. Failures are logged and counted, never returned.
    pub async fn publish(&self, message: &CallbackMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(job_id = %message.job_id, error = %e, "Failed to serialize callback");
                return;
            }
        };

        match self.broker.publish(&self.queue, &payload).await {
            Ok(()) => {
                tracing::debug!(
                    job_id = %message.job_id,
                    stage = %message.stage,
                    status = %message.status,
                    "Callback published"
                );
                metrics::counter!("bouncer_callbacks_published_total", "status" => message.status.to_string())
                    .increment(1);
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %message.job_id,
                    stage = %message.stage,
                    status = %message.status,
                    error = %e,
                    "Failed to publish callback"
                );
                metrics::counter!("bouncer_callback_publish_failures_total").increment(1);
            }
        }
    }
}
