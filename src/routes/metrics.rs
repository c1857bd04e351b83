use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint, text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the worker's metrics.
pub fn describe() {
    metrics::describe_counter!("bouncer_jobs_total", "Jobs reaching a terminal outcome");
    metrics::describe_histogram!(
        "bouncer_job_duration_seconds",
        "Time from dispatch to terminal outcome"
    );
    metrics::describe_histogram!("bouncer_stage_duration_seconds", "Duration of each pipeline stage");
    metrics::describe_counter!("bouncer_convert_retries_total", "Transient conversion failures retried");
    metrics::describe_counter!("bouncer_malformed_messages_total", "Messages dead-lettered as malformed");
    metrics::describe_counter!("bouncer_callbacks_published_total", "Callback messages published");
    metrics::describe_counter!(
        "bouncer_callback_publish_failures_total",
        "Callback messages that could not be published"
    );
    metrics::describe_gauge!("bouncer_pipelines_active", "Pipelines currently running per queue");
}
