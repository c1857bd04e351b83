use dashmap::DashSet;
use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::services::{
    broker::Broker, bundle::AssetBundler, callback::CallbackPublisher, import::ImportStore,
    tool::ConversionTool,
};

/// Shared state passed to consumers, pipelines and route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<WorkerConfig>,
    pub broker: Arc<dyn Broker>,
    pub tool: Arc<dyn ConversionTool>,
    pub importer: Arc<dyn ImportStore>,
    pub bundler: Arc<dyn AssetBundler>,
    pub callbacks: CallbackPublisher,
    /// Job ids currently owned by a pipeline, across both consumers.
    pub active_jobs: Arc<DashSet<String>>,
}

impl AppState {
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        tool: Arc<dyn ConversionTool>,
        importer: Arc<dyn ImportStore>,
        bundler: Arc<dyn AssetBundler>,
    ) -> Self {
        let callbacks = CallbackPublisher::new(Arc::clone(&broker), &config.callback_queue);
        Self {
            config: Arc::new(config),
            broker,
            tool,
            importer,
            bundler,
            callbacks,
            active_jobs: Arc::new(DashSet::new()),
        }
    }
}
