use std::sync::Arc;

use crate::{
    backend::InferenceBackend, config::ProxyConfig, metrics::AppMetrics, resolver::ModelResolver,
};

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn InferenceBackend>,
    pub resolver: Arc<ModelResolver>,
    pub metrics: Arc<AppMetrics>,
    pub settings: Arc<ProxySettings>,
}

/// Startup values the handlers need after the config itself is gone.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub reported_version: String,
    pub stream_window: usize,
    pub started_at: String,
}

impl ProxySettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            reported_version: config.reported_version.clone(),
            stream_window: config.stream_window,
            started_at: crate::translate::now_rfc3339(),
        }
    }
}

impl AppState {
    pub fn new<B>(backend: Arc<B>, config: &ProxyConfig) -> Self
    where
        B: InferenceBackend + 'static,
    {
        let backend: Arc<dyn InferenceBackend> = backend;
        Self {
            backend,
            resolver: Arc::new(ModelResolver::new(
                config.model_map.clone(),
                config.passthrough,
            )),
            metrics: Arc::new(AppMetrics::new()),
            settings: Arc::new(ProxySettings::from_config(config)),
        }
    }

    pub fn new_for_tests<B>(backend: Arc<B>) -> Self
    where
        B: InferenceBackend + 'static,
    {
        Self::new(backend, &ProxyConfig::default())
    }
}
