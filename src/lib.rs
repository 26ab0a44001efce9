pub mod backend;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod resolver;
pub mod state;
pub mod translate;

use std::sync::Arc;

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use backend::openai::OpenAiBackend;
use config::{ConfigError, ProxyConfig};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub fn build_state(config: &ProxyConfig) -> Result<state::AppState, std::io::Error> {
    let backend = OpenAiBackend::from_config(config).map_err(std::io::Error::other)?;
    info!(
        backend = %backend.base_url(),
        aliases = config.model_map.len(),
        passthrough = config.passthrough,
        "backend configured"
    );
    Ok(state::AppState::new(Arc::new(backend), config))
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route("/api/version", get(handlers::version))
        .route("/api/tags", get(handlers::list_models))
        .route("/api/models", get(handlers::list_models))
        .route("/api/generate", post(handlers::generate))
        .route("/api/chat", post(handlers::chat))
        .route("/metrics", get(handlers::metrics))
        .route("/api/metrics", get(handlers::metrics))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `*` allows any origin; otherwise only the listed ones.
pub fn cors_layer(origins: &[String]) -> Result<CorsLayer, ConfigError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]);

    if origins.iter().any(|origin| origin == "*") {
        return Ok(layer.allow_origin(Any));
    }

    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .map_err(|_| ConfigError::InvalidCorsOrigin(origin.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

/// Checks once at startup that every mapped model is served by the backend.
/// Failures are logged only; the proxy starts either way.
pub async fn probe_backend(state: &state::AppState) {
    let served = match state.backend.list_models().await {
        Ok(served) => served,
        Err(error) => {
            warn!(
                backend = state.backend.name(),
                stage = error.stage(),
                error = %error,
                "backend model listing failed at startup"
            );
            return;
        }
    };

    let mut missing = 0;
    for mapping in state.resolver.mappings() {
        if !served.iter().any(|id| id == &mapping.backend_id) {
            missing += 1;
            warn!(
                alias = %mapping.client_alias,
                backend_model = %mapping.backend_id,
                "mapped model is not served by the backend"
            );
        }
    }

    let unmapped = served
        .iter()
        .filter(|id| state.resolver.alias_for(id).is_none())
        .count();
    info!(
        backend = state.backend.name(),
        served = served.len(),
        missing,
        unmapped,
        "backend model probe finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_layer_accepts_wildcard_and_explicit_origins() {
        assert!(cors_layer(&["*".to_owned()]).is_ok());
        assert!(cors_layer(&["http://localhost:3000".to_owned()]).is_ok());
    }

    #[test]
    fn cors_layer_rejects_unencodable_origin() {
        let error = cors_layer(&["http://bad\norigin".to_owned()]).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidCorsOrigin(_)));
    }
}
