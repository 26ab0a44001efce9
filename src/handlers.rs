use std::{convert::Infallible, time::Instant};

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header::CONTENT_TYPE, Method, Uri},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    errors::AppError,
    metrics::InflightGuard,
    models::{
        BackendChatRequest, ChatRequest, GenerateRequest, ModelEntry, ModelList, ResponseShape,
        VersionResponse,
    },
    relay::{spawn_relay, Relay},
    state::AppState,
    translate::{translate_chat, translate_completion, translate_generate},
};

pub async fn health() -> &'static str {
    "Ollama is running"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => {
            let error = AppError::Internal(format!("metrics render failed: {error}"));
            state.metrics.observe_error(error.kind());
            error.into_response()
        }
    }
}

pub async fn version(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let _inflight = state.metrics.inflight_guard();
    let payload = VersionResponse {
        version: state.settings.reported_version.clone(),
    };
    finish(&state, "/api/version", started, Ok(Json(payload).into_response()))
}

pub async fn list_models(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let _inflight = state.metrics.inflight_guard();

    let models = state
        .resolver
        .list_client_aliases()
        .into_iter()
        .map(|alias| {
            let backend_id = state
                .resolver
                .resolve(alias)
                .unwrap_or_else(|_| alias.to_owned());
            ModelEntry {
                name: alias.to_owned(),
                model: alias.to_owned(),
                modified_at: state.settings.started_at.clone(),
                size: estimate_model_size(&backend_id),
                digest: digest_for(&backend_id),
            }
        })
        .collect();

    finish(
        &state,
        "/api/tags",
        started,
        Ok(Json(ModelList { models }).into_response()),
    )
}

pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let inflight = state.metrics.inflight_guard();

    let result = match payload {
        Ok(Json(request)) => {
            let model_alias = request.model.clone();
            match translate_generate(request, &state.resolver) {
                Ok(backend_request) => {
                    dispatch(&state, backend_request, ResponseShape::Generate, model_alias, inflight, started)
                        .await
                }
                Err(error) => Err(error),
            }
        }
        Err(rejection) => Err(AppError::from(rejection)),
    };

    match result {
        Ok(Reply::Streaming(response)) => response,
        other => finish(
            &state,
            ResponseShape::Generate.endpoint(),
            started,
            other.map(Reply::into_response),
        ),
    }
}

pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let inflight = state.metrics.inflight_guard();

    let result = match payload {
        Ok(Json(request)) => {
            let model_alias = request.model.clone();
            match translate_chat(request, &state.resolver) {
                Ok(backend_request) => {
                    dispatch(&state, backend_request, ResponseShape::Chat, model_alias, inflight, started)
                        .await
                }
                Err(error) => Err(error),
            }
        }
        Err(rejection) => Err(AppError::from(rejection)),
    };

    match result {
        Ok(Reply::Streaming(response)) => response,
        other => finish(
            &state,
            ResponseShape::Chat.endpoint(),
            started,
            other.map(Reply::into_response),
        ),
    }
}

pub async fn not_found(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    let started = Instant::now();
    let error = AppError::NotFound(format!("{method} {} not found", uri.path()));
    finish(&state, "unmatched", started, Err(error))
}

/// Streaming replies are recorded by the relay once the stream ends.
enum Reply {
    Buffered(Response),
    Streaming(Response),
}

impl Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Buffered(response) | Reply::Streaming(response) => response,
        }
    }
}

async fn dispatch(
    state: &AppState,
    request: BackendChatRequest,
    shape: ResponseShape,
    model_alias: String,
    inflight: InflightGuard,
    started: Instant,
) -> Result<Reply, AppError> {
    let request_id = format!("req_{}", Uuid::new_v4());
    info!(
        request_id = %request_id,
        backend = state.backend.name(),
        endpoint = shape.endpoint(),
        model = %model_alias,
        backend_model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "request accepted"
    );

    if request.stream {
        let frames = state.backend.stream_chat(request).await?;
        let relay = Relay::new(shape, model_alias, started);
        let body = spawn_relay(
            frames,
            relay,
            state.metrics.clone(),
            inflight,
            state.settings.stream_window,
        );
        let body = Body::from_stream(body.map(Ok::<_, Infallible>));
        return Ok(Reply::Streaming(
            ([(CONTENT_TYPE, "application/x-ndjson")], body).into_response(),
        ));
    }

    let completion = state.backend.execute_chat(request).await?;
    if let Some(usage) = &completion.usage {
        state.metrics.observe_usage(usage);
    }
    let reply = translate_completion(completion, shape, &model_alias, started.elapsed())?;
    info!(request_id = %request_id, elapsed_ms = started.elapsed().as_millis() as u64, "request completed");
    Ok(Reply::Buffered(Json(reply).into_response()))
}

/// Maps errors into the client envelope and records the exchange.
fn finish(
    state: &AppState,
    endpoint: &str,
    started: Instant,
    result: Result<Response, AppError>,
) -> Response {
    let (response, outcome) = match result {
        Ok(response) => (response, "success"),
        Err(error) => {
            let kind = error.kind();
            state.metrics.observe_error(kind);
            if error.is_client_error() {
                info!(endpoint, kind, error = %error, "request rejected");
            } else {
                warn!(endpoint, kind, error = %error, "request failed");
            }
            (error.into_response(), kind)
        }
    };

    state.metrics.observe_request(
        endpoint,
        response.status().as_u16(),
        outcome,
        started.elapsed(),
    );
    response
}

fn estimate_model_size(backend_id: &str) -> u64 {
    match backend_id {
        id if id.contains("8x7b") => 47_000_000_000,
        id if id.contains("70b") => 40_000_000_000,
        _ => 4_100_000_000,
    }
}

fn digest_for(backend_id: &str) -> String {
    let digest = Sha256::digest(backend_id.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
