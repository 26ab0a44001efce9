use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use ollama_compat_proxy::{
    backend::{
        mock::{MockBackend, MockFrame},
        BackendError,
    },
    build_app,
    config::ProxyConfig,
    models::MessageRole,
    state::AppState,
};
use serde_json::Value;
use tower::util::ServiceExt;

fn app_with(backend: MockBackend) -> (Router, Arc<MockBackend>, AppState) {
    let backend = Arc::new(backend);
    let state = AppState::new_for_tests(backend.clone());
    (build_app(state.clone()), backend, state)
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_owned()))
        .expect("request build")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request build")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn body_lines(response: axum::response::Response) -> Vec<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    let text = String::from_utf8(bytes.to_vec()).expect("utf-8 body");
    text.lines()
        .map(|line| serde_json::from_str(line).expect("ndjson line"))
        .collect()
}

#[tokio::test]
async fn generate_translates_alias_and_returns_single_reply() {
    let (app, backend, _) = app_with(MockBackend::replying("Hello"));

    let response = app
        .oneshot(post_json(
            "/api/generate",
            r#"{"model":"mistral:latest","prompt":"hi","stream":false}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["model"], "mistral:latest");
    assert_eq!(body["response"], "Hello");
    assert_eq!(body["done"], true);
    assert_eq!(body["done_reason"], "stop");
    assert!(body["created_at"].as_str().is_some());

    let sent = backend.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].model, "mistral-7b");
    assert!(!sent[0].stream);
    assert_eq!(sent[0].messages.len(), 1);
    assert_eq!(sent[0].messages[0].role, MessageRole::User);
    assert_eq!(sent[0].messages[0].content, "hi");
}

#[tokio::test]
async fn generate_defaults_to_buffered_reply_when_stream_is_omitted() {
    let (app, backend, _) = app_with(MockBackend::replying("ok"));

    let response = app
        .oneshot(post_json(
            "/api/generate",
            r#"{"model":"mistral:latest","prompt":"hi","system":"be brief"}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["response"], "ok");

    let sent = backend.requests();
    assert_eq!(sent[0].messages[0].role, MessageRole::System);
    assert_eq!(sent[0].messages[0].content, "be brief");
    assert_eq!(sent[0].messages[1].content, "hi");
}

#[tokio::test]
async fn chat_streams_fragments_then_one_terminal_frame() {
    let script = vec![
        MockFrame::Delta("Hel".to_owned()),
        MockFrame::Delta("lo".to_owned()),
        MockFrame::Finish(Some("stop".to_owned())),
    ];
    let (app, _, state) = app_with(MockBackend::streaming(script));

    let response = app
        .oneshot(post_json(
            "/api/chat",
            r#"{"model":"mistral:latest","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("application/x-ndjson")
    );

    let frames = body_lines(response).await;
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["message"]["content"], "Hel");
    assert_eq!(frames[0]["message"]["role"], "assistant");
    assert_eq!(frames[0]["done"], false);
    assert_eq!(frames[1]["message"]["content"], "lo");
    assert_eq!(frames[2]["done"], true);
    assert_eq!(frames[2]["done_reason"], "stop");
    assert_eq!(frames[2]["message"]["content"], "");
    assert!(frames.iter().all(|frame| frame["model"] == "mistral:latest"));

    let text: String = frames
        .iter()
        .filter_map(|frame| frame["message"]["content"].as_str())
        .collect();
    assert_eq!(text, "Hello");

    assert_eq!(state.metrics.stream_ends("/api/chat", "completed"), 1);
    assert_eq!(state.metrics.requests("/api/chat", 200, "success"), 1);
    assert_eq!(state.metrics.inflight(), 0);
}

#[tokio::test]
async fn generate_stream_failure_mid_way_ends_with_error_frame() {
    let script = vec![
        MockFrame::Delta("partial".to_owned()),
        MockFrame::Fail(BackendError::Unreachable("connection reset".to_owned())),
    ];
    let (app, _, state) = app_with(MockBackend::streaming(script));

    let response = app
        .oneshot(post_json(
            "/api/generate",
            r#"{"model":"mistral:latest","prompt":"hi","stream":true}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    let frames = body_lines(response).await;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["response"], "partial");
    assert_eq!(frames[1]["done"], true);
    assert_eq!(frames[1]["done_reason"], "error");
    assert_eq!(frames.iter().filter(|frame| frame["done"] == true).count(), 1);

    assert_eq!(state.metrics.errors("backend_unreachable"), 1);
    assert_eq!(state.metrics.stream_ends("/api/generate", "backend_error"), 1);
    assert_eq!(
        state.metrics.requests("/api/generate", 200, "backend_unreachable"),
        1
    );
    assert_eq!(state.metrics.requests("/api/generate", 200, "success"), 0);
}

#[tokio::test]
async fn stream_open_failure_returns_error_envelope() {
    let (app, _, _) = app_with(MockBackend::failing(BackendError::Unreachable(
        "connection refused".to_owned(),
    )));

    let response = app
        .oneshot(post_json(
            "/api/chat",
            r#"{"model":"mistral:latest","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert!(body["error"].as_str().is_some_and(|message| !message.is_empty()));
}

#[tokio::test]
async fn rejects_empty_prompt_and_malformed_json() {
    let (app, backend, state) = app_with(MockBackend::default());

    let empty = app
        .clone()
        .oneshot(post_json(
            "/api/generate",
            r#"{"model":"mistral:latest","prompt":""}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    let body = body_json(empty).await;
    assert!(body["error"].as_str().is_some());

    let malformed = app
        .clone()
        .oneshot(post_json("/api/chat", r#"{"model":"mistral:latest","messages":"#))
        .await
        .expect("request execution");
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    let no_messages = app
        .oneshot(post_json(
            "/api/chat",
            r#"{"model":"mistral:latest","messages":[]}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(no_messages.status(), StatusCode::BAD_REQUEST);

    assert!(backend.requests().is_empty());
    assert_eq!(state.metrics.errors("invalid_request"), 3);
}

#[tokio::test]
async fn unknown_model_is_rejected_when_passthrough_is_disabled() {
    let backend = Arc::new(MockBackend::default());
    let config = ProxyConfig {
        passthrough: false,
        ..ProxyConfig::default()
    };
    let app = build_app(AppState::new(backend.clone(), &config));

    let response = app
        .oneshot(post_json(
            "/api/generate",
            r#"{"model":"llama:13b","prompt":"hi"}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"]
        .as_str()
        .is_some_and(|message| message.contains("llama:13b")));
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn unknown_model_passes_through_by_default() {
    let (app, backend, _) = app_with(MockBackend::replying("ok"));

    let response = app
        .oneshot(post_json(
            "/api/generate",
            r#"{"model":"custom-model","prompt":"hi"}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.requests()[0].model, "custom-model");
    assert_eq!(body_json(response).await["model"], "custom-model");
}

#[tokio::test]
async fn unknown_route_uses_error_envelope() {
    let (app, _, _) = app_with(MockBackend::default());

    let response = app
        .oneshot(get("/api/pull"))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"]
        .as_str()
        .is_some_and(|message| message.contains("/api/pull")));
}

#[tokio::test]
async fn empty_completion_maps_to_bad_gateway() {
    let (app, _, state) = app_with(MockBackend::empty_choices());

    let response = app
        .oneshot(post_json(
            "/api/chat",
            r#"{"model":"mistral:latest","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(state.metrics.errors("empty_completion"), 1);
}

#[tokio::test]
async fn backend_failures_map_to_gateway_statuses() {
    let cases = [
        (
            BackendError::Unreachable("connection refused".to_owned()),
            StatusCode::BAD_GATEWAY,
        ),
        (
            BackendError::Timeout("no answer".to_owned()),
            StatusCode::GATEWAY_TIMEOUT,
        ),
        (
            BackendError::Status {
                status: 500,
                message: "model crashed".to_owned(),
            },
            StatusCode::BAD_GATEWAY,
        ),
    ];

    for (error, expected) in cases {
        let (app, _, state) = app_with(MockBackend::failing(error));
        let response = app
            .oneshot(post_json(
                "/api/generate",
                r#"{"model":"mistral:latest","prompt":"hi"}"#,
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), expected);
        assert_eq!(state.metrics.inflight(), 0);
        let body = body_json(response).await;
        assert!(body["error"].as_str().is_some());
    }
}

#[tokio::test]
async fn tags_lists_configured_aliases() {
    let (app, _, _) = app_with(MockBackend::default());

    for path in ["/api/tags", "/api/models"] {
        let response = app
            .clone()
            .oneshot(get(path))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let models = body["models"].as_array().expect("models array");
        let names: Vec<&str> = models
            .iter()
            .filter_map(|model| model["name"].as_str())
            .collect();
        assert!(names.contains(&"mistral:latest"));
        assert!(names.contains(&"mixtral:8x7b"));

        let mixtral = models
            .iter()
            .find(|model| model["name"] == "mixtral:8x7b")
            .expect("mixtral entry");
        assert_eq!(mixtral["size"], 47_000_000_000_u64);
        assert_eq!(mixtral["digest"].as_str().map(str::len), Some(64));
    }
}

#[tokio::test]
async fn version_and_health_respond() {
    let (app, _, _) = app_with(MockBackend::default());

    let version = app
        .clone()
        .oneshot(get("/api/version"))
        .await
        .expect("request execution");
    assert_eq!(version.status(), StatusCode::OK);
    let body = body_json(version).await;
    assert!(body["version"]
        .as_str()
        .is_some_and(|version| !version.is_empty()));

    let health = app.oneshot(get("/")).await.expect("request execution");
    assert_eq!(health.status(), StatusCode::OK);
    let bytes = to_bytes(health.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    assert_eq!(&bytes[..], b"Ollama is running");
}

#[tokio::test]
async fn metrics_reflect_completed_requests() {
    let (app, _, state) = app_with(MockBackend::default());

    let generate = app
        .clone()
        .oneshot(post_json(
            "/api/generate",
            r#"{"model":"mistral:latest","prompt":"hi"}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(generate.status(), StatusCode::OK);
    let _ = to_bytes(generate.into_body(), usize::MAX).await;

    let response = app
        .oneshot(get("/metrics"))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/plain")));

    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    let text = String::from_utf8(bytes.to_vec()).expect("utf-8 metrics");
    assert!(text.contains("proxy_http_requests_total"));
    assert!(text.contains("endpoint=\"/api/generate\""));
    assert!(text.contains("proxy_tokens_total"));
    assert_eq!(state.metrics.inflight(), 0);
}

#[tokio::test]
async fn slow_stream_still_terminates_with_done_frame() {
    let backend = MockBackend::replying("one two three").with_frame_delay(Duration::from_millis(5));
    let (app, _, state) = app_with(backend);

    let response = app
        .oneshot(post_json(
            "/api/generate",
            r#"{"model":"mistral:latest","prompt":"hi","stream":true}"#,
        ))
        .await
        .expect("request execution");

    let frames = body_lines(response).await;
    let last = frames.last().expect("terminal frame");
    assert_eq!(last["done"], true);
    let text: String = frames
        .iter()
        .filter_map(|frame| frame["response"].as_str())
        .collect();
    assert_eq!(text, "one two three");
    assert_eq!(state.metrics.inflight(), 0);
}
