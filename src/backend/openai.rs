use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    backend::{BackendError, BackendStream, InferenceBackend},
    config::ProxyConfig,
    models::{BackendChatCompletion, BackendChatRequest, MessageRole, StreamFrame, Usage},
};

#[derive(Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    stall_timeout: Duration,
    connect_retries: u32,
    max_line_length: usize,
}

impl OpenAiBackend {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, String> {
        // No client-wide timeout: streams are bounded by the stall timeout instead.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|error| format!("failed to build backend HTTP client: {error}"))?;

        Ok(Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_owned(),
            request_timeout: config.request_timeout,
            stall_timeout: config.stall_timeout,
            connect_retries: config.connect_retries,
            max_line_length: config.max_line_length,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Retries only failures to establish the connection; once the backend
    /// has started answering, a retry could duplicate output.
    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, BackendError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_connect() && attempt < self.connect_retries => {
                    attempt += 1;
                    warn!(
                        backend = %self.base_url,
                        attempt,
                        error = %error,
                        "backend connection failed, retrying"
                    );
                }
                Err(error) => return Err(map_send_error(error)),
            }
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_http_error(status, &body))
    }
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let url = self.url("/v1/models");
        let response = self
            .send_with_retry(|| self.client.get(&url).timeout(self.request_timeout))
            .await?;
        let response = Self::check_status(response).await?;
        let bytes = response.bytes().await.map_err(map_read_error)?;
        let parsed: OpenAiModelList = serde_json::from_slice(&bytes)
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;
        Ok(parsed.data.into_iter().map(|model| model.id).collect())
    }

    async fn execute_chat(
        &self,
        request: BackendChatRequest,
    ) -> Result<BackendChatCompletion, BackendError> {
        let url = self.url("/v1/chat/completions");
        let response = self
            .send_with_retry(|| {
                self.client
                    .post(&url)
                    .timeout(self.request_timeout)
                    .json(&request)
            })
            .await?;
        let response = Self::check_status(response).await?;

        // A body that fails part-way is reported like any other backend failure.
        let bytes = response.bytes().await.map_err(map_read_error)?;
        serde_json::from_slice::<BackendChatCompletion>(&bytes)
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))
    }

    async fn stream_chat(&self, request: BackendChatRequest) -> Result<BackendStream, BackendError> {
        let url = self.url("/v1/chat/completions");
        // The stall timeout covers the body; this bounds the wait for headers.
        let opened = async {
            let response = self
                .send_with_retry(|| {
                    self.client
                        .post(&url)
                        .header(reqwest::header::ACCEPT, "text/event-stream")
                        .json(&request)
                })
                .await?;
            Self::check_status(response).await
        };
        let response = tokio::time::timeout(self.request_timeout, opened)
            .await
            .map_err(|_| {
                BackendError::Timeout(format!(
                    "no response from backend within {}s",
                    self.request_timeout.as_secs_f32()
                ))
            })??;

        let stall = self.stall_timeout;
        let mut upstream = response.bytes_stream();
        let mut decoder = SseDecoder::new(self.max_line_length);

        let stream = async_stream::stream! {
            'read: loop {
                let next = match tokio::time::timeout(stall, upstream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Err(BackendError::Stalled(stall));
                        break;
                    }
                };

                let bytes = match next {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(error)) => {
                        yield Err(map_read_error(error));
                        break;
                    }
                    None => {
                        match decoder.finish() {
                            Ok(frames) => {
                                for frame in frames {
                                    yield Ok(frame);
                                }
                            }
                            Err(error) => {
                                yield Err(error);
                            }
                        }
                        break;
                    }
                };

                match decoder.push(&bytes) {
                    Ok(frames) => {
                        for frame in frames {
                            let finished = matches!(frame, StreamFrame::Finished { .. });
                            yield Ok(frame);
                            if finished {
                                break 'read;
                            }
                        }
                    }
                    Err(error) => {
                        yield Err(error);
                        break;
                    }
                }
            }
        };

        debug!(backend = %self.base_url, model = %request.model, "stream opened");
        Ok(stream.boxed())
    }
}

/// Incremental decoder for the backend's `text/event-stream` body.
///
/// Holds at most one partial line; a line longer than `max_line_length`
/// fails the stream.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    max_line_length: usize,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    finished: bool,
}

impl SseDecoder {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_length,
            finish_reason: None,
            usage: None,
            finished: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamFrame>, BackendError> {
        let mut frames = Vec::new();
        if self.finished {
            return Ok(frames);
        }

        self.buffer.extend_from_slice(bytes);
        while let Some(index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=index).collect::<Vec<u8>>();
            if line.len() - 1 > self.max_line_length {
                return Err(self.line_too_long());
            }
            if let Some(frame) = self.decode_line(&line)? {
                frames.push(frame);
            }
            if self.finished {
                self.buffer.clear();
                return Ok(frames);
            }
        }

        if self.buffer.len() > self.max_line_length {
            return Err(self.line_too_long());
        }
        Ok(frames)
    }

    fn line_too_long(&self) -> BackendError {
        BackendError::InvalidResponse(format!(
            "stream line exceeds {} bytes",
            self.max_line_length
        ))
    }

    /// Called at end of input; completion is implied when `[DONE]` never arrived.
    pub fn finish(&mut self) -> Result<Vec<StreamFrame>, BackendError> {
        let mut frames = Vec::new();
        if self.finished {
            return Ok(frames);
        }

        let rest = std::mem::take(&mut self.buffer);
        if let Some(frame) = self.decode_line(&rest)? {
            frames.push(frame);
        }
        if !self.finished {
            frames.push(self.completion());
        }
        Ok(frames)
    }

    fn completion(&mut self) -> StreamFrame {
        self.finished = true;
        StreamFrame::Finished {
            finish_reason: self.finish_reason.take(),
            usage: self.usage.take(),
        }
    }

    fn decode_line(&mut self, raw: &[u8]) -> Result<Option<StreamFrame>, BackendError> {
        let line = std::str::from_utf8(raw)
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?
            .trim();

        // Blank separators, `:` comments and event/id/retry fields carry no payload.
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(None);
        }
        if payload == "[DONE]" {
            return Ok(Some(self.completion()));
        }

        let chunk: OpenAiStreamChunk = serde_json::from_str(payload)
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

        if let Some(error) = chunk.error {
            return Err(BackendError::InvalidResponse(format!(
                "backend reported error: {}",
                error_text(&error).unwrap_or_else(|| error.to_string())
            )));
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(None);
        };
        if choice.finish_reason.is_some() {
            self.finish_reason = choice.finish_reason;
        }
        Ok(choice
            .delta
            .content
            .filter(|content| !content.is_empty())
            .map(|content| StreamFrame::Delta {
                content,
                role: choice.delta.role,
            }))
    }
}

fn map_send_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else {
        BackendError::Unreachable(error.to_string())
    }
}

fn map_read_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else if error.is_decode() {
        BackendError::InvalidResponse(error.to_string())
    } else {
        BackendError::Unreachable(format!("connection lost while reading response: {error}"))
    }
}

fn map_http_error(status: StatusCode, body: &str) -> BackendError {
    let message = extract_error_message(body);
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Timeout(format!("upstream timeout: {message}"))
        }
        _ => BackendError::Status {
            status: status.as_u16(),
            message,
        },
    }
}

/// Best-effort extraction of the backend's own error text; empty when none.
pub fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(text) = value.get("error").and_then(error_text) {
            return text;
        }
        for key in ["message", "detail"] {
            if let Some(text) = value.get(key).and_then(Value::as_str) {
                return text.to_owned();
            }
        }
    }
    body.trim().chars().take(400).collect()
}

fn error_text(error: &Value) -> Option<String> {
    match error {
        Value::String(text) => Some(text.clone()),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiModelList {
    #[serde(default, alias = "models")]
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    role: Option<MessageRole>,
    #[serde(default)]
    content: Option<String>,
}
