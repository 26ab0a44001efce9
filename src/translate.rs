use std::time::Duration;

use serde_json::{Map, Value};

use crate::{
    errors::AppError,
    models::{
        BackendChatCompletion, BackendChatRequest, ChatMessage, ChatRequest, ChatResponse,
        ClientFrame, GenerateRequest, GenerateResponse, MessageRole, ResponseShape, Usage,
    },
    resolver::ModelResolver,
};

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct SamplingOptions {
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    seed: Option<i64>,
}

pub fn translate_generate(
    request: GenerateRequest,
    resolver: &ModelResolver,
) -> Result<BackendChatRequest, AppError> {
    let model = require_model(&request.model, resolver)?;
    if request.prompt.is_empty() {
        return Err(AppError::InvalidRequest("prompt must not be empty".to_owned()));
    }

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = request.system.filter(|system| !system.is_empty()) {
        messages.push(ChatMessage::new(MessageRole::System, system));
    }
    messages.push(ChatMessage::new(MessageRole::User, request.prompt));

    Ok(backend_request(
        model,
        messages,
        request.stream.unwrap_or(false),
        sampling_options(request.options.as_ref()),
    ))
}

pub fn translate_chat(
    request: ChatRequest,
    resolver: &ModelResolver,
) -> Result<BackendChatRequest, AppError> {
    let model = require_model(&request.model, resolver)?;
    if request.messages.is_empty() {
        return Err(AppError::InvalidRequest("messages must not be empty".to_owned()));
    }

    Ok(backend_request(
        model,
        request.messages,
        request.stream.unwrap_or(false),
        sampling_options(request.options.as_ref()),
    ))
}

fn require_model(model: &str, resolver: &ModelResolver) -> Result<String, AppError> {
    if model.trim().is_empty() {
        return Err(AppError::InvalidRequest("model is required".to_owned()));
    }
    resolver.resolve(model)
}

fn backend_request(
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: SamplingOptions,
) -> BackendChatRequest {
    BackendChatRequest {
        model,
        messages,
        stream,
        max_tokens: options.max_tokens,
        temperature: options.temperature,
        top_p: options.top_p,
        seed: options.seed,
    }
}

/// Unrecognized or non-numeric options are dropped rather than rejected.
fn sampling_options(options: Option<&Map<String, Value>>) -> SamplingOptions {
    let Some(options) = options else {
        return SamplingOptions::default();
    };

    SamplingOptions {
        // Ollama uses -1 (and -2) for "no limit".
        max_tokens: options
            .get("num_predict")
            .and_then(Value::as_i64)
            .filter(|limit| *limit >= 0)
            .and_then(|limit| u32::try_from(limit).ok()),
        temperature: options
            .get("temperature")
            .and_then(Value::as_f64)
            .map(|value| value as f32),
        top_p: options
            .get("top_p")
            .and_then(Value::as_f64)
            .map(|value| value as f32),
        seed: options.get("seed").and_then(Value::as_i64),
    }
}

/// Maps the backend's primary choice into the requested client shape.
pub fn translate_completion(
    completion: BackendChatCompletion,
    shape: ResponseShape,
    model_alias: &str,
    elapsed: Duration,
) -> Result<ClientFrame, AppError> {
    let Some(choice) = completion.choices.into_iter().next() else {
        return Err(AppError::EmptyCompletion);
    };

    let content = choice.message.content.unwrap_or_default();
    let done_reason = choice.finish_reason.unwrap_or_else(|| "stop".to_owned());
    let mut frame = match shape {
        ResponseShape::Generate => ClientFrame::Generate(GenerateResponse {
            model: model_alias.to_owned(),
            created_at: now_rfc3339(),
            response: content,
            done: true,
            done_reason: None,
            total_duration: None,
            prompt_eval_count: None,
            eval_count: None,
        }),
        ResponseShape::Chat => ClientFrame::Chat(ChatResponse {
            model: model_alias.to_owned(),
            created_at: now_rfc3339(),
            message: ChatMessage::new(choice.message.role, content),
            done: true,
            done_reason: None,
            total_duration: None,
            prompt_eval_count: None,
            eval_count: None,
        }),
    };
    apply_summary(&mut frame, Some(done_reason), completion.usage, elapsed);
    Ok(frame)
}

/// Incremental client frame carrying one backend text delta.
pub fn fragment_frame(shape: ResponseShape, model_alias: &str, text: String) -> ClientFrame {
    match shape {
        ResponseShape::Generate => ClientFrame::Generate(GenerateResponse {
            model: model_alias.to_owned(),
            created_at: now_rfc3339(),
            response: text,
            done: false,
            done_reason: None,
            total_duration: None,
            prompt_eval_count: None,
            eval_count: None,
        }),
        ResponseShape::Chat => ClientFrame::Chat(ChatResponse {
            model: model_alias.to_owned(),
            created_at: now_rfc3339(),
            message: ChatMessage::new(MessageRole::Assistant, text),
            done: false,
            done_reason: None,
            total_duration: None,
            prompt_eval_count: None,
            eval_count: None,
        }),
    }
}

/// The terminal frame of a stream: empty text, `done = true`.
pub fn terminal_frame(
    shape: ResponseShape,
    model_alias: &str,
    done_reason: Option<String>,
    usage: Option<Usage>,
    elapsed: Duration,
) -> ClientFrame {
    let mut frame = fragment_frame(shape, model_alias, String::new());
    match &mut frame {
        ClientFrame::Generate(inner) => inner.done = true,
        ClientFrame::Chat(inner) => inner.done = true,
    }
    apply_summary(&mut frame, done_reason, usage, elapsed);
    frame
}

fn apply_summary(
    frame: &mut ClientFrame,
    done_reason: Option<String>,
    usage: Option<Usage>,
    elapsed: Duration,
) {
    let total_duration = u64::try_from(elapsed.as_nanos()).ok();
    let prompt_eval_count = usage.map(|usage| usage.prompt_tokens);
    let eval_count = usage.map(|usage| usage.completion_tokens);

    macro_rules! fill {
        ($inner:expr) => {{
            $inner.done_reason = done_reason;
            $inner.total_duration = total_duration;
            $inner.prompt_eval_count = prompt_eval_count;
            $inner.eval_count = eval_count;
        }};
    }

    match frame {
        ClientFrame::Generate(inner) => fill!(inner),
        ClientFrame::Chat(inner) => fill!(inner),
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
