use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::time::sleep;
use tracing::debug;

use crate::backend::{BackendError, BackendStream, InferenceBackend};
use crate::models::{
    BackendChatCompletion, BackendChatRequest, BackendChoice, BackendMessage, MessageRole,
    StreamFrame, Usage,
};

/// One scripted step of a mock stream.
#[derive(Debug, Clone)]
pub enum MockFrame {
    Delta(String),
    Finish(Option<String>),
    Fail(BackendError),
    /// Never yields again; the stream only ends when dropped.
    Hang,
}

#[derive(Debug, Clone)]
enum Reply {
    Echo,
    Content(String),
    EmptyChoices,
    Fail(BackendError),
}

/// Scriptable in-process backend that records what it receives.
#[derive(Debug, Clone)]
pub struct MockBackend {
    name: String,
    models: Vec<String>,
    reply: Reply,
    script: Option<Vec<MockFrame>>,
    frame_delay: Duration,
    requests: Arc<Mutex<Vec<BackendChatRequest>>>,
    frames_pulled: Arc<AtomicUsize>,
    stream_dropped: Arc<AtomicBool>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            name: "mock-backend".to_owned(),
            models: vec!["mistral-7b".to_owned()],
            reply: Reply::Echo,
            script: None,
            frame_delay: Duration::ZERO,
            requests: Arc::new(Mutex::new(Vec::new())),
            frames_pulled: Arc::new(AtomicUsize::new(0)),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MockBackend {
    pub fn replying(content: impl Into<String>) -> Self {
        Self {
            reply: Reply::Content(content.into()),
            ..Self::default()
        }
    }

    pub fn streaming(script: Vec<MockFrame>) -> Self {
        Self {
            script: Some(script),
            ..Self::default()
        }
    }

    pub fn empty_choices() -> Self {
        Self {
            reply: Reply::EmptyChoices,
            ..Self::default()
        }
    }

    pub fn failing(error: BackendError) -> Self {
        Self {
            reply: Reply::Fail(error),
            ..Self::default()
        }
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<BackendChatRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Number of scripted frames the consumer has pulled so far.
    pub fn frames_pulled(&self) -> usize {
        self.frames_pulled.load(Ordering::SeqCst)
    }

    /// True once a stream handed out by this backend has been dropped.
    pub fn stream_dropped(&self) -> bool {
        self.stream_dropped.load(Ordering::SeqCst)
    }

    fn record(&self, request: &BackendChatRequest) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
    }

    fn content_for(&self, request: &BackendChatRequest) -> Result<Option<String>, BackendError> {
        match &self.reply {
            Reply::Echo => Ok(Some(render_response(request))),
            Reply::Content(content) => Ok(Some(content.clone())),
            Reply::EmptyChoices => Ok(None),
            Reply::Fail(error) => Err(error.clone()),
        }
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        if let Reply::Fail(error) = &self.reply {
            return Err(error.clone());
        }
        Ok(self.models.clone())
    }

    async fn execute_chat(
        &self,
        request: BackendChatRequest,
    ) -> Result<BackendChatCompletion, BackendError> {
        self.record(&request);
        let choices = self
            .content_for(&request)?
            .map(|content| {
                vec![BackendChoice {
                    message: BackendMessage {
                        role: MessageRole::Assistant,
                        content: Some(content),
                    },
                    finish_reason: Some("stop".to_owned()),
                }]
            })
            .unwrap_or_default();
        let completion_tokens = choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .map(rough_token_estimate)
            .unwrap_or_default();

        Ok(BackendChatCompletion {
            model: request.model.clone(),
            choices,
            usage: Some(Usage {
                prompt_tokens: prompt_tokens(&request),
                completion_tokens,
            }),
        })
    }

    async fn stream_chat(
        &self,
        request: BackendChatRequest,
    ) -> Result<BackendStream, BackendError> {
        self.record(&request);
        let script = match &self.script {
            Some(script) => script.clone(),
            None => {
                let content = self.content_for(&request)?.unwrap_or_default();
                let mut frames = split_for_stream(&content)
                    .into_iter()
                    .map(MockFrame::Delta)
                    .collect::<Vec<_>>();
                frames.push(MockFrame::Finish(Some("stop".to_owned())));
                frames
            }
        };

        let delay = self.frame_delay;
        let pulled = self.frames_pulled.clone();
        let flag = DropFlag(self.stream_dropped.clone());
        let stream = async_stream::stream! {
            let _flag = flag;
            for step in script {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                pulled.fetch_add(1, Ordering::SeqCst);
                match step {
                    MockFrame::Delta(content) => {
                        yield Ok(StreamFrame::delta(content));
                    }
                    MockFrame::Finish(reason) => {
                        yield Ok(StreamFrame::finished(reason.as_deref()));
                        break;
                    }
                    MockFrame::Fail(error) => {
                        yield Err(error);
                        break;
                    }
                    MockFrame::Hang => futures_util::future::pending::<()>().await,
                }
            }
        };

        debug!(backend = %self.name, "stream prepared");
        Ok(stream.boxed())
    }
}

fn render_response(request: &BackendChatRequest) -> String {
    let prompt = request
        .messages
        .iter()
        .rev()
        .find(|message| message.role == MessageRole::User)
        .map(|message| message.content.as_str())
        .unwrap_or("hello");

    format!("Mock response for model {}: {}", request.model, prompt)
}

fn prompt_tokens(request: &BackendChatRequest) -> u32 {
    request
        .messages
        .iter()
        .map(|message| rough_token_estimate(&message.content))
        .sum::<u32>()
}

fn rough_token_estimate(text: &str) -> u32 {
    if text.trim().is_empty() {
        return 0;
    }
    text.split_whitespace().count() as u32
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<String> = text.split_whitespace().map(ToString::to_string).collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token
            } else {
                format!("{token} ")
            }
        })
        .collect()
}
