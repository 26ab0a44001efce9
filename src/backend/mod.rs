pub mod mock;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::models::{BackendChatCompletion, BackendChatRequest, StreamFrame};

/// Lazily produced backend frames; dropping it cancels the backend request.
pub type BackendStream = BoxStream<'static, Result<StreamFrame, BackendError>>;

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;
    async fn execute_chat(
        &self,
        request: BackendChatRequest,
    ) -> Result<BackendChatCompletion, BackendError>;
    async fn stream_chat(&self, request: BackendChatRequest) -> Result<BackendStream, BackendError>;
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend stream stalled for {}s", .0.as_secs())]
    Stalled(Duration),
    #[error("backend status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("backend invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn stage(&self) -> &'static str {
        match self {
            BackendError::Unreachable(_) => "unreachable",
            BackendError::Timeout(_) | BackendError::Stalled(_) => "timeout",
            BackendError::Status { .. } => "status",
            BackendError::InvalidResponse(_) => "invalid_response",
        }
    }
}
