use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("model \"{0}\" not found, try pulling it first")]
    UnknownModel(String),
    #[error("{0}")]
    NotFound(String),
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),
    #[error("backend timed out: {0}")]
    BackendTimeout(String),
    #[error("{}", backend_status_message(.status, .message))]
    BackendStatus { status: u16, message: String },
    #[error("failed to translate backend response: {0}")]
    BackendMalformed(String),
    #[error("backend returned an empty completion")]
    EmptyCompletion,
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Metric label distinguishing caller misuse from backend instability.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::UnknownModel(_) => "unknown_model",
            AppError::NotFound(_) => "not_found",
            AppError::BackendUnreachable(_) => "backend_unreachable",
            AppError::BackendTimeout(_) => "backend_timeout",
            AppError::BackendStatus { .. } => "backend_status",
            AppError::BackendMalformed(_) => "backend_malformed",
            AppError::EmptyCompletion => "empty_completion",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UnknownModel(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::BackendUnreachable(_)
            | AppError::BackendStatus { .. }
            | AppError::BackendMalformed(_)
            | AppError::EmptyCompletion => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

fn backend_status_message(status: &u16, message: &str) -> String {
    if message.trim().is_empty() {
        format!("backend returned status {status} and the response could not be translated")
    } else {
        message.to_owned()
    }
}

#[derive(Debug, Serialize)]
struct OllamaErrorEnvelope {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let payload = OllamaErrorEnvelope {
            error: self.to_string(),
        };
        (status, Json(payload)).into_response()
    }
}

impl From<BackendError> for AppError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Unreachable(message) => AppError::BackendUnreachable(message),
            BackendError::Timeout(message) => AppError::BackendTimeout(message),
            BackendError::Stalled(after) => AppError::BackendTimeout(format!(
                "no data received for {}s",
                after.as_secs()
            )),
            BackendError::Status { status, message } => AppError::BackendStatus { status, message },
            BackendError::InvalidResponse(message) => AppError::BackendMalformed(message),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidRequest(rejection.body_text())
    }
}
