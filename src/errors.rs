use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    backend::{BackendError, BackendTarget},
    models::GenerationRequest,
    session::SessionError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{message}")]
    Connection { message: String, suggestion: String },
    #[error("{message}")]
    Upstream { message: String, suggestion: String },
    #[error("{message}")]
    TimedOut { message: String, suggestion: String },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

/// JSON body of every error response the bridge sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl AppError {
    pub fn from_session(
        error: SessionError,
        target: &BackendTarget,
        request: &GenerationRequest,
    ) -> Self {
        let backend = target.kind();
        match error {
            SessionError::Backend(BackendError::Connection { .. }) => AppError::Connection {
                message: error.to_string(),
                suggestion: format!(
                    "Check that {backend} is running and reachable at {}, or set {} to the right address.",
                    target.base_url(),
                    backend.host_variable()
                ),
            },
            SessionError::Backend(BackendError::Upstream { message, .. }) => AppError::Upstream {
                message,
                suggestion: format!(
                    "Check that {backend} is running and that model '{}' is available.",
                    request.model_name
                ),
            },
            SessionError::Backend(BackendError::Cancelled(_)) => {
                AppError::Internal("request was cancelled before it started".to_owned())
            }
            SessionError::TimedOut(timeout) => AppError::TimedOut {
                message: format!(
                    "{backend} produced no output within {} seconds",
                    timeout.as_secs()
                ),
                suggestion: "Try a smaller model or raise API_TIMEOUT_DURATION.".to_owned(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Connection { .. } => "connection_error",
            AppError::Upstream { .. } => "upstream_error",
            AppError::TimedOut { .. } => "timed_out",
            AppError::NotFound(_) => "not_found",
            AppError::Internal(_) => "server_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Connection { .. } => StatusCode::BAD_GATEWAY,
            AppError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = self.kind().to_owned();
        let (message, suggestion) = match self {
            AppError::Connection {
                message,
                suggestion,
            }
            | AppError::Upstream {
                message,
                suggestion,
            }
            | AppError::TimedOut {
                message,
                suggestion,
            } => (message, Some(suggestion)),
            AppError::Validation(message)
            | AppError::NotFound(message)
            | AppError::Internal(message) => (message, None),
        };

        let payload = ErrorBody {
            error,
            message,
            suggestion,
        };
        (status, Json(payload)).into_response()
    }
}

pub fn apply_header(headers: &mut axum::http::HeaderMap, name: &str, value: &str) {
    let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
        return;
    };
    let Ok(header_value) = HeaderValue::from_str(value) else {
        return;
    };
    headers.insert(header_name, header_value);
}
