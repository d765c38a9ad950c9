use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::providers::ProviderError;
use crate::providers::util::truncate_payload;

/// Unified application error type following OpenAI error format.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("The model '{0}' does not exist or you do not have access to it")]
    ModelNotFound(String),

    #[error("{0}")]
    UnsupportedFeature(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Network failures, after retries for buffered calls.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream payload could not be decoded.
    #[error("Upstream returned an unreadable response: {0}")]
    UpstreamProtocol(String),

    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// OpenAI-compatible error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: Option<String>,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::ModelNotFound(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UnsupportedFeature(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            // Caller-facing upstream statuses pass through; credential and
            // server failures upstream are the gateway's problem.
            Self::Upstream { status, .. } => match status {
                400 | 404 | 408 | 413 | 422 | 429 => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "authentication_error",
            Self::Forbidden(_) => "permission_error",
            Self::ModelNotFound(_) | Self::UnsupportedFeature(_) | Self::BadRequest(_) => {
                "invalid_request_error"
            }
            Self::NotFound(_) => "not_found_error",
            Self::Upstream { status: 429, .. } => "rate_limit_error",
            Self::UpstreamUnavailable(_) | Self::UpstreamProtocol(_) | Self::Upstream { .. } => {
                "api_error"
            }
            Self::Database(_) | Self::Internal(_) => "server_error",
        }
    }

    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Unauthorized(_) => Some("invalid_api_key"),
            Self::Forbidden(_) => Some("insufficient_scope"),
            Self::ModelNotFound(_) => Some("model_not_found"),
            Self::UnsupportedFeature(_) => Some("unsupported_parameter"),
            Self::UpstreamUnavailable(_) => Some("upstream_unavailable"),
            Self::UpstreamProtocol(_) => Some("upstream_protocol_error"),
            Self::Upstream { status: 429, .. } => Some("rate_limit_exceeded"),
            _ => None,
        }
    }

    /// The `{"error": {...}}` envelope.
    pub fn to_body(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: self.error_type().to_string(),
                code: self.error_code().map(String::from),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status_code(), axum::Json(self.to_body())).into_response()
    }
}

/// Failures of the credential and usage stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store task failed: {0}")]
    Task(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "Store error");
        Self::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "Database error");
        Self::Database(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transport(message) => Self::UpstreamUnavailable(message),
            ProviderError::Protocol { message, payload } => {
                tracing::warn!(payload = %truncate_payload(&payload), "Upstream protocol error: {message}");
                Self::UpstreamProtocol(message)
            }
            ProviderError::UnsupportedFeature(message) => Self::UnsupportedFeature(message),
            ProviderError::Api { status, message } => Self::Upstream { status, message },
            ProviderError::Stream(message) => Self::UpstreamUnavailable(message),
        }
    }
}
