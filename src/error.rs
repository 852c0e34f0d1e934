use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::providers::ProviderError;
use crate::usage::UsageError;

/// Request-level failures, one variant per outcome the gateway reports.
///
/// Validation failures answer with a JSON `{"error": ...}` body; every other
/// variant answers with plain text.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized: invalid or missing API key")]
    Unauthorized,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Unrecognized provider")]
    UnknownProvider,

    #[error("{0}")]
    Upstream(String),

    #[error("Timeout calling provider")]
    UpstreamTimeout,

    #[error("{0}")]
    Relay(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::UnknownProvider => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Relay(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            Self::BadRequest(message) => (status, Json(ErrorBody { error: message })).into_response(),
            other => (status, other.to_string()).into_response(),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match &err {
            // A provider id that made it past the key store but has no URL is
            // a deployment mistake, not a client one.
            ProviderError::UnknownProvider(_) | ProviderError::Client(_) => {
                tracing::error!(error = %err, "Provider configuration error");
                Self::Internal(err.to_string())
            }
            ProviderError::Body(_) => {
                tracing::error!(error = %err, "Failed to read provider response");
                Self::Relay(err.to_string())
            }
            ProviderError::Http(_) => {
                tracing::warn!(error = %err, "Upstream request failed");
                Self::Upstream(err.to_string())
            }
        }
    }
}

impl From<UsageError> for AppError {
    fn from(err: UsageError) -> Self {
        tracing::error!(error = %err, "Usage store error");
        Self::Internal(err.to_string())
    }
}
