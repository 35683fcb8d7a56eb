//! API errors with the fixed response bodies of the HTTP surface.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use termhub_protocol::http::{CommandFailedResponse, ErrorResponse, RetryableErrorResponse};
use thiserror::Error;
use tracing::{error, warn};

use crate::error::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A command could not complete successfully; carries its exit code.
    #[error("Command failed with exit code {exit_code}: {message}")]
    CommandFailed { message: String, exit_code: i32 },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String, retryable: bool },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {message}")]
    Internal { message: String, retryable: bool },
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: msg.into(),
            retryable: false,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            retryable: false,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) | Self::CommandFailed { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let retryable = err.retryable();
        match err {
            Error::Validation(msg) => ApiError::BadRequest(msg),
            Error::Auth(_) => ApiError::unauthorized("Invalid or missing API key"),
            Error::SessionNotFound(_) => ApiError::unauthorized("Invalid or expired session"),
            Error::SessionExpired(_) => ApiError::Unauthorized {
                message: "Session expired".to_string(),
                retryable: true,
            },
            Error::CapacityExceeded(_) | Error::PoolExhausted { .. } => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            Error::AccessDenied(_) => ApiError::CommandFailed {
                message: err.to_string(),
                exit_code: 1,
            },
            Error::Busy(_)
            | Error::HandleUnavailable(_)
            | Error::Container(_)
            | Error::Io(_) => ApiError::Internal {
                message: err.to_string(),
                retryable,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            ApiError::Internal { message, .. } => {
                error!(status = status.as_u16(), message = %message, "API error");
            }
            ApiError::ServiceUnavailable(message) => {
                warn!(message = %message, "Service unavailable");
            }
            _ => {
                tracing::debug!(status = status.as_u16(), error = %self, "Client error");
            }
        }

        match self {
            ApiError::NotFound(error)
            | ApiError::Forbidden(error)
            | ApiError::ServiceUnavailable(error) => {
                (status, Json(ErrorResponse { error })).into_response()
            }
            ApiError::BadRequest(error) => (
                status,
                Json(RetryableErrorResponse {
                    error,
                    retryable: false,
                }),
            )
                .into_response(),
            ApiError::CommandFailed { message, exit_code } => (
                status,
                Json(CommandFailedResponse {
                    error: message,
                    exit_code,
                }),
            )
                .into_response(),
            ApiError::Unauthorized { message, retryable }
            | ApiError::Internal { message, retryable } => (
                status,
                Json(RetryableErrorResponse {
                    error: message,
                    retryable,
                }),
            )
                .into_response(),
        }
    }
}
