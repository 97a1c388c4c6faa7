//! HTTP-facing error type and its status mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use berth_common::error::BerthError;
use serde::Serialize;
use thiserror::Error;

/// Result alias for handlers and middleware.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors returned by the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A domain error from the runtime.
    #[error(transparent)]
    Berth(#[from] BerthError),

    /// Malformed query, body, content type or API version.
    #[error("{0}")]
    BadRequest(String),

    /// The route exists but not for this HTTP method.
    #[error("{method} is not allowed on {path}")]
    MethodNotAllowed {
        /// Request method.
        method: String,
        /// Request path, without the version prefix.
        path: String,
    },

    /// The connection cannot be handed over to a raw stream.
    #[error("cannot hijack connection: {0}")]
    Transport(String),

    /// Any other server-side failure.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Builds an [`ApiError::BadRequest`].
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// HTTP status of this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Berth(BerthError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Berth(BerthError::Conflict { .. }) => StatusCode::CONFLICT,
            Self::Berth(BerthError::InvalidParameter { .. }) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::Berth(_) | Self::Transport(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Display-ready message.
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %message, "request rejected");
        }
        (status, Json(ErrorResponse { message })).into_response()
    }
}
