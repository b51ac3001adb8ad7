//! Error Types for the freshet server
//!
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//!
//! All errors are serialized as JSON with appropriate HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use freshet_core::{AccessError, FreshetError, TransportError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request contains invalid input data
    InvalidInput,

    /// Resource key failed validation
    InvalidResourceKey,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// Requested resource does not exist
    ResourceNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Backing store refused the write
    WriteRejected,

    // ========================================================================
    // Server Errors (500, 503)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// Backing store is temporarily unavailable
    ServiceUnavailable,

    /// No more WebSocket sessions accepted
    SessionLimitReached,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput | ErrorCode::InvalidResourceKey => StatusCode::BAD_REQUEST,
            ErrorCode::ResourceNotFound => StatusCode::NOT_FOUND,
            ErrorCode::WriteRejected => StatusCode::CONFLICT,
            ErrorCode::ServiceUnavailable | ErrorCode::SessionLimitReached => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Structured error returned by every handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error category
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn resource_not_found(key: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ResourceNotFound,
            format!("Resource {} not found", key),
        )
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<AccessError> for ApiError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::NotFound { key } => ApiError::resource_not_found(key),
            AccessError::Transient { key, reason } => {
                tracing::warn!(resource_key = %key, reason = %reason, "Backing store unavailable");
                ApiError::service_unavailable(format!("Resource {} temporarily unavailable", key))
            }
            AccessError::Rejected { key, reason } => ApiError::new(
                ErrorCode::WriteRejected,
                format!("Write to {} rejected: {}", key, reason),
            ),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::new(ErrorCode::InvalidResourceKey, err.to_string())
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::SessionLimitReached { .. } => {
                ApiError::new(ErrorCode::SessionLimitReached, err.to_string())
            }
            other => ApiError::internal_error(other.to_string()),
        }
    }
}

impl From<FreshetError> for ApiError {
    fn from(err: FreshetError) -> Self {
        match err {
            FreshetError::Access(e) => e.into(),
            FreshetError::Validation(e) => e.into(),
            FreshetError::Transport(e) => e.into(),
            other => {
                tracing::error!(error = %other, "Unhandled freshet error");
                ApiError::internal_error(other.to_string())
            }
        }
    }
}

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;
