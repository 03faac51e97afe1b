//! Error Types for LECTERN API
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
use lectern_core::{LecternError, QueueError, StorageError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// The request is well-formed but cannot be served as asked
    /// (unsupported voice, unknown model, oversized block).
    InvalidRequest,

    /// Request contains invalid input data
    InvalidInput,

    /// Required field is missing from request
    MissingField,

    /// Field format is incorrect
    InvalidFormat,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    DocumentNotFound,
    BlockNotFound,
    ArtifactNotFound,
    QueueNotFound,

    // ========================================================================
    // Server Errors (500, 503, 504)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// Cache write or read failed
    StorageFailure,

    /// Usage ledger failed
    BillingFailure,

    /// Database operation failed
    DatabaseError,

    /// Service is temporarily unavailable
    ServiceUnavailable,

    /// Database connection pool exhausted
    ConnectionPoolExhausted,

    /// Operation timed out
    Timeout,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest
            | ErrorCode::InvalidInput
            | ErrorCode::MissingField
            | ErrorCode::InvalidFormat => StatusCode::BAD_REQUEST,

            ErrorCode::DocumentNotFound
            | ErrorCode::BlockNotFound
            | ErrorCode::ArtifactNotFound
            | ErrorCode::QueueNotFound => StatusCode::NOT_FOUND,

            ErrorCode::ServiceUnavailable | ErrorCode::ConnectionPoolExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,

            ErrorCode::InternalError
            | ErrorCode::StorageFailure
            | ErrorCode::BillingFailure
            | ErrorCode::DatabaseError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "Request cannot be served",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::InvalidFormat => "Invalid format",
            ErrorCode::DocumentNotFound => "Document not found",
            ErrorCode::BlockNotFound => "Block not found",
            ErrorCode::ArtifactNotFound => "Artifact not found",
            ErrorCode::QueueNotFound => "Queue not found",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::StorageFailure => "Storage operation failed",
            ErrorCode::BillingFailure => "Usage accounting failed",
            ErrorCode::DatabaseError => "Database operation failed",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::ConnectionPoolExhausted => "Connection pool exhausted",
            ErrorCode::Timeout => "Operation timed out",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
    }

    pub fn invalid_format(field: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidFormat,
            format!("Field '{}' has invalid format, expected: {}", field, expected),
        )
    }

    pub fn document_not_found(document_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::DocumentNotFound,
            format!("Document {} not found", document_id),
        )
    }

    pub fn artifact_not_found(key: impl fmt::Display) -> Self {
        Self::new(ErrorCode::ArtifactNotFound, format!("No cached audio for {}", key))
    }

    pub fn queue_not_found(queue: impl fmt::Display) -> Self {
        Self::new(ErrorCode::QueueNotFound, format!("Queue {} not found", queue))
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn connection_pool_exhausted() -> Self {
        Self::from_code(ErrorCode::ConnectionPoolExhausted)
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(ErrorCode::Timeout, format!("Operation '{}' timed out", operation))
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
        let body = Json(self);
        (status, body).into_response()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<LecternError> for ApiError {
    fn from(err: LecternError) -> Self {
        let kind = err.kind();
        let api = match &err {
            LecternError::Validation(ValidationError::UnknownBlock { .. }) => {
                ApiError::new(ErrorCode::BlockNotFound, err.to_string())
            }
            LecternError::Validation(ValidationError::RequiredFieldMissing { field }) => {
                ApiError::missing_field(field)
            }
            LecternError::Validation(_) => ApiError::invalid_request(err.to_string()),
            LecternError::Storage(StorageError::WriteTimeout { .. }) => {
                ApiError::new(ErrorCode::Timeout, err.to_string())
            }
            LecternError::Storage(StorageError::NotFound { key }) => ApiError::artifact_not_found(key),
            LecternError::Storage(_) => {
                tracing::error!(error = %err, "Storage error");
                ApiError::from_code(ErrorCode::StorageFailure)
            }
            LecternError::Billing(_) => {
                tracing::error!(error = %err, "Billing error");
                ApiError::from_code(ErrorCode::BillingFailure)
            }
            LecternError::Queue(QueueError::UnknownQueue { queue }) => ApiError::queue_not_found(queue),
            LecternError::Queue(_) => ApiError::service_unavailable(err.to_string()),
            LecternError::Config(_) => {
                tracing::error!(error = %err, "Configuration error");
                ApiError::internal_error("Server misconfigured")
            }
        };
        api.with_details(serde_json::json!({ "kind": kind }))
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        LecternError::from(err).into()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        LecternError::from(err).into()
    }
}

/// Convert from tokio_postgres::Error to ApiError.
impl From<tokio_postgres::Error> for ApiError {
    fn from(err: tokio_postgres::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        // Generic message to avoid leaking internal details
        ApiError::database_error("Database operation failed")
    }
}

/// Convert from deadpool_postgres::PoolError to ApiError.
impl From<deadpool_postgres::PoolError> for ApiError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        tracing::error!("Connection pool error: {:?}", err);

        match err {
            deadpool_postgres::PoolError::Timeout(_) => ApiError::connection_pool_exhausted(),
            deadpool_postgres::PoolError::Closed => {
                ApiError::service_unavailable("Database connection pool is closed")
            }
            _ => ApiError::database_error("Failed to acquire database connection"),
        }
    }
}

/// Convert from serde_json::Error to ApiError.
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::invalid_input(format!("Invalid JSON: {}", err))
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_core::BillingError;
    use uuid::Uuid;

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(ErrorCode::InvalidRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::DocumentNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::StorageFailure.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ErrorCode::ServiceUnavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_unsupported_voice_is_invalid_request() {
        let err: ApiError = ValidationError::UnsupportedVoice {
            model: "kokoro".to_string(),
            voice: "narrator".to_string(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            err.details,
            Some(serde_json::json!({ "kind": "invalid_request" }))
        );
    }

    #[test]
    fn test_lectern_error_mapping() {
        let err: ApiError = LecternError::from(StorageError::WriteTimeout { waited_ms: 5 }).into();
        assert_eq!(err.code, ErrorCode::Timeout);

        let err: ApiError = LecternError::from(StorageError::WriterClosed).into();
        assert_eq!(err.code, ErrorCode::StorageFailure);

        let err: ApiError = LecternError::from(BillingError::ApplyFailed {
            user_id: Uuid::nil(),
            reason: "x".to_string(),
        })
        .into();
        assert_eq!(err.code, ErrorCode::BillingFailure);

        let err: ApiError = LecternError::from(ValidationError::UnknownBlock {
            document_id: Uuid::nil(),
            block_idx: 9,
        })
        .into();
        assert_eq!(err.code, ErrorCode::BlockNotFound);
    }

    #[test]
    fn test_error_serialization() -> Result<(), serde_json::Error> {
        let err = ApiError::invalid_request("Voice narrator is not supported by model kokoro");
        let json = serde_json::to_string(&err)?;

        assert!(json.contains("INVALID_REQUEST"));
        assert!(json.contains("narrator"));

        let deserialized: ApiError = serde_json::from_str(&json)?;
        assert_eq!(deserialized, err);
        Ok(())
    }
}
