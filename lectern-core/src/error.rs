//! Error types for LECTERN operations

use crate::ErrorKind;
use thiserror::Error;
use uuid::Uuid;

/// Cache/storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Cache entry not found: {key}")]
    NotFound { key: String },

    #[error("Write failed for {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Write lock not acquired within {waited_ms}ms")]
    WriteTimeout { waited_ms: u64 },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Cache writer has shut down")]
    WriterClosed,
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown model: {model}")]
    UnknownModel { model: String },

    #[error("Voice {voice} is not supported by model {model}")]
    UnsupportedVoice { model: String, voice: String },

    #[error("Block {block_idx} does not exist in document {document_id}")]
    UnknownBlock { document_id: Uuid, block_idx: u32 },
}

/// Usage accounting errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BillingError {
    #[error("Usage apply failed for user {user_id}: {reason}")]
    ApplyFailed { user_id: Uuid, reason: String },

    #[error("Billing pool unavailable: {reason}")]
    PoolUnavailable { reason: String },
}

/// Job queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue {queue} is closed")]
    Closed { queue: String },

    #[error("Unknown queue: {queue}")]
    UnknownQueue { queue: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all LECTERN errors.
#[derive(Debug, Clone, Error)]
pub enum LecternError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl LecternError {
    /// Map this error onto the pipeline's failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LecternError::Storage(_) => ErrorKind::StorageFailure,
            LecternError::Validation(_) | LecternError::Config(_) => ErrorKind::InvalidRequest,
            LecternError::Billing(_) => ErrorKind::BillingApplyFailure,
            LecternError::Queue(_) => ErrorKind::TransientWorkerFailure,
        }
    }
}

/// Result type alias for LECTERN operations.
pub type LecternResult<T> = Result<T, LecternError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_timeout() {
        let err = StorageError::WriteTimeout { waited_ms: 250 };
        let msg = format!("{}", err);
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_validation_error_display_unsupported_voice() {
        let err = ValidationError::UnsupportedVoice {
            model: "kokoro".to_string(),
            voice: "am_nobody".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("kokoro"));
        assert!(msg.contains("am_nobody"));
    }

    #[test]
    fn test_error_kind_mapping() {
        let storage = LecternError::from(StorageError::WriterClosed);
        assert_eq!(storage.kind(), ErrorKind::StorageFailure);

        let validation = LecternError::from(ValidationError::UnknownModel {
            model: "x".to_string(),
        });
        assert_eq!(validation.kind(), ErrorKind::InvalidRequest);

        let billing = LecternError::from(BillingError::ApplyFailed {
            user_id: Uuid::nil(),
            reason: "deadlock".to_string(),
        });
        assert_eq!(billing.kind(), ErrorKind::BillingApplyFailure);
    }
}
