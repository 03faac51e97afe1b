//! Error types for the player.

use lectern_core::{BlockIndex, ErrorKind, ValidationError};

use crate::config::ConfigError;

/// Failures talking to the server.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Request rejected ({status}): {code}: {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Config error: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl TransportError {
    /// How a failed block request is surfaced on that block. `None` means the
    /// failure is not about one block and every pending block must fail.
    pub fn block_error_kind(&self) -> Option<ErrorKind> {
        match self {
            TransportError::Rejected { .. } => Some(ErrorKind::InvalidRequest),
            TransportError::Http(_)
            | TransportError::WebSocket(_)
            | TransportError::Server { .. } => Some(ErrorKind::TransientWorkerFailure),
            TransportError::Serde(_) | TransportError::Protocol(_) | TransportError::Config(_) => {
                None
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Block {block_idx} is outside the document ({block_count} blocks)")]
    UnknownBlock {
        block_idx: BlockIndex,
        block_count: u32,
    },
    #[error("Session is stopped")]
    Stopped,
}

pub type PlayerResult<T> = Result<T, PlayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_is_block_scoped() {
        let err = TransportError::Rejected {
            status: 400,
            code: "INVALID_REQUEST".to_string(),
            message: "voice".to_string(),
        };
        assert_eq!(err.block_error_kind(), Some(ErrorKind::InvalidRequest));
        assert!(err.to_string().contains("INVALID_REQUEST"));
    }

    #[test]
    fn test_protocol_error_is_session_scoped() {
        let err = TransportError::Protocol("bad frame".to_string());
        assert_eq!(err.block_error_kind(), None);
    }
}
