//! WolfBlock Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for WolfBlock operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfBlock error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Chain errors
    #[error("Chain busy: {0}")]
    ChainBusy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("Request too large: {0}")]
    TooLarge(String),

    #[error("Chain corruption: {0}")]
    ChainCorruption(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Replication errors
    #[error("Write failed on replica {replica}: {reason}")]
    WriteFailed { replica: String, reason: String },

    #[error("Quorum lost: {acked}/{required} replicas acknowledged")]
    QuorumLost { acked: usize, required: usize },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Error codes carried over the replica wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ChainBusy,
    NotFound,
    InvalidState,
    Dependency,
    TooLarge,
    ChainCorruption,
    WriteFailed,
    QuorumLost,
    Transfer,
    Timeout,
    Io,
    Internal,
}

impl Error {
    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ChainBusy(_) => ErrorCode::ChainBusy,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::InvalidState(_) => ErrorCode::InvalidState,
            Error::Dependency(_) => ErrorCode::Dependency,
            Error::TooLarge(_) => ErrorCode::TooLarge,
            Error::ChainCorruption(_) => ErrorCode::ChainCorruption,
            Error::WriteFailed { .. } => ErrorCode::WriteFailed,
            Error::QuorumLost { .. } => ErrorCode::QuorumLost,
            Error::Transfer(_) => ErrorCode::Transfer,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Io(_) => ErrorCode::Io,
            _ => ErrorCode::Internal,
        }
    }

    /// Message without the kind prefix, as sent over the wire
    pub fn detail(&self) -> String {
        match self {
            Error::ChainBusy(m)
            | Error::NotFound(m)
            | Error::InvalidState(m)
            | Error::Dependency(m)
            | Error::TooLarge(m)
            | Error::ChainCorruption(m)
            | Error::Transfer(m)
            | Error::Timeout(m)
            | Error::Internal(m) => m.clone(),
            Error::WriteFailed { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild a typed error from a wire error response
    pub fn from_wire(code: ErrorCode, message: String, replica: &str) -> Self {
        match code {
            ErrorCode::ChainBusy => Error::ChainBusy(message),
            ErrorCode::NotFound => Error::NotFound(message),
            ErrorCode::InvalidState => Error::InvalidState(message),
            ErrorCode::Dependency => Error::Dependency(message),
            ErrorCode::TooLarge => Error::TooLarge(message),
            ErrorCode::ChainCorruption => Error::ChainCorruption(message),
            ErrorCode::WriteFailed => Error::WriteFailed {
                replica: replica.to_string(),
                reason: message,
            },
            ErrorCode::QuorumLost => Error::QuorumLost { acked: 0, required: 1 },
            ErrorCode::Transfer => Error::Transfer(message),
            ErrorCode::Timeout => Error::Timeout(message),
            ErrorCode::Io => Error::Io(std::io::Error::new(std::io::ErrorKind::Other, message)),
            ErrorCode::Internal => Error::Internal(message),
        }
    }

    /// Check if this error is a typed rejection of the request itself.
    ///
    /// Rejections leave the replica healthy; everything else is treated
    /// by the controller as a replica failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::ChainBusy(_)
                | Error::NotFound(_)
                | Error::InvalidState(_)
                | Error::Dependency(_)
                | Error::TooLarge(_)
        )
    }

    /// Check if the controller must surface this error to the caller
    pub fn is_fatal_for_volume(&self) -> bool {
        matches!(self, Error::QuorumLost { .. } | Error::ChainCorruption(_))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Network(_) | Error::ConnectionFailed { .. } | Error::ChainBusy(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_preserves_kind() {
        let err = Error::Dependency("snap-2 depends on snap-1".into());
        let restored = Error::from_wire(err.code(), err.detail(), "r1");
        assert!(matches!(restored, Error::Dependency(ref m) if m == "snap-2 depends on snap-1"));
        assert!(restored.is_rejection());
    }

    #[test]
    fn test_classification() {
        assert!(Error::QuorumLost { acked: 0, required: 1 }.is_fatal_for_volume());
        assert!(!Error::Timeout("r1".into()).is_rejection());
        assert!(Error::Timeout("r1".into()).is_retryable());
        assert!(Error::TooLarge("write of 300 MiB".into()).is_rejection());
    }
}
