//! Error types for the LAN sync engine.
//!
//! The taxonomy follows the protocol design: transport faults abort a
//! session, structured rejections are surfaced to the initiator without
//! being fatal to the process, and artifact validation failures stay
//! local to the receiving side.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::RejectReason;

/// Main error type for the LAN sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    // Transport faults — these abort the owning session.
    #[error("Transport fault: {message}")]
    Transport { message: String },

    #[error("Bad preamble from peer")]
    BadPreamble,

    #[error("Unknown protocol code: {0}")]
    UnknownCode(u8),

    #[error("String of {0} bytes exceeds the 255-byte wire limit")]
    StringTooLong(usize),

    #[error("Invalid chunk length: {0}")]
    InvalidChunkLength(i32),

    // Session outcomes.
    #[error("Peer rejected the session: {0}")]
    Rejected(RejectReason),

    #[error("Session cancelled")]
    Cancelled,

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    // Validation errors.
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // File system / socket errors.
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Path is not a directory: {0}")]
    NotADirectory(PathBuf),

    // Generic errors.
    #[error("{0}")]
    Other(String),
}

/// Result type alias for LAN sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl SyncError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a transport fault with a free-form message.
    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::Transport {
            message: message.into(),
        }
    }

    /// True for errors that end a session without indicating a protocol
    /// violation by either side (cancellation, structured rejection).
    pub fn is_benign(&self) -> bool {
        matches!(self, SyncError::Cancelled | SyncError::Rejected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::StringTooLong(256);
        assert_eq!(
            err.to_string(),
            "String of 256 bytes exceeds the 255-byte wire limit"
        );
    }

    #[test]
    fn test_benign_outcomes() {
        assert!(SyncError::Cancelled.is_benign());
        assert!(SyncError::Rejected(RejectReason::SyncRejected).is_benign());
        assert!(!SyncError::BadPreamble.is_benign());
    }

    #[test]
    fn test_io_with_path_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = SyncError::io_with_path(io, "/tmp/x");
        match err {
            SyncError::Io { path, source, .. } => {
                assert_eq!(path.unwrap(), PathBuf::from("/tmp/x"));
                assert!(source.is_some());
            }
            other => panic!("Expected Io, got: {:?}", other),
        }
    }
}
