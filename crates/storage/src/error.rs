//! Backend error types

use datakeep_core::{KeepError, Version};
use thiserror::Error;

/// Result type alias for backend operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    /// Compare-and-swap precondition failed
    #[error("Revision mismatch: expected {expected:?}, found {actual:?}")]
    Conflict {
        /// Revision the writer based its update on
        expected: Option<Version>,
        /// Revision currently stored
        actual: Option<Version>,
    },

    /// Request failed but may succeed on retry (throttling, timeouts)
    #[error("Transient backend failure: {0}")]
    Transient(String),

    /// Backend is not serving requests at all
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Requested historical revision does not exist
    #[error("Version not found: {0}")]
    VersionNotFound(Version),

    /// Paging cursor was not produced by this backend
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }

    /// Failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_) | StorageError::Unavailable(_))
    }
}

impl From<StorageError> for KeepError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unavailable(msg) => KeepError::BackendUnavailable(msg),
            StorageError::VersionNotFound(v) => {
                KeepError::invalid_input(format!("version {} does not exist", v))
            }
            StorageError::InvalidCursor(c) => KeepError::invalid_input(format!("bad cursor {}", c)),
            other => KeepError::BackendWrite(other.to_string()),
        }
    }
}
