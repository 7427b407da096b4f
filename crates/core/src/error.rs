//! Error types for DataKeep
//!
//! One error enum covers every user-facing failure. The backend layer has its
//! own `StorageError` which converts into `KeepError` at the engine boundary.
//! We use `thiserror` for `Display` and `Error` implementations.

use crate::contract::{ActiveSession, GlobalId};
use thiserror::Error;

/// Result type alias for DataKeep operations
pub type KeepResult<T> = std::result::Result<T, KeepError>;

/// Error taxonomy for stores, keeps and mailboxes
#[derive(Debug, Clone, Error, PartialEq)]
pub enum KeepError {
    /// Document rejected by the store's validator
    #[error("Validation failed: {reason}")]
    Validation {
        /// Reason reported by the validator
        reason: String,
    },

    /// Another process holds a fresh session and the conflict resolved as Cancel
    #[error("Session locked by {holder}")]
    SessionLocked {
        /// The process holding the lock
        holder: ActiveSession,
    },

    /// This process no longer holds the session it loaded with
    #[error("Session lost to {}", describe_holder(.holder))]
    SessionLost {
        /// The process now holding the lock, if any
        holder: Option<ActiveSession>,
    },

    /// Backend unreachable and nothing cached to fall back on
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Store is latched in critical state
    #[error("Store is in critical state")]
    CriticalState,

    /// A single write failed after retries; local state is unchanged
    #[error("Backend write failed: {0}")]
    BackendWrite(String),

    /// A PreSave or PreLoad hook failed
    #[error("Hook failed: {0}")]
    Hook(String),

    /// Global update id not present in the expected partition
    #[error("Global update {id} not found")]
    NotFound {
        /// The requested update id
        id: GlobalId,
    },

    /// Attempt to change or remove a locked global update
    #[error("Global update {id} is locked and cannot be modified")]
    ImmutableUpdate {
        /// The locked update id
        id: GlobalId,
    },

    /// Write attempted on a view-only keep
    #[error("Keep is read-only")]
    ReadOnly,

    /// Operation on a keep that has already been released
    #[error("Keep has been released")]
    Released,

    /// Document or record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Caller supplied an invalid argument or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

fn describe_holder(holder: &Option<ActiveSession>) -> String {
    match holder {
        Some(h) => h.to_string(),
        None => "nobody".to_string(),
    }
}

impl KeepError {
    pub fn validation(reason: impl Into<String>) -> Self {
        KeepError::Validation {
            reason: reason.into(),
        }
    }

    pub fn hook(message: impl Into<String>) -> Self {
        KeepError::Hook(message.into())
    }

    pub fn backend_write(message: impl Into<String>) -> Self {
        KeepError::BackendWrite(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        KeepError::BackendUnavailable(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        KeepError::Serialization(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        KeepError::InvalidInput(message.into())
    }

    /// True for failures that may succeed if the same call is repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeepError::BackendWrite(_)
                | KeepError::BackendUnavailable(_)
                | KeepError::CriticalState
                | KeepError::SessionLocked { .. }
        )
    }

    /// True if the failure came from the backend rather than from the caller.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            KeepError::BackendWrite(_) | KeepError::BackendUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for KeepError {
    fn from(e: serde_json::Error) -> Self {
        KeepError::Serialization(e.to_string())
    }
}
