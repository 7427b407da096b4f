//! Backend metadata returned by every successful write
//!
//! `KeyInfo` mirrors the revision bookkeeping the backend keeps alongside a
//! value: which revision is current, when the key was first and last
//! written, and the account ids the value is attributed to.

use super::{Timestamp, Version};
use serde::{Deserialize, Serialize};

/// Revision and attribution metadata for the latest write of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Revision produced by the write
    pub version: Version,
    /// Time of the first write to the key
    pub created_time: Timestamp,
    /// Time of this write
    pub updated_time: Timestamp,
    /// Account ids the document is attributed to (data-ownership tracking)
    pub user_ids: Vec<u64>,
}

impl KeyInfo {
    pub fn new(version: Version, created_time: Timestamp, updated_time: Timestamp) -> Self {
        KeyInfo {
            version,
            created_time,
            updated_time,
            user_ids: Vec::new(),
        }
    }

    pub fn with_user_ids(mut self, user_ids: Vec<u64>) -> Self {
        self.user_ids = user_ids;
        self
    }
}
