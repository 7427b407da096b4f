//! Persisted layout of one key
//!
//! ```text
//! { "Data": <document | null>, "MetaData": {...}, "GlobalUpdates": {...} }
//! ```
//!
//! `Data` is absent when the record was created by mailbox traffic before
//! the document itself was ever loaded.

use super::{GlobalUpdates, MetaData, Timestamp};
use crate::error::{KeepError, KeepResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepRecord {
    #[serde(rename = "Data", default)]
    pub data: Option<Value>,
    #[serde(rename = "MetaData")]
    pub metadata: MetaData,
    #[serde(rename = "GlobalUpdates", default)]
    pub global_updates: GlobalUpdates,
}

impl KeepRecord {
    /// A record with no document, no session and an empty mailbox.
    pub fn empty(now: Timestamp) -> Self {
        KeepRecord {
            data: None,
            metadata: MetaData::new(now),
            global_updates: GlobalUpdates::new(),
        }
    }

    /// Decode a record from the backend's JSON value.
    pub fn from_value(value: Value) -> KeepResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| KeepError::serialization(format!("malformed record: {}", e)))
    }

    pub fn to_value(&self) -> KeepResult<Value> {
        serde_json::to_value(self).map_err(KeepError::from)
    }
}
