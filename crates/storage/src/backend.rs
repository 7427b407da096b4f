//! The backend contract
//!
//! A transactional key-value store keyed by `(store, scope, key)`. Each key
//! holds a JSON value plus backend-native metadata ([`KeyInfo`]) and keeps
//! every historical revision, listable by time window in pages.
//!
//! # Conditional writes
//!
//! [`Backend::compare_and_swap`] is the only write primitive. Session locks,
//! renewals, releases and mailbox edits are all expressed as
//! read-modify-CAS cycles against it; there is no lock server and no held
//! connection.

use async_trait::async_trait;
use datakeep_core::{KeyInfo, Timestamp, Version, VersionInfo};
use serde_json::Value;
use std::fmt;

use crate::error::StorageResult;

/// Fully qualified address of one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendKey {
    pub store: String,
    pub scope: Option<String>,
    pub key: String,
}

impl BackendKey {
    pub fn new(store: impl Into<String>, scope: Option<String>, key: impl Into<String>) -> Self {
        BackendKey {
            store: store.into(),
            scope,
            key: key.into(),
        }
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}/{}/{}", self.store, scope, self.key),
            None => write!(f, "{}/{}", self.store, self.key),
        }
    }
}

/// A value as stored, with the metadata of the write that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub value: Value,
    pub key_info: KeyInfo,
}

/// Payload of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub value: Value,
    pub user_ids: Vec<u64>,
}

impl WriteRequest {
    pub fn new(value: Value) -> Self {
        WriteRequest {
            value,
            user_ids: Vec::new(),
        }
    }

    pub fn with_user_ids(mut self, user_ids: Vec<u64>) -> Self {
        self.user_ids = user_ids;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// One page request of a revision listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionQuery {
    /// Inclusive lower bound on write time
    pub min_date: Option<Timestamp>,
    /// Inclusive upper bound on write time
    pub max_date: Option<Timestamp>,
    pub order: SortOrder,
    pub page_size: usize,
    /// Continuation token from the previous page
    pub cursor: Option<String>,
}

impl VersionQuery {
    pub fn new(page_size: usize) -> Self {
        VersionQuery {
            min_date: None,
            max_date: None,
            order: SortOrder::Ascending,
            page_size,
            cursor: None,
        }
    }

    pub fn window(mut self, min_date: Option<Timestamp>, max_date: Option<Timestamp>) -> Self {
        self.min_date = min_date;
        self.max_date = max_date;
        self
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    /// List newest revisions first.
    pub fn newest_first(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }
}

/// One page of a revision listing. `cursor` is `None` on the last page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionPage {
    pub versions: Vec<VersionInfo>,
    pub cursor: Option<String>,
}

/// Storage interface used by stores and keeps.
///
/// Implementations must be `Send + Sync`; every method may be called
/// concurrently from many tasks and, for a shared backend, many processes.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Latest revision of `key`, or `None` if the key was never written.
    async fn get(&self, key: &BackendKey) -> StorageResult<Option<StoredEntry>>;

    /// A specific historical revision.
    async fn get_version(
        &self,
        key: &BackendKey,
        version: &Version,
    ) -> StorageResult<Option<StoredEntry>>;

    /// Write `request` only if the current revision equals `expected`.
    ///
    /// `expected = None` means "the key must not exist yet". On success the
    /// write becomes the new latest revision and its `KeyInfo` is returned;
    /// otherwise `StorageError::Conflict` reports what was found.
    async fn compare_and_swap(
        &self,
        key: &BackendKey,
        expected: Option<&Version>,
        request: WriteRequest,
    ) -> StorageResult<KeyInfo>;

    /// Revisions of `key` written inside the query window, one page at a time.
    async fn list_versions(&self, key: &BackendKey, query: &VersionQuery)
        -> StorageResult<VersionPage>;
}
