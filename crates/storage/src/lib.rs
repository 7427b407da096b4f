//! Storage layer for DataKeep
//!
//! This crate defines the backend contract every keep is persisted through,
//! and ships an in-memory implementation:
//! - Backend: async get / get_version / compare_and_swap / list_versions
//! - MemoryBackend: DashMap revision chains with fault injection for tests
//! - StorageError: backend failure taxonomy, convertible into KeepError

#![warn(clippy::all)]

pub mod backend;
pub mod error;
pub mod memory;

pub use backend::{
    Backend, BackendKey, SortOrder, StoredEntry, VersionPage, VersionQuery, WriteRequest,
};
pub use error::{StorageError, StorageResult};
pub use memory::{MemoryBackend, RevisionChain};
