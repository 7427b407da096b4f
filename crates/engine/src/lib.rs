//! Keep engine for DataKeep
//!
//! This crate implements everything above the backend contract:
//! - Store: per-collection validation, hooks and keep factory
//! - SessionLockManager: CAS-based acquire / renew / release of key sessions
//! - Keep: the loaded document handle with its save/release lifecycle
//! - Global-update mailbox editing and processing
//! - VersionIterator: paginated, bidirectional revision history
//! - Autosave, the critical-state latch and the path wrapper
//! - StoreRegistry: one store per collection, constructor-injected
//!
//! Cross-process coordination happens only through compare-and-swap on the
//! backend record; in-memory locks only ever serialize work inside one
//! process.

#![warn(clippy::all)]

mod autosave;
pub mod config;
pub mod health;
pub mod keep;
pub mod mailbox;
pub mod registry;
mod retry;
pub mod session;
pub mod store;
pub mod versions;
pub mod wrapper;

pub use config::{KeepConfig, CONFIG_FILE_NAME};
pub use health::HealthMonitor;
pub use keep::{GlobalStateProcessor, Keep, KeepState, UpdateAction, WriteNotice};
pub use mailbox::GlobalUpdatesEditor;
pub use registry::StoreRegistry;
pub use retry::CONFLICT_RETRY_LIMIT;
pub use session::{
    Acquired, CommitMode, CommitRequest, Committed, ConflictHandler, LockState,
    SessionLockManager, UnreleasedAction,
};
pub use store::{Document, Store, StoreInfo, TransformHook, Validator};
pub use versions::VersionIterator;
