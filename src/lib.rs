//! DataKeep - session-locked, versioned documents over a key-value backend
//!
//! A [`Store`] is one named collection of documents. Loading a key through
//! it takes a session lock on the backend record and hands back a [`Keep`]:
//! the in-memory copy of the document that autosaves, reconciles and
//! finally releases the lock. Other processes can still post global updates
//! into the key's mailbox while it is loaded elsewhere.
//!
//! # Quick Start
//!
//! ```ignore
//! use datakeep::{ActiveSession, KeepConfig, MemoryBackend, StoreInfo, StoreRegistry};
//! use serde_json::json;
//!
//! let registry = StoreRegistry::new(
//!     MemoryBackend::shared(),
//!     ActiveSession::generate(1),
//!     KeepConfig::default(),
//! )?;
//! let players = registry.get_store(StoreInfo::new("players"), json!({"coins": 0}))?;
//!
//! let keep = players.load_keep("player_1", None).await?;
//! keep.update(|doc| doc["coins"] = json!(100))?;
//! keep.save().await?;
//! keep.release().await?;
//! ```
//!
//! # Architecture
//!
//! - `datakeep-core`: contract types, errors, signals, document paths
//! - `datakeep-storage`: the [`Backend`] trait and the in-memory backend
//! - `datakeep-engine`: stores, keeps, session locks, mailbox, versions

pub use datakeep_engine::*;

pub use datakeep_core::{
    missing_fields, reconcile, ActiveSession, DocPath, GlobalId, GlobalUpdate, KeepError,
    KeepResult, KeyInfo, MetaData, Signal, Subscription, Timestamp, Version, VersionInfo,
};
pub use datakeep_storage::{Backend, BackendKey, MemoryBackend, StorageError};
