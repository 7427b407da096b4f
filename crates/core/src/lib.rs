//! Core types for DataKeep
//!
//! This crate defines the foundational types shared by the backend and the
//! engine:
//! - Contract types: Timestamp, Version, KeyInfo, ActiveSession, MetaData,
//!   GlobalUpdate(s) and the persisted KeepRecord layout
//! - KeepError: the error taxonomy
//! - Signal: ordered in-process notifications with explicit subscriptions
//! - DocPath: dotted paths into JSON documents
//! - reconcile: structural backfill of template fields

#![warn(clippy::all)]

pub mod contract;
pub mod error;
pub mod path;
pub mod reconcile;
pub mod signal;

pub use contract::{
    ActiveSession, GlobalId, GlobalUpdate, GlobalUpdates, KeepRecord, KeyInfo, MailboxOp,
    MetaData, Timestamp, Version, VersionInfo,
};
pub use error::{KeepError, KeepResult};
pub use path::{DocPath, PathError, PathSegment};
pub use reconcile::{missing_fields, reconcile};
pub use signal::{Signal, Subscription};
