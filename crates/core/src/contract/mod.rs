//! Contract types shared by the backend, the engine and callers
//!
//! ## Module Structure
//!
//! - `timestamp`: wall-clock milliseconds used for liveness and history windows
//! - `version`: opaque revision tokens and revision listings
//! - `key_info`: backend metadata returned by every write
//! - `session`: `ActiveSession` claims and per-document `MetaData`
//! - `global_update`: the per-key mailbox
//! - `record`: the persisted `{Data, MetaData, GlobalUpdates}` layout

pub mod global_update;
pub mod key_info;
pub mod record;
pub mod session;
pub mod timestamp;
pub mod version;

pub use global_update::{GlobalId, GlobalUpdate, GlobalUpdates, MailboxOp};
pub use key_info::KeyInfo;
pub use record::KeepRecord;
pub use session::{ActiveSession, MetaData};
pub use timestamp::Timestamp;
pub use version::{Version, VersionInfo};
