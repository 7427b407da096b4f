//! Global-update mailbox contents
//!
//! A mailbox is an ordered queue of messages addressed to one key. It is
//! persisted inside the key's record so appending to it is just another
//! compare-and-swap write, possible whether or not any process has the
//! document loaded.
//!
//! ## Partitions
//!
//! - **active**: delivered but not yet acknowledged; may still be changed
//!   or removed by senders.
//! - **locked**: acknowledged by the owning process; immutable, kept until
//!   explicitly cleared.
//!
//! An update moves active → locked at most once and never back.

use crate::error::{KeepError, KeepResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a global update, unique and increasing per key.
pub type GlobalId = u64;

/// One message in a key's mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalUpdate {
    #[serde(rename = "ID")]
    pub id: GlobalId,
    #[serde(rename = "Data")]
    pub data: Value,
}

/// A processing decision recorded by the owning process and replayed onto
/// the freshest remote mailbox at its next write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxOp {
    /// Move an active update to the locked partition
    Lock(GlobalId),
    /// Discard an active update
    Remove(GlobalId),
    /// Discard a locked update
    ClearLocked(GlobalId),
}

/// The mailbox of one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalUpdates {
    /// Highest id ever assigned; ids are never reused
    #[serde(rename = "ID", default)]
    pub last_id: GlobalId,
    #[serde(rename = "Active", default)]
    pub active: Vec<GlobalUpdate>,
    #[serde(rename = "Locked", default)]
    pub locked: Vec<GlobalUpdate>,
}

impl GlobalUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` to the active partition under the next id.
    pub fn add(&mut self, data: Value) -> GlobalId {
        self.last_id += 1;
        self.active.push(GlobalUpdate {
            id: self.last_id,
            data,
        });
        self.last_id
    }

    pub fn active(&self) -> &[GlobalUpdate] {
        &self.active
    }

    pub fn locked(&self) -> &[GlobalUpdate] {
        &self.locked
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.locked.is_empty()
    }

    fn active_index(&self, id: GlobalId) -> KeepResult<usize> {
        match self.active.iter().position(|u| u.id == id) {
            Some(idx) => Ok(idx),
            None if self.locked.iter().any(|u| u.id == id) => {
                Err(KeepError::ImmutableUpdate { id })
            }
            None => Err(KeepError::NotFound { id }),
        }
    }

    /// Replace the payload of an active update.
    ///
    /// # Errors
    ///
    /// `ImmutableUpdate` if the update is locked, `NotFound` if unknown.
    pub fn change_active(&mut self, id: GlobalId, data: Value) -> KeepResult<()> {
        let idx = self.active_index(id)?;
        self.active[idx].data = data;
        Ok(())
    }

    /// Discard an active update.
    ///
    /// # Errors
    ///
    /// `ImmutableUpdate` if the update is locked, `NotFound` if unknown.
    pub fn remove_active(&mut self, id: GlobalId) -> KeepResult<GlobalUpdate> {
        let idx = self.active_index(id)?;
        Ok(self.active.remove(idx))
    }

    /// Move an active update to the locked partition.
    pub fn lock(&mut self, id: GlobalId) -> KeepResult<GlobalUpdate> {
        let idx = self.active_index(id)?;
        let update = self.active.remove(idx);
        let pos = self.locked.partition_point(|u| u.id < id);
        self.locked.insert(pos, update.clone());
        Ok(update)
    }

    /// Discard a locked update.
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` is not in the locked partition, including when it
    /// is still active: an update must be acknowledged before it can go.
    pub fn clear_locked(&mut self, id: GlobalId) -> KeepResult<GlobalUpdate> {
        match self.locked.iter().position(|u| u.id == id) {
            Some(idx) => Ok(self.locked.remove(idx)),
            None => Err(KeepError::NotFound { id }),
        }
    }

    /// Replay processing decisions onto this (newer) copy of the mailbox.
    ///
    /// Ops referring to updates that are no longer in the expected partition
    /// were already applied by an earlier write and are skipped.
    pub fn apply_ops(&mut self, ops: &[MailboxOp]) {
        for op in ops {
            let _ = match *op {
                MailboxOp::Lock(id) => self.lock(id).map(drop),
                MailboxOp::Remove(id) => self.remove_active(id).map(drop),
                MailboxOp::ClearLocked(id) => self.clear_locked(id).map(drop),
            };
        }
    }
}
