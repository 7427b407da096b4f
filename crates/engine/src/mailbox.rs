//! Global-update mailbox editing
//!
//! Any process may edit a key's mailbox at any time, whether or not the
//! document is loaded anywhere. An edit is a read-modify-CAS cycle on the
//! whole record that touches only `GlobalUpdates`; the document, the
//! session and `LastUpdate` are written back exactly as read.
//!
//! A holder that has the key loaded picks the new updates up at its next
//! write, when its pending decisions are replayed onto the stored mailbox.

use datakeep_core::{GlobalId, GlobalUpdate, GlobalUpdates, KeepResult, Timestamp};
use datakeep_storage::{Backend, BackendKey, WriteRequest};
use serde_json::Value;
use tracing::debug;

use crate::config::KeepConfig;
use crate::health::HealthMonitor;
use crate::retry::RetryState;
use crate::session::decode;

/// Transactional view of one key's mailbox handed to
/// [`Store::post_global_update`](crate::Store::post_global_update) handlers.
///
/// Only the active partition can be touched; locked updates belong to the
/// holder that acknowledged them.
#[derive(Debug)]
pub struct GlobalUpdatesEditor {
    updates: GlobalUpdates,
    dirty: bool,
}

impl GlobalUpdatesEditor {
    pub(crate) fn new(updates: GlobalUpdates) -> Self {
        GlobalUpdatesEditor {
            updates,
            dirty: false,
        }
    }

    /// Append `data` under the next id of this key.
    pub fn add_global_update(&mut self, data: Value) -> GlobalId {
        self.dirty = true;
        self.updates.add(data)
    }

    pub fn get_active_updates(&self) -> &[GlobalUpdate] {
        self.updates.active()
    }

    /// # Errors
    ///
    /// `ImmutableUpdate` if `id` is locked, `NotFound` if unknown.
    pub fn remove_active_update(&mut self, id: GlobalId) -> KeepResult<()> {
        self.updates.remove_active(id)?;
        self.dirty = true;
        Ok(())
    }

    /// # Errors
    ///
    /// `ImmutableUpdate` if `id` is locked, `NotFound` if unknown.
    pub fn change_active_update(&mut self, id: GlobalId, data: Value) -> KeepResult<()> {
        self.updates.change_active(id, data)?;
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn into_updates(self) -> GlobalUpdates {
        self.updates
    }
}

/// Run `handler` against the stored mailbox of `key` and persist its edits.
///
/// The handler may run more than once: when the CAS loses a race it is
/// re-run against the freshly read mailbox. An `Err` from the handler aborts
/// without writing, and so does a handler that changed nothing.
pub(crate) async fn post<R, F>(
    backend: &dyn Backend,
    health: &HealthMonitor,
    config: &KeepConfig,
    key: &BackendKey,
    mut handler: F,
) -> KeepResult<R>
where
    F: FnMut(&mut GlobalUpdatesEditor) -> KeepResult<R>,
{
    let mut retry = RetryState::new(config, key, "post_global_update");
    loop {
        let entry = match health.observe(backend.get(key).await) {
            Ok(entry) => entry,
            Err(e) => {
                retry.on_failure(e).await?;
                continue;
            }
        };
        let (mut record, current) = decode(entry, Timestamp::now())?;

        let mut editor = GlobalUpdatesEditor::new(std::mem::take(&mut record.global_updates));
        let out = handler(&mut editor)?;
        if !editor.dirty {
            return Ok(out);
        }
        record.global_updates = editor.into_updates();

        let user_ids = current
            .as_ref()
            .map(|info| info.user_ids.clone())
            .unwrap_or_default();
        let request = WriteRequest::new(record.to_value()?).with_user_ids(user_ids);
        let expected = current.map(|info| info.version);
        let written = backend
            .compare_and_swap(key, expected.as_ref(), request)
            .await;
        match health.observe(written) {
            Ok(key_info) => {
                debug!(
                    target: "datakeep::mailbox",
                    key = %key,
                    last_id = record.global_updates.last_id,
                    version = %key_info.version,
                    "Mailbox updated"
                );
                return Ok(out);
            }
            Err(e) if e.is_conflict() => retry.on_conflict().await?,
            Err(e) => retry.on_failure(e).await?,
        }
    }
}
