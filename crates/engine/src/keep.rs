//! Keep: the loaded, owned handle of one document
//!
//! ```text
//! Loading ──► Active ──release──► Releasing ──► Released
//!                │                    │
//!                │                    └──backend failure──► Failed
//!                └──session lost on write──► Released
//! ```
//!
//! The in-memory `T` is the only writable copy of the document while the
//! keep is active. Writes (save, overwrite, autosave, release) are
//! serialized through one async gate per keep, so two writes of the same
//! keep are never in flight together; a second write waits for the first.
//! A keep leaves its store's registry once it is released, and a later
//! load of the same key waits for that release to finish writing.
//!
//! Global-update decisions (lock, remove, clear) apply to the in-memory
//! mailbox immediately and are queued as [`MailboxOp`]s, which the next
//! write replays onto the freshest stored mailbox.

use datakeep_core::{
    reconcile, DocPath, GlobalId, GlobalUpdate, GlobalUpdates, KeepError, KeepRecord, KeepResult,
    KeyInfo, MailboxOp, MetaData, Signal, Timestamp, Version,
};
use datakeep_storage::BackendKey;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::autosave::{self, AutosaveHandle};
use crate::session::{Acquired, CommitMode, CommitRequest, Committed};
use crate::store::{Document, StoreShared};
use crate::versions::VersionIterator;

/// Decision of a global state processor for one active update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    /// Acknowledge: move to the locked partition and fire `on_global_update`.
    Lock,
    /// Discard without acknowledging.
    Remove,
    /// Leave active; the processor sees it again at the next refresh.
    Leave,
}

/// Called for every active update at load and after every write.
pub type GlobalStateProcessor = Arc<dyn Fn(&GlobalUpdate) -> UpdateAction + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepState {
    Loading,
    Active,
    Releasing,
    Released,
    Failed,
}

/// Progress of one write, as carried by the `saving` and `releasing` signals.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteNotice {
    Started,
    Committed(KeyInfo),
    Failed(String),
}

struct KeepInner {
    state: KeepState,
    metadata: MetaData,
    key_info: KeyInfo,
    global_updates: GlobalUpdates,
    pending_ops: Vec<MailboxOp>,
    user_ids: Vec<u64>,
}

pub struct Keep<T> {
    store: Arc<StoreShared<T>>,
    key: BackendKey,
    view_only: bool,
    data: RwLock<T>,
    inner: Mutex<KeepInner>,
    write_gate: tokio::sync::Mutex<()>,
    processor: RwLock<GlobalStateProcessor>,
    autosave: Mutex<Option<AutosaveHandle>>,
    saving: Signal<WriteNotice>,
    releasing: Signal<WriteNotice>,
    on_global_update: Signal<GlobalUpdate>,
    data_changed: Signal<DocPath>,
}

impl<T: Document> Keep<T> {
    fn build(
        store: Arc<StoreShared<T>>,
        key: BackendKey,
        data: T,
        record: KeepRecord,
        key_info: KeyInfo,
        view_only: bool,
    ) -> Self {
        let processor = store.default_processor();
        Keep {
            store,
            key,
            view_only,
            data: RwLock::new(data),
            inner: Mutex::new(KeepInner {
                state: KeepState::Loading,
                metadata: record.metadata,
                user_ids: key_info.user_ids.clone(),
                key_info,
                global_updates: record.global_updates,
                pending_ops: Vec::new(),
            }),
            write_gate: tokio::sync::Mutex::new(()),
            processor: RwLock::new(processor),
            autosave: Mutex::new(None),
            saving: Signal::new(),
            releasing: Signal::new(),
            on_global_update: Signal::new(),
            data_changed: Signal::new(),
        }
    }

    /// Wrap a freshly acquired record, process its mailbox and start autosave.
    pub(crate) fn activate(
        store: Arc<StoreShared<T>>,
        key: BackendKey,
        data: T,
        acquired: Acquired,
    ) -> Arc<Self> {
        let interval = store.config.autosave_interval();
        let keep = Arc::new(Self::build(
            store,
            key,
            data,
            acquired.record,
            acquired.key_info,
            false,
        ));
        keep.process_global_updates();
        keep.inner.lock().state = KeepState::Active;
        if let Some(interval) = interval {
            *keep.autosave.lock() = Some(autosave::spawn(&keep, interval));
        }
        info!(
            target: "datakeep::keep",
            key = %keep.key,
            taken_from = ?acquired.taken_from.as_ref().map(ToString::to_string),
            "Keep loaded"
        );
        keep
    }

    /// A read-only keep; it never takes a session and never writes.
    pub(crate) fn view(
        store: Arc<StoreShared<T>>,
        key: BackendKey,
        data: T,
        record: KeepRecord,
        key_info: KeyInfo,
    ) -> Arc<Self> {
        let keep = Self::build(store, key, data, record, key_info, true);
        keep.inner.lock().state = KeepState::Active;
        Arc::new(keep)
    }

    /// `store/scope/key` of the document.
    pub fn identify(&self) -> String {
        self.key.to_string()
    }

    pub fn key(&self) -> &BackendKey {
        &self.key
    }

    pub fn state(&self) -> KeepState {
        self.inner.lock().state
    }

    pub fn is_view_only(&self) -> bool {
        self.view_only
    }

    /// True while this keep holds the session of its key.
    pub fn is_active(&self) -> bool {
        !self.view_only
            && self.state() == KeepState::Active
            && self.store.locks.is_owned(&self.key)
    }

    /// Backend metadata of the last write seen by this keep.
    pub fn key_info(&self) -> KeyInfo {
        self.inner.lock().key_info.clone()
    }

    pub fn metadata(&self) -> MetaData {
        self.inner.lock().metadata.clone()
    }

    pub fn autosave_running(&self) -> bool {
        self.autosave
            .lock()
            .as_ref()
            .map_or(false, AutosaveHandle::is_running)
    }

    // ------------------------------------------------------------------
    // Document access
    // ------------------------------------------------------------------

    /// Snapshot of the document.
    pub fn data(&self) -> T {
        self.data.read().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.data.read())
    }

    /// Mutate the document in memory. The change is persisted by the next
    /// write.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> KeepResult<R> {
        self.ensure_not_released()?;
        let out = f(&mut self.data.write());
        self.data_changed.emit(&DocPath::root());
        Ok(out)
    }

    pub fn set_data(&self, data: T) -> KeepResult<()> {
        self.update(|current| *current = data)
    }

    /// Apply `f` to the JSON form of the document and store the result.
    ///
    /// The document is untouched if `f` fails or its output no longer
    /// decodes as `T`.
    pub(crate) fn apply_at<R>(
        &self,
        path: &DocPath,
        f: impl FnOnce(&mut Value) -> KeepResult<R>,
    ) -> KeepResult<R> {
        self.ensure_not_released()?;
        let out = {
            let mut data = self.data.write();
            let mut value = serde_json::to_value(&*data)?;
            let out = f(&mut value)?;
            *data = serde_json::from_value(value)?;
            out
        };
        self.data_changed.emit(path);
        Ok(out)
    }

    /// Fill in template fields missing from the document. Present fields are
    /// never overwritten.
    pub fn reconcile(&self) -> KeepResult<()> {
        self.ensure_not_released()?;
        let changed = {
            let mut data = self.data.write();
            let current = serde_json::to_value(&*data)?;
            let merged = reconcile(&current, self.store.template_value());
            if merged == current {
                false
            } else {
                *data = serde_json::from_value(merged)?;
                true
            }
        };
        if changed {
            debug!(target: "datakeep::keep", key = %self.key, "Reconciled with template");
            self.data_changed.emit(&DocPath::root());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // User ids
    // ------------------------------------------------------------------

    pub fn add_user_id(&self, user_id: u64) {
        let mut inner = self.inner.lock();
        if !inner.user_ids.contains(&user_id) {
            inner.user_ids.push(user_id);
        }
    }

    pub fn remove_user_id(&self, user_id: u64) {
        self.inner.lock().user_ids.retain(|id| *id != user_id);
    }

    pub fn user_ids(&self) -> Vec<u64> {
        self.inner.lock().user_ids.clone()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write the document, heartbeat the session and refresh the mailbox.
    ///
    /// On failure the keep stays active and the document is unchanged, so
    /// the call can be retried. If the session was taken over the keep
    /// becomes `Released` and `SessionLost` is returned.
    pub async fn save(&self) -> KeepResult<KeyInfo> {
        self.write(CommitMode::Renew).await
    }

    /// Like `save`, but writes even if another session took the key over,
    /// reclaiming it.
    pub async fn overwrite(&self) -> KeepResult<KeyInfo> {
        self.write(CommitMode::Overwrite).await
    }

    async fn write(&self, mode: CommitMode) -> KeepResult<KeyInfo> {
        if self.view_only {
            return Err(KeepError::ReadOnly);
        }
        let _gate = self.write_gate.lock().await;
        self.ensure_active()?;

        self.saving.emit(&WriteNotice::Started);
        let result = self.commit(mode).await;
        match &result {
            Ok(info) => self.saving.emit(&WriteNotice::Committed(info.clone())),
            Err(e) => {
                self.saving.emit(&WriteNotice::Failed(e.to_string()));
                if matches!(e, KeepError::SessionLost { .. }) {
                    self.set_state(KeepState::Released);
                    self.stop_autosave();
                    self.store.forget(&self.key.key, self);
                }
            }
        }
        result
    }

    async fn commit(&self, mode: CommitMode) -> KeepResult<KeyInfo> {
        let document = {
            let data = self.data.read();
            self.store.encode_document(&data)?
        };
        let (ops, user_ids) = {
            let inner = self.inner.lock();
            (inner.pending_ops.clone(), inner.user_ids.clone())
        };
        let committed = self
            .store
            .locks
            .commit(
                &self.key,
                CommitRequest {
                    data: Some(document),
                    ops: &ops,
                    user_ids: &user_ids,
                    mode,
                },
            )
            .await?;
        let info = self.absorb(committed, ops.len());
        if mode != CommitMode::Release {
            self.process_global_updates();
        }
        Ok(info)
    }

    /// Adopt the stored state after a write. Ops queued while the write was
    /// in flight stay pending and are re-applied on top.
    fn absorb(&self, committed: Committed, written_ops: usize) -> KeyInfo {
        let mut inner = self.inner.lock();
        let split = written_ops.min(inner.pending_ops.len());
        let later = inner.pending_ops.split_off(split);
        let mut mailbox = committed.global_updates;
        mailbox.apply_ops(&later);
        inner.pending_ops = later;
        inner.global_updates = mailbox;
        inner.metadata = committed.metadata;
        inner.key_info = committed.key_info.clone();
        committed.key_info
    }

    /// Final write that gives the key back. Idempotent: releasing a
    /// released keep is a no-op, and a view keep only becomes inert.
    ///
    /// Autosave is stopped first; a save already in flight completes before
    /// the release writes, and writes requested after this call are
    /// refused. If the session was already lost nothing is written and the
    /// keep is simply marked released.
    pub async fn release(&self) -> KeepResult<()> {
        if self.view_only {
            self.set_state(KeepState::Released);
            return Ok(());
        }
        self.stop_autosave();
        {
            let mut inner = self.inner.lock();
            if inner.state == KeepState::Active {
                inner.state = KeepState::Releasing;
            }
        }
        let _pending = PendingRelease(self);
        let _gate = self.write_gate.lock().await;
        match self.state() {
            KeepState::Released => return Ok(()),
            KeepState::Failed if !self.store.is_registered(&self.key.key, self) => {
                debug!(target: "datakeep::keep", key = %self.key, "Failed keep superseded by a later load");
                self.set_state(KeepState::Released);
                return Ok(());
            }
            _ => self.set_state(KeepState::Releasing),
        }

        self.releasing.emit(&WriteNotice::Started);
        match self.commit(CommitMode::Release).await {
            Ok(info) => {
                self.set_state(KeepState::Released);
                self.store.forget(&self.key.key, self);
                info!(target: "datakeep::keep", key = %self.key, version = %info.version, "Keep released");
                self.releasing.emit(&WriteNotice::Committed(info));
                Ok(())
            }
            Err(e @ KeepError::SessionLost { .. }) => {
                self.set_state(KeepState::Released);
                self.store.forget(&self.key.key, self);
                warn!(target: "datakeep::keep", key = %self.key, error = %e, "Release skipped, session already lost");
                self.releasing.emit(&WriteNotice::Failed(e.to_string()));
                Ok(())
            }
            Err(e) => {
                self.set_state(KeepState::Failed);
                warn!(target: "datakeep::keep", key = %self.key, error = %e, "Release failed");
                self.releasing.emit(&WriteNotice::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Restore the document from a historical version.
    ///
    /// The revision at `version` is decoded, passed through `migrate`, and
    /// written as the new latest revision with overwrite semantics. If the
    /// write fails the previous document is put back.
    pub async fn set_version(
        &self,
        version: &Version,
        migrate: impl FnOnce(T) -> T,
    ) -> KeepResult<KeyInfo> {
        if self.view_only {
            return Err(KeepError::ReadOnly);
        }
        self.ensure_active()?;
        let fetched = self.store.backend.get_version(&self.key, version).await;
        let entry = self
            .store
            .health
            .observe(fetched)?
            .ok_or_else(|| KeepError::invalid_input(format!("version {} does not exist", version)))?;
        let record = KeepRecord::from_value(entry.value)?;
        let migrated = migrate(self.store.decode_document(record.data)?);
        self.store.validate(&migrated)?;

        let previous = std::mem::replace(&mut *self.data.write(), migrated);
        self.data_changed.emit(&DocPath::root());
        match self.overwrite().await {
            Ok(info) => {
                info!(target: "datakeep::keep", key = %self.key, from = %version, to = %info.version, "Restored version");
                Ok(info)
            }
            Err(e) => {
                *self.data.write() = previous;
                self.data_changed.emit(&DocPath::root());
                Err(e)
            }
        }
    }

    /// Revisions of this key written inside `[min_date, max_date]`.
    pub fn get_versions(
        &self,
        min_date: Option<Timestamp>,
        max_date: Option<Timestamp>,
    ) -> VersionIterator {
        VersionIterator::new(
            Arc::clone(&self.store.backend),
            Arc::clone(&self.store.health),
            self.key.clone(),
            min_date,
            max_date,
            self.store.config.version_page_size,
        )
    }

    // ------------------------------------------------------------------
    // Global updates
    // ------------------------------------------------------------------

    pub fn get_active_global_updates(&self) -> Vec<GlobalUpdate> {
        self.inner.lock().global_updates.active().to_vec()
    }

    pub fn get_locked_global_updates(&self) -> Vec<GlobalUpdate> {
        self.inner.lock().global_updates.locked().to_vec()
    }

    /// Drop an acknowledged update. Persisted by the next write.
    ///
    /// # Errors
    ///
    /// `NotFound` unless `id` is in the locked partition.
    pub fn clear_locked_update(&self, id: GlobalId) -> KeepResult<()> {
        if self.view_only {
            return Err(KeepError::ReadOnly);
        }
        self.ensure_not_released()?;
        let mut inner = self.inner.lock();
        inner.global_updates.clear_locked(id)?;
        inner.pending_ops.push(MailboxOp::ClearLocked(id));
        Ok(())
    }

    /// Replace this keep's processor; used from the next mailbox refresh.
    pub fn set_global_state_processor(
        &self,
        processor: impl Fn(&GlobalUpdate) -> UpdateAction + Send + Sync + 'static,
    ) {
        *self.processor.write() = Arc::new(processor);
    }

    fn process_global_updates(&self) {
        let processor = self.processor.read().clone();
        let active = self.inner.lock().global_updates.active().to_vec();
        for update in active {
            let op = match processor(&update) {
                UpdateAction::Lock => MailboxOp::Lock(update.id),
                UpdateAction::Remove => MailboxOp::Remove(update.id),
                UpdateAction::Leave => continue,
            };
            let applied = {
                let mut inner = self.inner.lock();
                let applied = match op {
                    MailboxOp::Lock(id) => inner.global_updates.lock(id),
                    _ => inner.global_updates.remove_active(update.id),
                };
                if applied.is_ok() {
                    inner.pending_ops.push(op);
                }
                applied
            };
            match (op, applied) {
                (MailboxOp::Lock(_), Ok(locked)) => {
                    debug!(target: "datakeep::mailbox", key = %self.key, id = locked.id, "Global update locked");
                    self.on_global_update.emit(&locked);
                }
                (_, Ok(removed)) => {
                    debug!(target: "datakeep::mailbox", key = %self.key, id = removed.id, "Global update removed");
                }
                (_, Err(e)) => {
                    debug!(target: "datakeep::mailbox", key = %self.key, id = update.id, error = %e, "Global update already handled");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    pub fn saving(&self) -> &Signal<WriteNotice> {
        &self.saving
    }

    pub fn releasing(&self) -> &Signal<WriteNotice> {
        &self.releasing
    }

    /// Fires with each update the processor locks.
    pub fn on_global_update(&self) -> &Signal<GlobalUpdate> {
        &self.on_global_update
    }

    /// Fires with the path of each in-memory document change.
    pub fn data_changed(&self) -> &Signal<DocPath> {
        &self.data_changed
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn set_state(&self, state: KeepState) {
        self.inner.lock().state = state;
    }

    fn ensure_active(&self) -> KeepResult<()> {
        match self.state() {
            KeepState::Active | KeepState::Loading => Ok(()),
            _ => Err(KeepError::Released),
        }
    }

    fn ensure_not_released(&self) -> KeepResult<()> {
        match self.state() {
            KeepState::Released => Err(KeepError::Released),
            _ => Ok(()),
        }
    }

    fn stop_autosave(&self) {
        if let Some(handle) = self.autosave.lock().take() {
            handle.stop();
        }
    }

    /// Resolves once no write is in flight and no release is pending.
    pub(crate) async fn settled(&self) {
        loop {
            drop(self.write_gate.lock().await);
            if self.state() != KeepState::Releasing {
                return;
            }
            tokio::task::yield_now().await;
        }
    }
}

/// Marks a release abandoned mid-flight as failed, so waiters on the keep
/// are not left behind a `Releasing` state nobody will finish.
struct PendingRelease<'a, T>(&'a Keep<T>);

impl<T> Drop for PendingRelease<'_, T> {
    fn drop(&mut self) {
        let mut inner = self.0.inner.lock();
        if inner.state == KeepState::Releasing {
            inner.state = KeepState::Failed;
        }
    }
}

impl<T> Drop for Keep<T> {
    fn drop(&mut self) {
        if !self.view_only {
            self.store.forget(&self.key.key, self);
        }
    }
}

impl<T> fmt::Debug for Keep<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Keep")
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("view_only", &self.view_only)
            .field("version", &inner.key_info.version)
            .finish()
    }
}
