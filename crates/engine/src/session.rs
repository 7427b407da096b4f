//! Session lock manager
//!
//! Distributed mutual exclusion over a key, without a lock server. The lock
//! is the `MetaData.ActiveSession` field of the persisted record, and every
//! transition is one read-modify-CAS cycle against the backend:
//!
//! ```text
//! Unowned ──acquire──► Acquiring ──► Owned ◄──► Renewing
//!                                      │
//!                                      ├──release──► Releasing ──► Unowned
//!                                      └──taken over elsewhere──► Stolen
//! ```
//!
//! Two processes racing for the same key both read, both write, and the
//! backend's CAS lets exactly one of them through. The loser re-reads, sees
//! a fresh foreign session and goes through conflict resolution.
//!
//! A session is stale once its `LastUpdate` is older than
//! `session_stale_after_ms`. Staleness is evaluated lazily, only when
//! another process attempts to acquire.

use dashmap::DashMap;
use datakeep_core::{
    ActiveSession, GlobalUpdates, KeepError, KeepRecord, KeepResult, KeyInfo, MailboxOp,
    MetaData, Timestamp,
};
use datakeep_storage::{Backend, BackendKey, StoredEntry, WriteRequest};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::KeepConfig;
use crate::health::HealthMonitor;
use crate::retry::RetryState;

/// Outcome of conflict resolution against a fresh foreign session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnreleasedAction {
    /// Abort the load with `SessionLocked`.
    #[default]
    Cancel,
    /// Take the lock anyway.
    Ignore,
}

/// Called with the current holder when a load finds the key locked.
pub type ConflictHandler = Arc<dyn Fn(&ActiveSession) -> UnreleasedAction + Send + Sync>;

/// Local view of one key's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unowned,
    Acquiring,
    Owned,
    Renewing,
    Releasing,
    Stolen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Data write plus heartbeat; fails if the session was lost.
    Renew,
    /// Data write that re-asserts the session even if it was lost.
    Overwrite,
    /// Final write that clears the session.
    Release,
}

/// A successful acquisition.
#[derive(Debug, Clone)]
pub struct Acquired {
    /// The record as written, session included
    pub record: KeepRecord,
    pub key_info: KeyInfo,
    /// Fresh holder displaced by a forced takeover
    pub taken_from: Option<ActiveSession>,
}

/// One commit of a loaded key.
#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    /// New document, or `None` to keep what is stored
    pub data: Option<Value>,
    /// Mailbox decisions to replay onto the stored mailbox
    pub ops: &'a [MailboxOp],
    pub user_ids: &'a [u64],
    pub mode: CommitMode,
}

#[derive(Debug, Clone)]
pub struct Committed {
    pub key_info: KeyInfo,
    /// Metadata as written
    pub metadata: MetaData,
    /// Stored mailbox after the ops were applied
    pub global_updates: GlobalUpdates,
}

/// Acquires, renews and releases session locks for one process identity.
pub struct SessionLockManager {
    backend: Arc<dyn Backend>,
    session: ActiveSession,
    config: Arc<KeepConfig>,
    health: Arc<HealthMonitor>,
    states: DashMap<BackendKey, LockState>,
}

impl SessionLockManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        session: ActiveSession,
        config: Arc<KeepConfig>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        SessionLockManager {
            backend,
            session,
            config,
            health,
            states: DashMap::new(),
        }
    }

    pub fn session(&self) -> &ActiveSession {
        &self.session
    }

    pub fn state(&self, key: &BackendKey) -> LockState {
        self.states
            .get(key)
            .map(|s| *s)
            .unwrap_or(LockState::Unowned)
    }

    pub fn is_owned(&self, key: &BackendKey) -> bool {
        matches!(self.state(key), LockState::Owned | LockState::Renewing)
    }

    fn set_state(&self, key: &BackendKey, state: LockState) {
        if state == LockState::Unowned {
            self.states.remove(key);
        } else {
            self.states.insert(key.clone(), state);
        }
    }

    async fn read(
        &self,
        key: &BackendKey,
    ) -> datakeep_storage::StorageResult<Option<StoredEntry>> {
        self.health.observe(self.backend.get(key).await)
    }

    /// Claim `key` for this process.
    ///
    /// An unowned or stale key is claimed outright. A fresh foreign session
    /// is put to `handler` (default `Cancel`); `Ignore` forces a takeover
    /// when the configuration allows it and records the taker in
    /// `ForceLoad`. The handler is consulted at most once per holder.
    ///
    /// # Errors
    ///
    /// `SessionLocked` when the conflict resolves as Cancel, backend errors
    /// once retries are exhausted, `Serialization` for a malformed record.
    pub async fn acquire(
        &self,
        key: &BackendKey,
        handler: Option<&ConflictHandler>,
    ) -> KeepResult<Acquired> {
        // A write still in flight for this key would clear the claim.
        if matches!(self.state(key), LockState::Releasing | LockState::Renewing) {
            warn!(target: "datakeep::session", key = %key, "Acquire refused while a write is in flight");
            return Err(KeepError::SessionLocked {
                holder: self.session.clone(),
            });
        }
        self.set_state(key, LockState::Acquiring);
        let result = self.acquire_inner(key, handler).await;
        match &result {
            Ok(_) => self.set_state(key, LockState::Owned),
            Err(_) => self.set_state(key, LockState::Unowned),
        }
        result
    }

    async fn acquire_inner(
        &self,
        key: &BackendKey,
        handler: Option<&ConflictHandler>,
    ) -> KeepResult<Acquired> {
        let stale_after = self.config.stale_after();
        let mut retry = RetryState::new(&self.config, key, "acquire");
        let mut decided: Option<(ActiveSession, UnreleasedAction)> = None;

        loop {
            let entry = match self.read(key).await {
                Ok(entry) => entry,
                Err(e) => {
                    retry.on_failure(e).await?;
                    continue;
                }
            };
            let now = Timestamp::now();
            let (mut record, current) = decode(entry, now)?;

            let mut taken_from = None;
            if let Some(holder) = record
                .metadata
                .blocking_holder(&self.session, stale_after, now)
                .cloned()
            {
                let action = match &decided {
                    Some((seen, action)) if *seen == holder => *action,
                    _ => {
                        let action = handler.map_or(UnreleasedAction::Cancel, |h| h(&holder));
                        decided = Some((holder.clone(), action));
                        action
                    }
                };
                match action {
                    UnreleasedAction::Ignore if self.config.allow_forced_takeover => {
                        warn!(target: "datakeep::session", key = %key, holder = %holder, "Forcing takeover of fresh session");
                        taken_from = Some(holder);
                    }
                    UnreleasedAction::Ignore => {
                        info!(target: "datakeep::session", key = %key, holder = %holder, "Forced takeover disabled, cancelling load");
                        return Err(KeepError::SessionLocked { holder });
                    }
                    UnreleasedAction::Cancel => {
                        info!(target: "datakeep::session", key = %key, holder = %holder, "Key locked by another session");
                        return Err(KeepError::SessionLocked { holder });
                    }
                }
            } else if let Some(stale) = record
                .metadata
                .active_session
                .as_ref()
                .filter(|s| **s != self.session)
            {
                info!(
                    target: "datakeep::session",
                    key = %key,
                    holder = %stale,
                    last_update = %record.metadata.last_update,
                    "Reclaiming stale session"
                );
            }

            let meta = &mut record.metadata;
            meta.active_session = Some(self.session.clone());
            meta.force_load = taken_from.as_ref().map(|_| self.session.clone());
            meta.last_update = now;
            meta.load_count += 1;

            let user_ids = current
                .as_ref()
                .map(|info| info.user_ids.clone())
                .unwrap_or_default();
            let request = WriteRequest::new(record.to_value()?).with_user_ids(user_ids);
            let expected = current.map(|info| info.version);

            let written = self
                .backend
                .compare_and_swap(key, expected.as_ref(), request)
                .await;
            match self.health.observe(written) {
                Ok(key_info) => {
                    info!(
                        target: "datakeep::session",
                        key = %key,
                        load_count = record.metadata.load_count,
                        version = %key_info.version,
                        "Session acquired"
                    );
                    return Ok(Acquired {
                        record,
                        key_info,
                        taken_from,
                    });
                }
                Err(e) if e.is_conflict() => retry.on_conflict().await?,
                Err(e) => retry.on_failure(e).await?,
            }
        }
    }

    /// Heartbeat plus data write.
    pub async fn renew(
        &self,
        key: &BackendKey,
        data: Value,
        ops: &[MailboxOp],
        user_ids: &[u64],
    ) -> KeepResult<Committed> {
        self.commit(
            key,
            CommitRequest {
                data: Some(data),
                ops,
                user_ids,
                mode: CommitMode::Renew,
            },
        )
        .await
    }

    /// Final write that clears the session.
    ///
    /// With `data = None` the stored document is left as it is, which is how
    /// a load that failed after acquiring gives the key back.
    pub async fn release(
        &self,
        key: &BackendKey,
        data: Option<Value>,
        ops: &[MailboxOp],
        user_ids: &[u64],
    ) -> KeepResult<Committed> {
        self.commit(
            key,
            CommitRequest {
                data,
                ops,
                user_ids,
                mode: CommitMode::Release,
            },
        )
        .await
    }

    /// Write `request` onto the freshest stored record.
    ///
    /// The stored mailbox is taken as the base and `request.ops` replayed on
    /// top of it, so updates posted since our last read survive.
    ///
    /// # Errors
    ///
    /// `SessionLost` if another session holds the key (except in
    /// `Overwrite` mode); backend errors once retries are exhausted.
    pub async fn commit(
        &self,
        key: &BackendKey,
        request: CommitRequest<'_>,
    ) -> KeepResult<Committed> {
        let during = match request.mode {
            CommitMode::Release => LockState::Releasing,
            _ => LockState::Renewing,
        };
        self.set_state(key, during);
        let result = self.commit_inner(key, &request).await;
        let after = match (&result, request.mode) {
            (Ok(_), CommitMode::Release) => LockState::Unowned,
            (Err(KeepError::SessionLost { .. }), _) => LockState::Stolen,
            _ => LockState::Owned,
        };
        self.set_state(key, after);
        result
    }

    async fn commit_inner(
        &self,
        key: &BackendKey,
        request: &CommitRequest<'_>,
    ) -> KeepResult<Committed> {
        let mut retry = RetryState::new(&self.config, key, "commit");
        loop {
            let entry = match self.read(key).await {
                Ok(entry) => entry,
                Err(e) => {
                    retry.on_failure(e).await?;
                    continue;
                }
            };
            let now = Timestamp::now();
            let (mut record, current) = decode(entry, now)?;
            let Some(current) = current else {
                warn!(target: "datakeep::session", key = %key, "Record vanished while loaded");
                return Err(KeepError::SessionLost { holder: None });
            };

            if !record.metadata.is_held_by(&self.session) {
                let holder = record.metadata.active_session.clone();
                if request.mode != CommitMode::Overwrite {
                    warn!(
                        target: "datakeep::session",
                        key = %key,
                        holder = ?holder.as_ref().map(ToString::to_string),
                        "Session lost"
                    );
                    return Err(KeepError::SessionLost { holder });
                }
                warn!(target: "datakeep::session", key = %key, "Overwrite re-asserting session");
            }

            if let Some(data) = &request.data {
                record.data = Some(data.clone());
            }
            record.global_updates.apply_ops(request.ops);

            let meta = &mut record.metadata;
            meta.last_update = now;
            if meta.force_load.as_ref() == Some(&self.session) {
                meta.force_load = None;
            }
            meta.active_session = match request.mode {
                CommitMode::Release => None,
                CommitMode::Renew | CommitMode::Overwrite => Some(self.session.clone()),
            };

            let write = WriteRequest::new(record.to_value()?).with_user_ids(request.user_ids.to_vec());
            let written = self
                .backend
                .compare_and_swap(key, Some(&current.version), write)
                .await;
            match self.health.observe(written) {
                Ok(key_info) => {
                    debug!(
                        target: "datakeep::session",
                        key = %key,
                        mode = ?request.mode,
                        version = %key_info.version,
                        "Committed"
                    );
                    if request.mode == CommitMode::Release {
                        info!(target: "datakeep::session", key = %key, "Session released");
                    }
                    return Ok(Committed {
                        key_info,
                        metadata: record.metadata,
                        global_updates: record.global_updates,
                    });
                }
                Err(e) if e.is_conflict() => retry.on_conflict().await?,
                Err(e) => retry.on_failure(e).await?,
            }
        }
    }
}

impl std::fmt::Debug for SessionLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLockManager")
            .field("session", &self.session)
            .field("keys", &self.states.len())
            .finish()
    }
}

/// Decode a stored entry, or start an empty record for a new key.
pub(crate) fn decode(
    entry: Option<StoredEntry>,
    now: Timestamp,
) -> KeepResult<(KeepRecord, Option<KeyInfo>)> {
    match entry {
        Some(entry) => Ok((KeepRecord::from_value(entry.value)?, Some(entry.key_info))),
        None => Ok((KeepRecord::empty(now), None)),
    }
}
