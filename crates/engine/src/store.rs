//! Store: one logical collection of documents
//!
//! A store is identified by a name and an optional scope and produces
//! [`Keep`]s for its keys. It owns everything keeps of the collection share:
//! the template, the validator, the PreLoad/PreSave hook chains, the
//! session lock manager and the backend health latch.
//!
//! Document pipeline:
//!
//! ```text
//! read:  stored value ─► PreLoad hooks ─► decode T ─► validate
//! write: validate ─► encode T ─► PreSave hooks ─► stored value
//! ```
//!
//! A key whose record holds no document yet starts from the template, which
//! is validated but not run through PreLoad. A stored document that no
//! longer decodes as `T` (fields added since it was written) is decoded
//! again after filling the missing fields from the template.
//!
//! `Store` is a cheap handle; clones share the same state.

use dashmap::DashMap;
use datakeep_core::{
    reconcile, ActiveSession, GlobalUpdate, KeepError, KeepRecord, KeepResult, Signal, Version,
};
use datakeep_storage::{Backend, BackendKey, MemoryBackend};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::ptr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::KeepConfig;
use crate::health::HealthMonitor;
use crate::keep::{GlobalStateProcessor, Keep, UpdateAction};
use crate::mailbox::{self, GlobalUpdatesEditor};
use crate::session::{ConflictHandler, SessionLockManager};

/// Bounds every document type stored through a keep.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Document for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Rejects a document with a reason.
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

/// Pure transform of the stored representation.
pub type TransformHook = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Name and optional scope of a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreInfo {
    pub name: String,
    pub scope: Option<String>,
}

impl StoreInfo {
    pub fn new(name: impl Into<String>) -> Self {
        StoreInfo {
            name: name.into(),
            scope: None,
        }
    }

    pub fn scoped(name: impl Into<String>, scope: impl Into<String>) -> Self {
        StoreInfo {
            name: name.into(),
            scope: Some(scope.into()),
        }
    }

    /// Backend address of `key` in this store.
    pub fn key(&self, key: &str) -> KeepResult<BackendKey> {
        if key.is_empty() {
            return Err(KeepError::invalid_input("key must not be empty"));
        }
        Ok(BackendKey::new(self.name.clone(), self.scope.clone(), key))
    }
}

impl fmt::Display for StoreInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}/{}", self.name, scope),
            None => f.write_str(&self.name),
        }
    }
}

pub(crate) struct StoreShared<T> {
    pub(crate) info: StoreInfo,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) config: Arc<KeepConfig>,
    pub(crate) health: Arc<HealthMonitor>,
    pub(crate) locks: SessionLockManager,
    template: T,
    template_value: Value,
    validator: RwLock<Option<Validator<T>>>,
    pre_save: RwLock<Vec<TransformHook>>,
    pre_load: RwLock<Vec<TransformHook>>,
    default_processor: RwLock<GlobalStateProcessor>,
    keeps: DashMap<String, Weak<Keep<T>>>,
    load_gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl<T: Document> StoreShared<T> {
    pub(crate) fn template_value(&self) -> &Value {
        &self.template_value
    }

    pub(crate) fn default_processor(&self) -> GlobalStateProcessor {
        self.default_processor.read().clone()
    }

    pub(crate) fn validate(&self, document: &T) -> KeepResult<()> {
        let validator = self.validator.read().clone();
        match validator {
            Some(validator) => validator(document).map_err(KeepError::validation),
            None => Ok(()),
        }
    }

    /// Stored document (or its absence) to a validated `T`.
    pub(crate) fn decode_document(&self, stored: Option<Value>) -> KeepResult<T> {
        let document = match stored {
            None | Some(Value::Null) => self.template.clone(),
            Some(value) => {
                let hooks = self.pre_load.read().clone();
                let value = run_hooks(&hooks, value)?;
                match T::deserialize(&value) {
                    Ok(document) => document,
                    Err(direct) => {
                        let filled = reconcile(&value, &self.template_value);
                        T::deserialize(&filled).map_err(|_| direct)?
                    }
                }
            }
        };
        self.validate(&document)?;
        Ok(document)
    }

    /// Validated `T` to the value handed to the backend.
    pub(crate) fn encode_document(&self, document: &T) -> KeepResult<Value> {
        self.validate(document)?;
        let value = serde_json::to_value(document)?;
        let hooks = self.pre_save.read().clone();
        run_hooks(&hooks, value)
    }
}

impl<T> StoreShared<T> {
    /// Drop the registry entry of `key` if it points at `keep` or at a
    /// keep that no longer exists.
    pub(crate) fn forget(&self, key: &str, keep: &Keep<T>) {
        self.keeps.remove_if(key, |_, weak| {
            weak.strong_count() == 0 || ptr::eq(weak.as_ptr(), keep)
        });
    }

    /// Whether `keep` is the registered keep of `key`.
    pub(crate) fn is_registered(&self, key: &str, keep: &Keep<T>) -> bool {
        self.keeps
            .get(key)
            .map_or(false, |weak| ptr::eq(weak.as_ptr(), keep))
    }
}

fn run_hooks(hooks: &[TransformHook], mut value: Value) -> KeepResult<Value> {
    for hook in hooks {
        value = hook(value).map_err(KeepError::hook)?;
    }
    Ok(value)
}

/// Registry and factory of keeps for one collection.
pub struct Store<T> {
    shared: Arc<StoreShared<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Store {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Document> Store<T> {
    /// Create a store over `backend` acting as `session`.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an invalid config, `Serialization` if the template
    /// cannot be encoded.
    pub fn new(
        info: StoreInfo,
        template: T,
        backend: Arc<dyn Backend>,
        session: ActiveSession,
        config: Arc<KeepConfig>,
    ) -> KeepResult<Self> {
        config.validate()?;
        let template_value = serde_json::to_value(&template)?;
        let health = Arc::new(HealthMonitor::new(
            info.to_string(),
            config.critical_failure_threshold,
        ));
        let locks = SessionLockManager::new(
            Arc::clone(&backend),
            session,
            Arc::clone(&config),
            Arc::clone(&health),
        );
        let lock_all: GlobalStateProcessor = Arc::new(|_: &GlobalUpdate| UpdateAction::Lock);
        info!(target: "datakeep::store", store = %info, "Store created");
        Ok(Store {
            shared: Arc::new(StoreShared {
                info,
                backend,
                config,
                health,
                locks,
                template,
                template_value,
                validator: RwLock::new(None),
                pre_save: RwLock::new(Vec::new()),
                pre_load: RwLock::new(Vec::new()),
                default_processor: RwLock::new(lock_all),
                keeps: DashMap::new(),
                load_gates: DashMap::new(),
            }),
        })
    }

    /// Sibling store over a private in-memory backend.
    ///
    /// Shares the template, validator, hooks and default processor as they
    /// are now; later registrations on either store do not propagate.
    pub fn mock(&self) -> KeepResult<Self> {
        let shared = &self.shared;
        let mock = Store::new(
            shared.info.clone(),
            shared.template.clone(),
            MemoryBackend::shared(),
            shared.locks.session().clone(),
            Arc::clone(&shared.config),
        )?;
        *mock.shared.validator.write() = shared.validator.read().clone();
        *mock.shared.pre_save.write() = shared.pre_save.read().clone();
        *mock.shared.pre_load.write() = shared.pre_load.read().clone();
        *mock.shared.default_processor.write() = shared.default_processor();
        Ok(mock)
    }

    pub fn info(&self) -> &StoreInfo {
        &self.shared.info
    }

    pub fn config(&self) -> &KeepConfig {
        &self.shared.config
    }

    pub fn session(&self) -> &ActiveSession {
        self.shared.locks.session()
    }

    pub fn template(&self) -> &T {
        &self.shared.template
    }

    /// Replace the document validator.
    pub fn set_validator(&self, validator: impl Fn(&T) -> Result<(), String> + Send + Sync + 'static) {
        *self.shared.validator.write() = Some(Arc::new(validator));
    }

    /// Append a hook run on the stored value right before every write.
    pub fn pre_save(&self, hook: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static) {
        self.shared.pre_save.write().push(Arc::new(hook));
    }

    /// Append a hook run on the stored value right after every read.
    pub fn pre_load(&self, hook: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static) {
        self.shared.pre_load.write().push(Arc::new(hook));
    }

    /// Processor copied into every keep this store loads from now on.
    pub fn set_global_state_processor(
        &self,
        processor: impl Fn(&GlobalUpdate) -> UpdateAction + Send + Sync + 'static,
    ) {
        *self.shared.default_processor.write() = Arc::new(processor);
    }

    pub fn is_critical(&self) -> bool {
        self.shared.health.is_critical()
    }

    /// Emits `true` on entering critical state and `false` on leaving it.
    pub fn critical_state_signal(&self) -> &Signal<bool> {
        self.shared.health.critical_signal()
    }

    /// Emits every backend failure message.
    pub fn issue_signal(&self) -> &Signal<String> {
        self.shared.health.issue_signal()
    }

    /// The active keep of `key` in this process, if any.
    pub fn loaded_keep(&self, key: &str) -> Option<Arc<Keep<T>>> {
        self.shared
            .keeps
            .get(key)
            .and_then(|weak| weak.upgrade())
            .filter(|keep| keep.is_active())
    }

    /// Load `key` with a session lock.
    ///
    /// Returns the already loaded keep when this process holds the key.
    /// Concurrent loads of one key within the process are serialized and
    /// share the result. A release of the key still in flight in this
    /// process is waited for before the session is claimed again. The
    /// store's global state processor runs over the mailbox before this
    /// returns.
    ///
    /// # Errors
    ///
    /// - `SessionLocked` if another session holds the key and the conflict
    ///   resolves as Cancel.
    /// - `Validation` / `Hook` if the document is rejected; the session is
    ///   given back before returning.
    /// - `BackendUnavailable` if the backend fails while the store is in
    ///   critical state.
    pub async fn load_keep(
        &self,
        key: &str,
        handler: Option<ConflictHandler>,
    ) -> KeepResult<Arc<Keep<T>>> {
        if let Some(keep) = self.loaded_keep(key) {
            return Ok(keep);
        }
        let backend_key = self.shared.info.key(key)?;
        let gate = self
            .shared
            .load_gates
            .entry(key.to_string())
            .or_default()
            .clone();
        let result = {
            let _loading = gate.lock().await;
            self.load_gated(key, backend_key, handler).await
        };
        drop(gate);
        self.shared
            .load_gates
            .remove_if(key, |_, gate| Arc::strong_count(gate) == 1);
        if result.is_err() {
            self.shared
                .keeps
                .remove_if(key, |_, weak| weak.strong_count() == 0);
        }
        result
    }

    async fn load_gated(
        &self,
        key: &str,
        backend_key: BackendKey,
        handler: Option<ConflictHandler>,
    ) -> KeepResult<Arc<Keep<T>>> {
        let previous = self.shared.keeps.get(key).and_then(|weak| weak.upgrade());
        if let Some(previous) = previous {
            if previous.is_active() {
                return Ok(previous);
            }
            previous.settled().await;
            debug!(target: "datakeep::store", key = %backend_key, state = ?previous.state(), "Previous keep settled");
        }

        let acquired = match self.shared.locks.acquire(&backend_key, handler.as_ref()).await {
            Ok(acquired) => acquired,
            Err(e) if e.is_backend_failure() && self.is_critical() => {
                warn!(target: "datakeep::store", key = %backend_key, error = %e, "Load failed in critical state");
                return Err(KeepError::unavailable(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let data = match self.shared.decode_document(acquired.record.data.clone()) {
            Ok(data) => data,
            Err(e) => {
                warn!(target: "datakeep::store", key = %backend_key, error = %e, "Loaded document rejected, giving the session back");
                let user_ids = acquired.key_info.user_ids.clone();
                if let Err(release_err) = self
                    .shared
                    .locks
                    .release(&backend_key, None, &[], &user_ids)
                    .await
                {
                    warn!(target: "datakeep::store", key = %backend_key, error = %release_err, "Session give-back failed");
                }
                return Err(e);
            }
        };

        let keep = Keep::activate(Arc::clone(&self.shared), backend_key, data, acquired);
        self.shared
            .keeps
            .insert(key.to_string(), Arc::downgrade(&keep));
        Ok(keep)
    }

    /// Read-only load, optionally of a historical version.
    ///
    /// No session is taken and nothing is ever written. Returns `None` if
    /// the key (or the version) does not exist.
    pub async fn view_keep(
        &self,
        key: &str,
        version: Option<&Version>,
    ) -> KeepResult<Option<Arc<Keep<T>>>> {
        let backend_key = self.shared.info.key(key)?;
        let fetched = match version {
            Some(version) => self.shared.backend.get_version(&backend_key, version).await,
            None => self.shared.backend.get(&backend_key).await,
        };
        let Some(entry) = self.shared.health.observe(fetched)? else {
            return Ok(None);
        };
        let record = KeepRecord::from_value(entry.value)?;
        let data = self.shared.decode_document(record.data.clone())?;
        debug!(target: "datakeep::store", key = %backend_key, version = %entry.key_info.version, "Viewing keep");
        Ok(Some(Keep::view(
            Arc::clone(&self.shared),
            backend_key,
            data,
            record,
            entry.key_info,
        )))
    }

    /// Edit the mailbox of `key` without loading it.
    ///
    /// `handler` may run more than once if the write races with another
    /// writer; it should only act through the editor.
    pub async fn post_global_update<R, F>(&self, key: &str, handler: F) -> KeepResult<R>
    where
        F: FnMut(&mut GlobalUpdatesEditor) -> KeepResult<R>,
    {
        let backend_key = self.shared.info.key(key)?;
        mailbox::post(
            self.shared.backend.as_ref(),
            &self.shared.health,
            &self.shared.config,
            &backend_key,
            handler,
        )
        .await
    }
}

impl<T> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("info", &self.shared.info)
            .field("keeps", &self.shared.keeps.len())
            .finish()
    }
}
