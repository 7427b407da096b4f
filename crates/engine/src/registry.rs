//! Process-level store registry
//!
//! Ensures only one `Store` exists per `(name, scope)` within a registry, so
//! every caller asking for a collection shares its keep cache, hooks and
//! critical-state latch. The registry is constructed explicitly and passed
//! to whoever needs stores; there is no process-global instance.

use datakeep_core::{ActiveSession, KeepError, KeepResult};
use datakeep_storage::Backend;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::KeepConfig;
use crate::store::{Document, Store, StoreInfo};

/// One process identity, one backend, one store per collection.
pub struct StoreRegistry {
    backend: Arc<dyn Backend>,
    session: ActiveSession,
    config: Arc<KeepConfig>,
    stores: Mutex<HashMap<StoreInfo, Arc<dyn Any + Send + Sync>>>,
}

impl StoreRegistry {
    /// # Errors
    ///
    /// `InvalidInput` if `config` fails validation.
    pub fn new(
        backend: Arc<dyn Backend>,
        session: ActiveSession,
        config: KeepConfig,
    ) -> KeepResult<Self> {
        config.validate()?;
        Ok(StoreRegistry {
            backend,
            session,
            config: Arc::new(config),
            stores: Mutex::new(HashMap::new()),
        })
    }

    pub fn session(&self) -> &ActiveSession {
        &self.session
    }

    pub fn config(&self) -> &KeepConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn len(&self) -> usize {
        self.stores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.lock().is_empty()
    }

    /// The store registered under `info`, created from `template` on first
    /// request. Later requests get the existing store; their template is
    /// ignored.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `info` is already registered with another document
    /// type.
    pub fn get_store<T: Document>(&self, info: StoreInfo, template: T) -> KeepResult<Store<T>> {
        let mut stores = self.stores.lock();
        if let Some(existing) = stores.get(&info) {
            return existing.downcast_ref::<Store<T>>().cloned().ok_or_else(|| {
                KeepError::invalid_input(format!(
                    "store '{}' is already registered with a different document type",
                    info
                ))
            });
        }

        let store = Store::new(
            info.clone(),
            template,
            Arc::clone(&self.backend),
            self.session.clone(),
            Arc::clone(&self.config),
        )?;
        debug!(target: "datakeep::store", store = %info, "Store registered");
        stores.insert(info, Arc::new(store.clone()));
        Ok(store)
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("session", &self.session)
            .field("stores", &self.len())
            .finish()
    }
}
