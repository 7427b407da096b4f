//! Backend health tracking and the critical-state latch
//!
//! Every backend call a store makes reports its outcome here. After
//! `critical_failure_threshold` consecutive failures the store latches into
//! critical state and emits `true` on the critical-state signal; the latch
//! stays set until the next successful call, which emits `false`.
//!
//! A CAS conflict is a successful round-trip: the backend answered.

use datakeep_core::Signal;
use datakeep_storage::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{error, info, warn};

pub struct HealthMonitor {
    store: String,
    threshold: u32,
    consecutive_failures: AtomicU32,
    critical: AtomicBool,
    // Serializes latch transitions so enter/exit signals alternate.
    transition: Mutex<()>,
    critical_signal: Signal<bool>,
    issue_signal: Signal<String>,
}

impl HealthMonitor {
    pub fn new(store: impl Into<String>, threshold: u32) -> Self {
        HealthMonitor {
            store: store.into(),
            threshold: threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            critical: AtomicBool::new(false),
            transition: Mutex::new(()),
            critical_signal: Signal::new(),
            issue_signal: Signal::new(),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.critical.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Emits `true` on entering critical state, `false` on leaving it.
    pub fn critical_signal(&self) -> &Signal<bool> {
        &self.critical_signal
    }

    /// Emits the message of every backend failure.
    pub fn issue_signal(&self) -> &Signal<String> {
        &self.issue_signal
    }

    /// Record the outcome of one backend call and pass it through.
    pub fn observe<R>(&self, result: StorageResult<R>) -> StorageResult<R> {
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_conflict() => self.record_success(),
            Err(e) => self.record_failure(e),
        }
        result
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if !self.is_critical() {
            return;
        }
        let _guard = self.transition.lock();
        if self.critical.swap(false, Ordering::AcqRel) {
            info!(target: "datakeep::store", store = %self.store, "Backend recovered, leaving critical state");
            self.critical_signal.emit(&false);
        }
    }

    pub fn record_failure(&self, e: &StorageError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(target: "datakeep::store", store = %self.store, failures, error = %e, "Backend call failed");
        self.issue_signal.emit(&e.to_string());

        if failures < self.threshold || self.is_critical() {
            return;
        }
        let _guard = self.transition.lock();
        if !self.critical.swap(true, Ordering::AcqRel) {
            error!(target: "datakeep::store", store = %self.store, failures, "Entering critical state");
            self.critical_signal.emit(&true);
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("store", &self.store)
            .field("critical", &self.is_critical())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}
