//! In-memory backend
//!
//! Every key maps to a revision chain stored oldest-first in a `DashMap`
//! shard. A compare-and-swap holds the shard entry for the duration of the
//! check and the append, so two writers racing on one key serialize there
//! and exactly one of them wins.
//!
//! The backend is shared by cloning the `Arc` that wraps it; each clone
//! behaves like another process talking to the same remote store.
//!
//! # Fault injection
//!
//! Tests can make the next N reads or writes fail transiently, take the
//! whole backend offline, or slow every write down to widen race windows.

use async_trait::async_trait;
use dashmap::DashMap;
use datakeep_core::{KeyInfo, Timestamp, Version, VersionInfo};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::backend::{
    Backend, BackendKey, SortOrder, StoredEntry, VersionPage, VersionQuery, WriteRequest,
};
use crate::error::{StorageError, StorageResult};

type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// All revisions of one key, oldest first.
#[derive(Debug, Clone, Default)]
pub struct RevisionChain {
    revisions: Vec<StoredEntry>,
}

impl RevisionChain {
    pub fn latest(&self) -> Option<&StoredEntry> {
        self.revisions.last()
    }

    pub fn find(&self, version: &Version) -> Option<&StoredEntry> {
        self.revisions
            .iter()
            .find(|entry| &entry.key_info.version == version)
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    fn push(&mut self, entry: StoredEntry) {
        self.revisions.push(entry);
    }

    fn infos(&self) -> impl DoubleEndedIterator<Item = VersionInfo> + '_ {
        self.revisions
            .iter()
            .map(|e| VersionInfo::new(e.key_info.version.clone(), e.key_info.updated_time))
    }
}

#[derive(Default)]
struct FaultPlan {
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
    offline: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl FaultPlan {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_read(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable("backend offline".into()));
        }
        if Self::take(&self.failing_reads) {
            return Err(StorageError::Transient("injected read failure".into()));
        }
        Ok(())
    }

    fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms.load(Ordering::Acquire))
    }

    fn check_write(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable("backend offline".into()));
        }
        if Self::take(&self.failing_writes) {
            return Err(StorageError::Transient("injected write failure".into()));
        }
        Ok(())
    }
}

/// Process-local stand-in for the remote key-value store.
pub struct MemoryBackend {
    chains: DashMap<BackendKey, RevisionChain>,
    next_revision: AtomicU64,
    writes: AtomicU64,
    faults: FaultPlan,
    clock: Clock,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Timestamp::now))
    }

    /// Backend whose write timestamps come from `clock`.
    pub fn with_clock(clock: Arc<dyn Fn() -> Timestamp + Send + Sync>) -> Self {
        MemoryBackend {
            chains: DashMap::new(),
            next_revision: AtomicU64::new(1),
            writes: AtomicU64::new(0),
            faults: FaultPlan::default(),
            clock,
        }
    }

    /// Shared handle, the usual way to hand one backend to several stores.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `n` reads fail with a transient error.
    pub fn fail_next_reads(&self, n: u32) {
        self.faults.failing_reads.store(n, Ordering::Release);
    }

    /// Make the next `n` writes fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.faults.failing_writes.store(n, Ordering::Release);
    }

    /// Take the backend offline (every call fails) or back online.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::Release);
    }

    /// Hold every write for `delay` before its revision check.
    /// `Duration::ZERO` turns the delay off.
    pub fn set_write_delay(&self, delay: Duration) {
        self.faults
            .write_delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    /// Number of successful writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    /// Number of stored revisions of `key`.
    pub fn revision_count(&self, key: &BackendKey) -> usize {
        self.chains.get(key).map(|c| c.len()).unwrap_or(0)
    }

    fn allocate_version(&self) -> Version {
        let n = self.next_revision.fetch_add(1, Ordering::AcqRel);
        Version::new(format!("{:020}", n))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &BackendKey) -> StorageResult<Option<StoredEntry>> {
        self.faults.check_read()?;
        Ok(self.chains.get(key).and_then(|c| c.latest().cloned()))
    }

    async fn get_version(
        &self,
        key: &BackendKey,
        version: &Version,
    ) -> StorageResult<Option<StoredEntry>> {
        self.faults.check_read()?;
        Ok(self.chains.get(key).and_then(|c| c.find(version).cloned()))
    }

    async fn compare_and_swap(
        &self,
        key: &BackendKey,
        expected: Option<&Version>,
        request: WriteRequest,
    ) -> StorageResult<KeyInfo> {
        self.faults.check_write()?;
        let delay = self.faults.write_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        // The entry guard holds the shard lock across check and append.
        let mut chain = self.chains.entry(key.clone()).or_default();
        let current = chain.latest().map(|e| &e.key_info);
        let actual = current.map(|info| &info.version);
        if actual != expected {
            return Err(StorageError::Conflict {
                expected: expected.cloned(),
                actual: actual.cloned(),
            });
        }

        // Write times never go backwards within one key.
        let now = (self.clock)();
        let updated_time = current.map_or(now, |info| now.max(info.updated_time));
        let created_time = current.map_or(updated_time, |info| info.created_time);
        let key_info = KeyInfo::new(self.allocate_version(), created_time, updated_time)
            .with_user_ids(request.user_ids);

        chain.push(StoredEntry {
            value: request.value,
            key_info: key_info.clone(),
        });
        self.writes.fetch_add(1, Ordering::AcqRel);
        trace!(target: "datakeep::backend", key = %key, version = %key_info.version, "Revision written");
        Ok(key_info)
    }

    async fn list_versions(
        &self,
        key: &BackendKey,
        query: &VersionQuery,
    ) -> StorageResult<VersionPage> {
        self.faults.check_read()?;
        if query.page_size == 0 {
            return Ok(VersionPage::default());
        }
        let Some(chain) = self.chains.get(key) else {
            return Ok(VersionPage::default());
        };

        let in_window = |info: &VersionInfo| info.within(query.min_date, query.max_date);
        let ordered: Vec<VersionInfo> = match query.order {
            SortOrder::Ascending => chain.infos().filter(in_window).collect(),
            SortOrder::Descending => chain.infos().rev().filter(in_window).collect(),
        };

        let start = match &query.cursor {
            None => 0,
            Some(cursor) => {
                ordered
                    .iter()
                    .position(|info| info.version.as_str() == cursor)
                    .ok_or_else(|| StorageError::InvalidCursor(cursor.clone()))?
                    + 1
            }
        };
        let end = (start + query.page_size).min(ordered.len());
        let versions = ordered[start.min(end)..end].to_vec();
        let cursor = if end < ordered.len() {
            versions.last().map(|info| info.version.as_str().to_string())
        } else {
            None
        };
        Ok(VersionPage { versions, cursor })
    }
}
