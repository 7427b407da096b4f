//! Retry bookkeeping for read-modify-CAS cycles
//!
//! Transient backend failures are retried with jittered exponential backoff
//! up to `max_write_attempts`. CAS conflicts are retried immediately: each
//! conflict means another writer made progress, so they get their own,
//! much larger bound.

use crate::config::KeepConfig;
use datakeep_core::{KeepError, KeepResult};
use datakeep_storage::{BackendKey, StorageError};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// Conflicting writes tolerated by one CAS cycle.
pub const CONFLICT_RETRY_LIMIT: u32 = 128;

pub(crate) struct RetryState<'a> {
    config: &'a KeepConfig,
    key: &'a BackendKey,
    op: &'static str,
    failures: u32,
    conflicts: u32,
}

impl<'a> RetryState<'a> {
    pub(crate) fn new(config: &'a KeepConfig, key: &'a BackendKey, op: &'static str) -> Self {
        RetryState {
            config,
            key,
            op,
            failures: 0,
            conflicts: 0,
        }
    }

    /// Sleep before the next attempt, or give up with the converted error.
    pub(crate) async fn on_failure(&mut self, e: StorageError) -> KeepResult<()> {
        self.failures += 1;
        if !e.is_transient() || self.failures >= self.config.max_write_attempts {
            warn!(
                target: "datakeep::session",
                key = %self.key,
                op = self.op,
                attempt = self.failures,
                error = %e,
                "Giving up"
            );
            return Err(e.into());
        }
        let delay = jitter(self.config.backoff(self.failures));
        debug!(
            target: "datakeep::session",
            key = %self.key,
            op = self.op,
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "Retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    pub(crate) async fn on_conflict(&mut self) -> KeepResult<()> {
        self.conflicts += 1;
        if self.conflicts > CONFLICT_RETRY_LIMIT {
            return Err(KeepError::backend_write(format!(
                "{} on {} lost {} consecutive races",
                self.op, self.key, self.conflicts
            )));
        }
        debug!(target: "datakeep::session", key = %self.key, op = self.op, conflicts = self.conflicts, "CAS conflict, re-reading");
        tokio::task::yield_now().await;
        Ok(())
    }
}

/// Spread `base` over `[base / 2, base]`.
fn jitter(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    if millis < 2 {
        return base;
    }
    Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
}
