//! Periodic background save of an active keep
//!
//! One tokio task per keep. The task only holds a `Weak` reference, so it
//! never keeps a keep alive, and it exits when:
//! - the stop signal is sent (release),
//! - the handle is dropped together with its keep,
//! - the keep is no longer active, or its session was lost.
//!
//! Saves go through the keep's write gate like any explicit `save()`, so a
//! tick that fires while a save is in flight waits for it.

use datakeep_core::KeepError;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::keep::Keep;
use crate::store::Document;

pub(crate) struct AutosaveHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AutosaveHandle {
    /// Ask the task to exit after its current save, if any.
    pub(crate) fn stop(self) {
        let _ = self.stop.send(true);
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

pub(crate) fn spawn<T: Document>(keep: &Arc<Keep<T>>, interval: Duration) -> AutosaveHandle {
    let (stop, mut stopped) = watch::channel(false);
    let weak: Weak<Keep<T>> = Arc::downgrade(keep);
    let id = keep.identify();

    let task = tokio::spawn(async move {
        debug!(target: "datakeep::autosave", key = %id, interval_ms = interval.as_millis() as u64, "Autosave started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let Some(keep) = weak.upgrade() else { break };
            if !keep.is_active() {
                break;
            }
            match keep.save().await {
                Ok(info) => {
                    debug!(target: "datakeep::autosave", key = %id, version = %info.version, "Autosaved")
                }
                Err(KeepError::Released) | Err(KeepError::SessionLost { .. }) => break,
                Err(e) => {
                    warn!(target: "datakeep::autosave", key = %id, error = %e, "Autosave failed")
                }
            }
        }
        debug!(target: "datakeep::autosave", key = %id, "Autosave stopped");
    });

    AutosaveHandle { stop, task }
}
