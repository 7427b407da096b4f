//! Session claims and document metadata
//!
//! A session is the claim one process instance holds over a key. The claim
//! lives inside the persisted record itself (`MetaData::active_session`), so
//! ownership is decided entirely by compare-and-swap on the record, never by
//! anything held in memory.

use super::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of one running process instance: `{PlaceID, JobID}`.
///
/// `place_id` names the deployment (every process of one service shares
/// it), `job_id` names the individual process. Two sessions are the same
/// holder only if both parts match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveSession {
    #[serde(rename = "PlaceID")]
    pub place_id: u64,
    #[serde(rename = "JobID")]
    pub job_id: String,
}

impl ActiveSession {
    pub fn new(place_id: u64, job_id: impl Into<String>) -> Self {
        ActiveSession {
            place_id,
            job_id: job_id.into(),
        }
    }

    /// Mint a session for a freshly started process of `place_id`.
    pub fn generate(place_id: u64) -> Self {
        ActiveSession {
            place_id,
            job_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.place_id, self.job_id)
    }
}

/// Per-document session bookkeeping, persisted next to the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetaData {
    /// Process currently holding the lock, if any
    #[serde(default)]
    pub active_session: Option<ActiveSession>,
    /// Process that most recently forced a takeover, until it first writes
    #[serde(default)]
    pub force_load: Option<ActiveSession>,
    /// Last write by the holder; doubles as the liveness heartbeat
    pub last_update: Timestamp,
    /// First write of the document
    pub created: Timestamp,
    /// Number of successful session acquisitions
    pub load_count: u64,
}

impl MetaData {
    /// Metadata for a document that has never been loaded.
    pub fn new(now: Timestamp) -> Self {
        MetaData {
            active_session: None,
            force_load: None,
            last_update: now,
            created: now,
            load_count: 0,
        }
    }

    /// True if `session` holds the lock according to this metadata.
    pub fn is_held_by(&self, session: &ActiveSession) -> bool {
        self.active_session.as_ref() == Some(session)
    }

    /// A session is stale once `last_update` is older than `stale_after`.
    ///
    /// Metadata without an active session is never stale; there is nothing
    /// to reclaim.
    pub fn is_stale(&self, stale_after: Duration, now: Timestamp) -> bool {
        self.active_session.is_some() && self.last_update.is_older_than(stale_after, now)
    }

    /// The foreign holder that blocks `session` from acquiring, if any.
    ///
    /// Returns `None` when the key is unowned, owned by `session` itself,
    /// or owned by a stale session.
    pub fn blocking_holder(
        &self,
        session: &ActiveSession,
        stale_after: Duration,
        now: Timestamp,
    ) -> Option<&ActiveSession> {
        match &self.active_session {
            Some(holder) if holder != session && !self.is_stale(stale_after, now) => Some(holder),
            _ => None,
        }
    }
}
