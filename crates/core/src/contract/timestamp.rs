//! Millisecond wall-clock timestamps
//!
//! Session liveness is judged by comparing a stored `LastUpdate` against the
//! local clock of whichever process is trying to acquire the key, so all
//! processes must agree on one representation: milliseconds since the Unix
//! epoch, stored as a plain integer in the persisted record.
//!
//! ```
//! use datakeep_core::Timestamp;
//!
//! let created = Timestamp::from_secs(1_000);
//! assert_eq!(created.as_millis(), 1_000_000);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since Unix epoch.
///
/// Serialized transparently as an integer so the persisted layout stays
/// readable by other clients of the same backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Unix epoch
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Maximum representable timestamp
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Current wall-clock time.
    ///
    /// Returns the epoch if the system clock is set before 1970.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as u64)
    }

    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1_000))
    }

    #[inline]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1_000
    }

    /// Duration since an earlier timestamp, `None` if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_millis)
    }

    /// Time elapsed between this timestamp and `now`.
    ///
    /// A timestamp in the future (clock skew between processes) counts as
    /// zero elapsed time rather than an error.
    pub fn elapsed_at(&self, now: Timestamp) -> Duration {
        now.duration_since(*self).unwrap_or_default()
    }

    /// True if more than `age` has passed between this timestamp and `now`.
    pub fn is_older_than(&self, age: Duration, now: Timestamp) -> bool {
        self.elapsed_at(now) > age
    }

    /// Saturates at `Timestamp::MAX`.
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_millis() as u64))
    }

    /// Saturates at `Timestamp::EPOCH`.
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration.as_millis() as u64))
    }

    /// Convert to a chrono UTC datetime, `None` past chrono's range.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(i64::try_from(self.0).ok()?)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::EPOCH
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Timestamp::from_millis(millis)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}
