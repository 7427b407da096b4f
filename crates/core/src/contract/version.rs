//! Backend-assigned revision identifiers
//!
//! Every successful write to a key produces a new `Version`. Callers treat
//! versions as opaque tokens: they are only ever compared for equality, or
//! handed back to the backend to fetch a historical revision. Ordering
//! between revisions of one key comes from [`VersionInfo::created`], never
//! from the token text.

use super::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of one historical write of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(id: impl Into<String>) -> Self {
        Version(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Version(s.to_string())
    }
}

impl From<String> for Version {
    fn from(s: String) -> Self {
        Version(s)
    }
}

/// One entry of a key's revision listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Revision token
    pub version: Version,
    /// When the revision was written
    pub created: Timestamp,
}

impl VersionInfo {
    pub fn new(version: Version, created: Timestamp) -> Self {
        VersionInfo { version, created }
    }

    /// True if `created` falls inside the inclusive `[min, max]` window.
    /// An absent bound is open.
    pub fn within(&self, min: Option<Timestamp>, max: Option<Timestamp>) -> bool {
        min.map_or(true, |min| self.created >= min) && max.map_or(true, |max| self.created <= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_opaque_string() {
        let v = Version::new("00000000000000000007");
        assert_eq!(v.as_str(), "00000000000000000007");
        assert_eq!(v.to_string(), "00000000000000000007");
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"00000000000000000007\"");
    }

    #[test]
    fn test_window_bounds_are_inclusive() {
        let info = VersionInfo::new(Version::from("a"), Timestamp::from_millis(100));
        assert!(info.within(None, None));
        assert!(info.within(Some(Timestamp::from_millis(100)), Some(Timestamp::from_millis(100))));
        assert!(!info.within(Some(Timestamp::from_millis(101)), None));
        assert!(!info.within(None, Some(Timestamp::from_millis(99))));
    }
}
