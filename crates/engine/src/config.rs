//! Keep configuration via `datakeep.toml`
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. Durations are plain millisecond integers.

use datakeep_core::{KeepError, KeepResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Conventional config file name.
pub const CONFIG_FILE_NAME: &str = "datakeep.toml";

/// Tunables shared by every store of one registry.
///
/// # Example
///
/// ```toml
/// autosave_interval_ms = 30000
/// session_stale_after_ms = 1800000
/// allow_forced_takeover = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepConfig {
    /// Period of the background autosave task; 0 disables autosave.
    #[serde(default = "default_autosave_interval_ms")]
    pub autosave_interval_ms: u64,
    /// Age of `LastUpdate` after which a foreign session may be reclaimed.
    #[serde(default = "default_session_stale_after_ms")]
    pub session_stale_after_ms: u64,
    /// Revisions fetched per backend listing call.
    #[serde(default = "default_version_page_size")]
    pub version_page_size: usize,
    /// Attempts of one CAS cycle before giving up.
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    /// Initial backoff after a transient failure.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Upper bound of the exponential backoff.
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// Consecutive backend failures that latch a store into critical state.
    #[serde(default = "default_critical_failure_threshold")]
    pub critical_failure_threshold: u32,
    /// Whether an `Ignore` conflict outcome may take over a fresh session.
    #[serde(default = "default_allow_forced_takeover")]
    pub allow_forced_takeover: bool,
}

fn default_autosave_interval_ms() -> u64 {
    30_000
}

fn default_session_stale_after_ms() -> u64 {
    1_800_000
}

fn default_version_page_size() -> usize {
    25
}

fn default_max_write_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_retry_backoff_max_ms() -> u64 {
    2_000
}

fn default_critical_failure_threshold() -> u32 {
    5
}

fn default_allow_forced_takeover() -> bool {
    true
}

impl Default for KeepConfig {
    fn default() -> Self {
        Self {
            autosave_interval_ms: default_autosave_interval_ms(),
            session_stale_after_ms: default_session_stale_after_ms(),
            version_page_size: default_version_page_size(),
            max_write_attempts: default_max_write_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            critical_failure_threshold: default_critical_failure_threshold(),
            allow_forced_takeover: default_allow_forced_takeover(),
        }
    }
}

impl KeepConfig {
    /// `None` when autosave is disabled.
    pub fn autosave_interval(&self) -> Option<Duration> {
        (self.autosave_interval_ms > 0).then(|| Duration::from_millis(self.autosave_interval_ms))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.session_stale_after_ms)
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let millis = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(millis)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if autosave would not renew the session before it goes
    /// stale, or if the page size or attempt count is zero.
    pub fn validate(&self) -> KeepResult<()> {
        if self.autosave_interval_ms >= self.session_stale_after_ms {
            return Err(KeepError::invalid_input(format!(
                "autosave_interval_ms ({}) must be shorter than session_stale_after_ms ({})",
                self.autosave_interval_ms, self.session_stale_after_ms
            )));
        }
        if self.version_page_size == 0 {
            return Err(KeepError::invalid_input("version_page_size must be > 0"));
        }
        if self.max_write_attempts == 0 {
            return Err(KeepError::invalid_input("max_write_attempts must be > 0"));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# DataKeep configuration
#
# Background autosave period in milliseconds. 0 disables autosave.
# Must be shorter than session_stale_after_ms so autosave keeps the
# session fresh.
autosave_interval_ms = 30000

# A session whose last write is older than this may be reclaimed by
# another process without asking.
session_stale_after_ms = 1800000

# Revisions fetched per page by version iterators.
version_page_size = 25

# Compare-and-swap retry policy.
max_write_attempts = 5
retry_backoff_ms = 100
retry_backoff_max_ms = 2000

# Consecutive backend failures before a store enters critical state.
critical_failure_threshold = 5

# Honour "Ignore" conflict outcomes against a fresh foreign session.
allow_forced_takeover = true
"#
    }

    /// Parse and validate config text.
    pub fn from_toml_str(content: &str) -> KeepResult<Self> {
        let config: KeepConfig = toml::from_str(content)
            .map_err(|e| KeepError::invalid_input(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> KeepResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KeepError::invalid_input(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            KeepError::InvalidInput(msg) => {
                KeepError::InvalidInput(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> KeepResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                KeepError::invalid_input(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}
