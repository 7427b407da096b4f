//! Shared helpers for the integration suites.
//!
//! Each "process" is a `Store` with its own session over one shared
//! `MemoryBackend`, which is how several servers see the same key.
//! Import via `#[path = "../common/mod.rs"] mod common;`.

#![allow(dead_code)]

use datakeep::{ActiveSession, KeepConfig, MemoryBackend, Store, StoreInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub coins: u64,
    pub level: u32,
}

/// What a key with no stored document starts as.
pub fn template() -> Player {
    Player { coins: 0, level: 1 }
}

/// Config without autosave and with tight retry backoff.
pub fn fast_config() -> KeepConfig {
    KeepConfig {
        autosave_interval_ms: 0,
        retry_backoff_ms: 1,
        retry_backoff_max_ms: 5,
        ..KeepConfig::default()
    }
}

pub fn players(backend: &Arc<MemoryBackend>, job: &str) -> Store<Player> {
    players_with(backend, job, fast_config())
}

pub fn players_with(backend: &Arc<MemoryBackend>, job: &str, config: KeepConfig) -> Store<Player> {
    Store::new(
        StoreInfo::new("players"),
        template(),
        backend.clone(),
        ActiveSession::new(1, job),
        Arc::new(config),
    )
    .expect("valid test config")
}
