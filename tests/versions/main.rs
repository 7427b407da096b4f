//! Revision history: iteration, paging, time windows and restores.

#[path = "../common/mod.rs"]
mod common;

use common::{fast_config, players_with, Player};
use datakeep::{Keep, KeepConfig, KeepError, MemoryBackend, Timestamp, VersionInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct History {
    backend: Arc<MemoryBackend>,
    clock: Arc<AtomicU64>,
    store: datakeep::Store<Player>,
}

impl History {
    fn new(page_size: usize) -> Self {
        let clock = Arc::new(AtomicU64::new(1_000));
        let source = Arc::clone(&clock);
        let backend = Arc::new(MemoryBackend::with_clock(Arc::new(move || {
            Timestamp::from_millis(source.load(Ordering::SeqCst))
        })));
        let config = KeepConfig {
            version_page_size: page_size,
            ..fast_config()
        };
        let store = players_with(&backend, "server-a", config);
        History {
            backend,
            clock,
            store,
        }
    }

    fn at(&self, millis: u64) {
        self.clock.store(millis, Ordering::SeqCst);
    }

    /// Load at t=1000 and save coins = 1..=saves at t=2000, 3000, ...
    async fn written(&self, saves: u64) -> Arc<Keep<Player>> {
        self.at(1_000);
        let keep = self.store.load_keep("p", None).await.unwrap();
        for i in 1..=saves {
            self.at(1_000 + i * 1_000);
            keep.update(|p| p.coins = i).unwrap();
            keep.save().await.unwrap();
        }
        keep
    }
}

fn times(infos: &[VersionInfo]) -> Vec<u64> {
    infos.iter().map(|v| v.created.as_millis()).collect()
}

#[tokio::test]
async fn test_forward_traversal_is_ascending() {
    let history = History::new(2);
    let keep = history.written(5).await;

    let mut versions = keep.get_versions(None, None);
    let mut seen = Vec::new();
    while let Some(info) = versions.next().await.unwrap() {
        seen.push(info);
    }
    assert_eq!(times(&seen), vec![1_000, 2_000, 3_000, 4_000, 5_000, 6_000]);
    assert!(seen.windows(2).all(|w| w[0].version != w[1].version));

    assert!(versions.next().await.unwrap().is_none());
    assert!(versions.current().is_none());
    let newest = versions.previous().await.unwrap().unwrap();
    assert_eq!(newest.version, keep.key_info().version);
}

#[tokio::test]
async fn test_skip_and_step_backward() {
    let history = History::new(2);
    let keep = history.written(4).await;

    let mut versions = keep.get_versions(None, None);
    let oldest = versions.skip_start().await.unwrap().unwrap();
    assert_eq!(oldest.created.as_millis(), 1_000);
    assert_eq!(versions.current(), Some(oldest));
    assert!(versions.previous().await.unwrap().is_none());

    let newest = versions.skip_end().await.unwrap().unwrap();
    assert_eq!(newest.created.as_millis(), 5_000);
    let before = versions.previous().await.unwrap().unwrap();
    assert_eq!(before.created.as_millis(), 4_000);
}

#[tokio::test]
async fn test_paging_stops_at_edges() {
    let history = History::new(2);
    let keep = history.written(6).await;

    let mut versions = keep.get_versions(None, None);
    assert_eq!(versions.page_size(), 2);
    let first = versions.page_down().await.unwrap().unwrap();
    assert_eq!(first.created.as_millis(), 2_000);
    let second = versions.page_down().await.unwrap().unwrap();
    assert_eq!(second.created.as_millis(), 4_000);
    let third = versions.page_down().await.unwrap().unwrap();
    assert_eq!(third.created.as_millis(), 6_000);
    // Only one revision left: stop on the newest.
    let last = versions.page_down().await.unwrap().unwrap();
    assert_eq!(last.created.as_millis(), 7_000);

    let back = versions.page_up().await.unwrap().unwrap();
    assert_eq!(back.created.as_millis(), 5_000);
    versions.page_up().await.unwrap();
    versions.page_up().await.unwrap();
    let top = versions.page_up().await.unwrap().unwrap();
    assert_eq!(top.created.as_millis(), 1_000);
}

#[tokio::test]
async fn test_time_window_is_inclusive() {
    let history = History::new(2);
    let keep = history.written(6).await;

    let mut versions = keep.get_versions(
        Some(Timestamp::from_millis(3_000)),
        Some(Timestamp::from_millis(5_500)),
    );
    let mut seen = Vec::new();
    while let Some(info) = versions.next().await.unwrap() {
        seen.push(info);
    }
    assert_eq!(times(&seen), vec![3_000, 4_000, 5_000]);

    let mut empty = keep.get_versions(Some(Timestamp::from_millis(90_000)), None);
    assert!(empty.skip_start().await.unwrap().is_none());
    assert!(empty.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_view_historical_version() {
    let history = History::new(10);
    let keep = history.written(3).await;

    let mut versions = keep.get_versions(Some(Timestamp::from_millis(3_000)), None);
    let info = versions.skip_start().await.unwrap().unwrap();
    let old = history
        .store
        .view_keep("p", Some(&info.version))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.data().coins, 2);
    assert_eq!(keep.data().coins, 3);
}

#[tokio::test]
async fn test_set_version_appends_restored_revision() {
    let history = History::new(10);
    let keep = history.written(3).await;
    let revisions = history.backend.revision_count(keep.key());

    let mut versions = keep.get_versions(Some(Timestamp::from_millis(2_000)), None);
    let target = versions.skip_start().await.unwrap().unwrap();
    history.at(9_000);
    let info = keep
        .set_version(&target.version, |mut p| {
            p.level = 9;
            p
        })
        .await
        .unwrap();

    assert_eq!(keep.data(), Player { coins: 1, level: 9 });
    assert_eq!(history.backend.revision_count(keep.key()), revisions + 1);
    assert_eq!(keep.key_info().version, info.version);

    let view = history.store.view_keep("p", None).await.unwrap().unwrap();
    assert_eq!(view.data(), Player { coins: 1, level: 9 });
}

#[tokio::test]
async fn test_set_version_unknown_leaves_document() {
    let history = History::new(10);
    let keep = history.written(2).await;
    let missing = datakeep::Version::new("no-such-revision");
    assert!(matches!(
        keep.set_version(&missing, |p| p).await,
        Err(KeepError::InvalidInput(_))
    ));
    assert_eq!(keep.data().coins, 2);
}
