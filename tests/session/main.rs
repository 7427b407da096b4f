//! Session locking across processes sharing one backend.

#[path = "../common/mod.rs"]
mod common;

use common::{fast_config, players, players_with, template, Player};
use datakeep::{
    missing_fields, reconcile, ActiveSession, ConflictHandler, KeepConfig, KeepError, KeepState,
    MemoryBackend, UnreleasedAction,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn ignore() -> ConflictHandler {
    Arc::new(|_: &ActiveSession| UnreleasedAction::Ignore)
}

#[tokio::test]
async fn test_second_process_blocked_until_release() {
    let backend = MemoryBackend::shared();
    let a = players(&backend, "server-a");
    let b = players(&backend, "server-b");

    let keep = a.load_keep("player_1", None).await.unwrap();
    keep.update(|p| p.coins = 100).unwrap();
    keep.save().await.unwrap();

    match b.load_keep("player_1", None).await {
        Err(KeepError::SessionLocked { holder }) => assert_eq!(&holder, a.session()),
        other => panic!("expected SessionLocked, got {:?}", other.map(|k| k.data())),
    }

    keep.release().await.unwrap();
    assert_eq!(keep.state(), KeepState::Released);

    let keep_b = b.load_keep("player_1", None).await.unwrap();
    assert_eq!(keep_b.data(), Player { coins: 100, level: 1 });
    keep_b.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_single_owner() {
    let backend = MemoryBackend::shared();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = players(&backend, &format!("server-{}", i));
        tasks.push(tokio::spawn(async move {
            let loaded = store.load_keep("contested", None).await;
            loaded.map(|keep| keep.metadata().active_session)
        }));
    }

    let mut owners = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(holder) => owners.push(holder),
            Err(e) => assert!(matches!(e, KeepError::SessionLocked { .. }), "{}", e),
        }
    }
    assert_eq!(owners.len(), 1);

    let viewer = players(&backend, "observer");
    let view = viewer.view_keep("contested", None).await.unwrap().unwrap();
    assert_eq!(view.metadata().active_session, owners[0]);
}

#[tokio::test]
async fn test_loaded_keep_is_shared_within_process() {
    let backend = MemoryBackend::shared();
    let store = players(&backend, "server-a");
    let first = store.load_keep("p", None).await.unwrap();
    let second = store.load_keep("p", None).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    first.release().await.unwrap();
    assert!(store.loaded_keep("p").is_none());
}

#[tokio::test]
async fn test_stale_session_reclaimed() {
    let backend = MemoryBackend::shared();
    let config = KeepConfig {
        session_stale_after_ms: 30,
        ..fast_config()
    };
    let a = players_with(&backend, "crashed", config.clone());
    let b = players_with(&backend, "fresh", config);

    let abandoned = a.load_keep("p", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let asked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&asked);
    let handler: ConflictHandler = Arc::new(move |_: &ActiveSession| {
        counter.fetch_add(1, Ordering::SeqCst);
        UnreleasedAction::Cancel
    });
    let keep = b.load_keep("p", Some(handler)).await.unwrap();
    assert_eq!(asked.load(Ordering::SeqCst), 0);
    assert!(keep.is_active());

    let err = abandoned.save().await.unwrap_err();
    assert!(matches!(err, KeepError::SessionLost { .. }));
    assert_eq!(abandoned.state(), KeepState::Released);
}

#[tokio::test]
async fn test_forced_takeover_loses_old_session() {
    let backend = MemoryBackend::shared();
    let a = players(&backend, "server-a");
    let b = players(&backend, "server-b");

    let old = a.load_keep("p", None).await.unwrap();
    old.update(|p| p.level = 3).unwrap();
    old.save().await.unwrap();

    let taker = b.load_keep("p", Some(ignore())).await.unwrap();
    assert_eq!(taker.data().level, 3);
    assert_eq!(taker.metadata().force_load.as_ref(), Some(b.session()));

    match old.save().await {
        Err(KeepError::SessionLost { holder }) => assert_eq!(holder.as_ref(), Some(b.session())),
        other => panic!("expected SessionLost, got {:?}", other),
    }
    assert_eq!(old.state(), KeepState::Released);
    // Releasing a keep that already lost its session writes nothing.
    old.release().await.unwrap();

    taker.save().await.unwrap();
    assert!(taker.metadata().force_load.is_none());
}

#[tokio::test]
async fn test_forced_takeover_can_be_disabled() {
    let backend = MemoryBackend::shared();
    let config = KeepConfig {
        allow_forced_takeover: false,
        ..fast_config()
    };
    let a = players_with(&backend, "server-a", config.clone());
    let b = players_with(&backend, "server-b", config);
    let _held = a.load_keep("p", None).await.unwrap();
    assert!(matches!(
        b.load_keep("p", Some(ignore())).await,
        Err(KeepError::SessionLocked { .. })
    ));
}

#[tokio::test]
async fn test_overwrite_reclaims_lost_key() {
    let backend = MemoryBackend::shared();
    let a = players(&backend, "server-a");
    let b = players(&backend, "server-b");

    let old = a.load_keep("p", None).await.unwrap();
    let taker = b.load_keep("p", Some(ignore())).await.unwrap();
    old.update(|p| p.coins = 7).unwrap();
    old.overwrite().await.unwrap();
    assert!(old.is_active());

    assert!(matches!(
        taker.save().await,
        Err(KeepError::SessionLost { .. })
    ));
    let view = players(&backend, "observer")
        .view_keep("p", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.data().coins, 7);
    assert_eq!(view.metadata().active_session.as_ref(), Some(a.session()));
}

#[tokio::test]
async fn test_hooks_applied_once_per_direction() {
    let backend = MemoryBackend::shared();
    let saves = Arc::new(AtomicUsize::new(0));
    let loads = Arc::new(AtomicUsize::new(0));

    let install = |store: &datakeep::Store<Player>| {
        let saves = Arc::clone(&saves);
        store.pre_save(move |mut doc: Value| {
            saves.fetch_add(1, Ordering::SeqCst);
            let coins = doc["coins"].as_u64().unwrap_or(0);
            doc["coins"] = json!(format!("c{}", coins));
            Ok(doc)
        });
        let loads = Arc::clone(&loads);
        store.pre_load(move |mut doc: Value| {
            loads.fetch_add(1, Ordering::SeqCst);
            let encoded = doc["coins"].as_str().ok_or("coins not encoded")?.to_string();
            let coins: u64 = encoded
                .trim_start_matches('c')
                .parse()
                .map_err(|e| format!("{}", e))?;
            doc["coins"] = json!(coins);
            Ok(doc)
        });
    };

    let a = players(&backend, "server-a");
    install(&a);
    let keep = a.load_keep("p", None).await.unwrap();
    // A fresh key starts from the template; PreLoad is not involved.
    assert_eq!(loads.load(Ordering::SeqCst), 0);
    assert_eq!(keep.data(), template());
    keep.update(|p| p.coins = 42).unwrap();
    keep.release().await.unwrap();
    assert_eq!(saves.load(Ordering::SeqCst), 1);

    let raw = players(&backend, "raw");
    assert!(matches!(
        raw.view_keep("p", None).await,
        Err(KeepError::Serialization(_))
    ));

    let b = players(&backend, "server-b");
    install(&b);
    let keep = b.load_keep("p", None).await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(keep.data().coins, 42);
}

#[tokio::test]
async fn test_rejected_document_gives_session_back() {
    let backend = MemoryBackend::shared();
    let a = players(&backend, "server-a");
    let keep = a.load_keep("p", None).await.unwrap();
    keep.update(|p| p.level = 99).unwrap();
    keep.release().await.unwrap();

    let strict = players(&backend, "strict");
    strict.set_validator(|p: &Player| {
        if p.level > 50 {
            Err(format!("level {} out of range", p.level))
        } else {
            Ok(())
        }
    });
    assert!(matches!(
        strict.load_keep("p", None).await,
        Err(KeepError::Validation { .. })
    ));

    // Nobody holds the key afterwards.
    let b = players(&backend, "server-b");
    let handler: ConflictHandler = Arc::new(|_: &ActiveSession| -> UnreleasedAction {
        panic!("key should be free")
    });
    b.load_keep("p", Some(handler)).await.unwrap();
}

#[tokio::test]
async fn test_critical_state_latch() {
    let backend = MemoryBackend::shared();
    let config = KeepConfig {
        max_write_attempts: 2,
        critical_failure_threshold: 2,
        ..fast_config()
    };
    let store = players_with(&backend, "server-a", config);
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&transitions);
    let _sub = store
        .critical_state_signal()
        .connect(move |critical: &bool| sink.lock().push(*critical));
    let issues = Arc::new(AtomicUsize::new(0));
    let issue_count = Arc::clone(&issues);
    let _issues = store.issue_signal().connect(move |_: &String| {
        issue_count.fetch_add(1, Ordering::SeqCst);
    });

    let keep = store.load_keep("p", None).await.unwrap();
    backend.set_offline(true);
    let err = keep.save().await.unwrap_err();
    assert!(err.is_backend_failure(), "{}", err);
    assert!(keep.is_active());
    assert!(store.is_critical());
    assert!(issues.load(Ordering::SeqCst) >= 2);

    assert!(matches!(
        store.load_keep("other", None).await,
        Err(KeepError::BackendUnavailable(_))
    ));

    backend.set_offline(false);
    keep.save().await.unwrap();
    assert!(!store.is_critical());
    assert_eq!(*transitions.lock(), vec![true, false]);
}

#[tokio::test]
async fn test_view_keep_is_read_only() {
    let backend = MemoryBackend::shared();
    let store = players(&backend, "server-a");
    assert!(store.view_keep("nobody", None).await.unwrap().is_none());

    let keep = store.load_keep("p", None).await.unwrap();
    keep.update(|p| p.coins = 5).unwrap();
    keep.save().await.unwrap();
    let writes = backend.write_count();

    let view = players(&backend, "viewer")
        .view_keep("p", None)
        .await
        .unwrap()
        .unwrap();
    assert!(view.is_view_only());
    assert_eq!(view.data().coins, 5);
    assert!(matches!(view.save().await, Err(KeepError::ReadOnly)));
    view.release().await.unwrap();
    assert_eq!(backend.write_count(), writes);
    assert!(keep.is_active());
}

#[tokio::test]
async fn test_mock_store_is_isolated() {
    let backend = MemoryBackend::shared();
    let store = players(&backend, "server-a");
    let mock = store.mock().unwrap();
    let keep = mock.load_keep("p", None).await.unwrap();
    keep.update(|p| p.coins = 1).unwrap();
    keep.release().await.unwrap();
    assert!(store.view_keep("p", None).await.unwrap().is_none());
}

fn flat_object() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map("[a-e]", any::<i64>(), 0..5)
}

fn to_value(map: &BTreeMap<String, i64>) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), json!(v))).collect::<Map<_, _>>())
}

proptest! {
    #[test]
    fn test_reconcile_keeps_data_and_fills_template(data in flat_object(), template in flat_object()) {
        let data_value = to_value(&data);
        let template_value = to_value(&template);
        let merged = reconcile(&data_value, &template_value);

        for (key, value) in &data {
            prop_assert_eq!(&merged[key.as_str()], &json!(value));
        }
        for (key, value) in &template {
            if !data.contains_key(key) {
                prop_assert_eq!(&merged[key.as_str()], &json!(value));
            }
        }
        prop_assert!(missing_fields(&merged, &template_value).is_empty());
        prop_assert_eq!(reconcile(&merged, &template_value), merged);
    }
}
