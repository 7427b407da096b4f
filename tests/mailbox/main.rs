//! Global-update mailbox: posting from other processes, processing at the
//! owner, and the locked/active partition rules.

#[path = "../common/mod.rs"]
mod common;

use common::players;
use datakeep::{GlobalId, GlobalUpdate, KeepError, MemoryBackend, UpdateAction};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

async fn post_gift(store: &datakeep::Store<common::Player>, key: &str, coins: u64) -> GlobalId {
    store
        .post_global_update(key, |editor| {
            Ok(editor.add_global_update(json!({"gift": coins})))
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_update_posted_offline_processed_before_load_returns() {
    let backend = MemoryBackend::shared();
    let sender = players(&backend, "sender");
    let id = post_gift(&sender, "p", 50).await;
    assert_eq!(id, 1);

    let owner = players(&backend, "owner");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    owner.set_global_state_processor(move |update: &GlobalUpdate| {
        sink.lock().push(update.id);
        UpdateAction::Lock
    });

    let keep = owner.load_keep("p", None).await.unwrap();
    assert_eq!(*seen.lock(), vec![id]);
    assert!(keep.get_active_global_updates().is_empty());
    let locked = keep.get_locked_global_updates();
    assert_eq!(locked.len(), 1);
    assert_eq!(locked[0].data, json!({"gift": 50}));

    keep.release().await.unwrap();
    let view = sender.view_keep("p", None).await.unwrap().unwrap();
    assert_eq!(view.get_locked_global_updates()[0].id, id);
}

#[tokio::test]
async fn test_update_posted_while_loaded_arrives_on_save() {
    let backend = MemoryBackend::shared();
    let owner = players(&backend, "owner");
    let sender = players(&backend, "sender");

    let keep = owner.load_keep("p", None).await.unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let _sub = keep
        .on_global_update()
        .connect(move |update: &GlobalUpdate| sink.lock().push(update.data.clone()));

    post_gift(&sender, "p", 10).await;
    assert!(received.lock().is_empty());

    keep.update(|p| p.level = 2).unwrap();
    keep.save().await.unwrap();
    assert_eq!(*received.lock(), vec![json!({"gift": 10})]);

    // The lock decision is written by the next save.
    keep.save().await.unwrap();
    let view = sender.view_keep("p", None).await.unwrap().unwrap();
    assert!(view.get_active_global_updates().is_empty());
    assert_eq!(view.get_locked_global_updates().len(), 1);
    assert_eq!(view.data().level, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_posts_get_distinct_increasing_ids() {
    let backend = MemoryBackend::shared();
    let mut tasks = Vec::new();
    for i in 0..12u64 {
        let store = players(&backend, &format!("sender-{}", i));
        tasks.push(tokio::spawn(async move {
            store
                .post_global_update("p", |editor| Ok(editor.add_global_update(json!(i))))
                .await
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap());
    }
    ids.sort_unstable();
    assert_eq!(ids, (1..=12).collect::<Vec<GlobalId>>());

    let view = players(&backend, "viewer")
        .view_keep("p", None)
        .await
        .unwrap()
        .unwrap();
    let stored: Vec<GlobalId> = view
        .get_active_global_updates()
        .iter()
        .map(|u| u.id)
        .collect();
    assert_eq!(stored, ids);
}

#[tokio::test]
async fn test_ids_never_reused_after_removal() {
    let backend = MemoryBackend::shared();
    let store = players(&backend, "sender");
    let first = post_gift(&store, "p", 1).await;
    store
        .post_global_update("p", |editor| editor.remove_active_update(first))
        .await
        .unwrap();
    let second = post_gift(&store, "p", 2).await;
    assert!(second > first);
}

#[tokio::test]
async fn test_clear_locked_rejects_active_update() {
    let backend = MemoryBackend::shared();
    let store = players(&backend, "owner");
    store.set_global_state_processor(|_: &GlobalUpdate| UpdateAction::Leave);
    let id = post_gift(&store, "p", 5).await;

    let keep = store.load_keep("p", None).await.unwrap();
    assert_eq!(keep.get_active_global_updates().len(), 1);
    assert_eq!(
        keep.clear_locked_update(id),
        Err(KeepError::NotFound { id })
    );
    assert_eq!(
        keep.clear_locked_update(id + 100),
        Err(KeepError::NotFound { id: id + 100 })
    );
}

#[tokio::test]
async fn test_locked_update_is_immutable_to_senders() {
    let backend = MemoryBackend::shared();
    let owner = players(&backend, "owner");
    let sender = players(&backend, "sender");
    let id = post_gift(&sender, "p", 5).await;

    let keep = owner.load_keep("p", None).await.unwrap();
    keep.save().await.unwrap();

    let changed = sender
        .post_global_update("p", |editor| editor.change_active_update(id, json!("x")))
        .await;
    assert_eq!(changed, Err(KeepError::ImmutableUpdate { id }));
    let removed = sender
        .post_global_update("p", |editor| editor.remove_active_update(id))
        .await;
    assert_eq!(removed, Err(KeepError::ImmutableUpdate { id }));
}

#[tokio::test]
async fn test_clear_locked_persists() {
    let backend = MemoryBackend::shared();
    let owner = players(&backend, "owner");
    let id = post_gift(&owner, "p", 5).await;

    let keep = owner.load_keep("p", None).await.unwrap();
    keep.clear_locked_update(id).unwrap();
    assert!(keep.get_locked_global_updates().is_empty());
    keep.release().await.unwrap();

    let view = owner.view_keep("p", None).await.unwrap().unwrap();
    assert!(view.get_locked_global_updates().is_empty());
    assert!(view.get_active_global_updates().is_empty());
}

#[tokio::test]
async fn test_remove_action_discards_silently() {
    let backend = MemoryBackend::shared();
    let owner = players(&backend, "owner");
    owner.set_global_state_processor(|update: &GlobalUpdate| {
        if update.data["gift"].as_u64() == Some(0) {
            UpdateAction::Remove
        } else {
            UpdateAction::Lock
        }
    });
    post_gift(&owner, "p", 0).await;
    let kept = post_gift(&owner, "p", 3).await;

    let keep = owner.load_keep("p", None).await.unwrap();
    assert!(keep.get_active_global_updates().is_empty());
    let locked: Vec<GlobalId> = keep
        .get_locked_global_updates()
        .iter()
        .map(|u| u.id)
        .collect();
    assert_eq!(locked, vec![kept]);
}

#[tokio::test]
async fn test_unchanged_post_writes_nothing() {
    let backend = MemoryBackend::shared();
    let store = players(&backend, "sender");
    post_gift(&store, "p", 1).await;
    let writes = backend.write_count();
    let active = store
        .post_global_update("p", |editor| Ok(editor.get_active_updates().len()))
        .await
        .unwrap();
    assert_eq!(active, 1);
    assert_eq!(backend.write_count(), writes);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_sequential_posts_count_up(gifts in prop::collection::vec(0u64..1000, 1..8)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let backend = MemoryBackend::shared();
            let store = players(&backend, "sender");
            let mut last = 0;
            for gift in &gifts {
                let id = post_gift(&store, "p", *gift).await;
                assert_eq!(id, last + 1);
                last = id;
            }
        });
    }
}
