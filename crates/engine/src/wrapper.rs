//! Path-level helpers over a loaded document
//!
//! `mutate` applies a pure transform to one nested field of a keep's
//! document and announces the change on the keep's `data_changed` signal.
//! `on_data_changed` watches a path and is called whenever a change at,
//! above or below it is announced. Neither touches the backend; changes are
//! persisted by the keep's next write.

use datakeep_core::{DocPath, KeepError, KeepResult, Subscription};
use serde_json::Value;
use std::sync::{Arc, Weak};

use crate::keep::Keep;
use crate::store::Document;

fn parse(path: &str) -> KeepResult<DocPath> {
    path.parse::<DocPath>()
        .map_err(|e| KeepError::invalid_input(format!("bad path '{}': {}", path, e)))
}

/// Replace the value at `path` with `processor(current)` and return it.
///
/// A missing field is handed to `processor` as `null`. Missing intermediate
/// objects are created; arrays are never grown.
///
/// # Errors
///
/// `InvalidInput` for a malformed path or one that crosses a non-container,
/// `Serialization` if the result no longer fits the document type,
/// `Released` if the keep was released.
pub fn mutate<T: Document>(
    keep: &Keep<T>,
    path: &str,
    processor: impl FnOnce(Value) -> Value,
) -> KeepResult<Value> {
    let doc_path = parse(path)?;
    keep.apply_at(&doc_path, |document| {
        let current = doc_path.get(document).cloned().unwrap_or(Value::Null);
        let next = processor(current);
        doc_path
            .set(document, next.clone())
            .map_err(|e| KeepError::invalid_input(e.to_string()))?;
        Ok(next)
    })
}

/// Current value at `path`, if present.
pub fn get<T: Document>(keep: &Keep<T>, path: &str) -> KeepResult<Option<Value>> {
    let doc_path = parse(path)?;
    keep.read(|data| -> KeepResult<Option<Value>> {
        let document = serde_json::to_value(data)?;
        Ok(doc_path.get(&document).cloned())
    })
}

/// Call `callback` with the new value at `path` after every change that can
/// affect it. A missing field is reported as `null`.
pub fn on_data_changed<T: Document>(
    keep: &Arc<Keep<T>>,
    path: &str,
    callback: impl Fn(&Value) + Send + Sync + 'static,
) -> KeepResult<Subscription> {
    let watched = parse(path)?;
    let weak: Weak<Keep<T>> = Arc::downgrade(keep);
    Ok(keep.data_changed().connect(move |written: &DocPath| {
        if !watched.is_affected_by(written) {
            return;
        }
        let Some(keep) = weak.upgrade() else { return };
        let value = keep.read(|data| {
            serde_json::to_value(data)
                .ok()
                .and_then(|document| watched.get(&document).cloned())
        });
        callback(&value.unwrap_or(Value::Null));
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeepConfig;
    use crate::store::{Store, StoreInfo};
    use datakeep_core::ActiveSession;
    use datakeep_storage::MemoryBackend;
    use parking_lot::Mutex;
    use serde_json::json;

    async fn keep() -> (Arc<MemoryBackend>, Arc<Keep<Value>>) {
        let backend = MemoryBackend::shared();
        let store = Store::new(
            StoreInfo::new("players"),
            json!({"stats": {"hp": 10}, "inventory": ["sword"]}),
            backend.clone(),
            ActiveSession::new(1, "a"),
            Arc::new(KeepConfig {
                autosave_interval_ms: 0,
                ..KeepConfig::default()
            }),
        )
        .unwrap();
        let keep = store.load_keep("p1", None).await.unwrap();
        (backend, keep)
    }

    #[tokio::test]
    async fn test_mutate_nested_field() {
        let (backend, keep) = keep().await;
        let writes = backend.write_count();
        let hp = mutate(&keep, "stats.hp", |v| json!(v.as_i64().unwrap_or(0) + 5)).unwrap();
        assert_eq!(hp, json!(15));
        assert_eq!(get(&keep, "stats.hp").unwrap(), Some(json!(15)));
        assert_eq!(backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_mutate_missing_field_starts_from_null() {
        let (_backend, keep) = keep().await;
        mutate(&keep, "stats.mana", |v| {
            assert!(v.is_null());
            json!(3)
        })
        .unwrap();
        assert_eq!(keep.data()["stats"]["mana"], json!(3));
    }

    #[tokio::test]
    async fn test_mutate_rejects_bad_paths() {
        let (_backend, keep) = keep().await;
        assert!(matches!(
            mutate(&keep, "inventory[5]", |v| v),
            Err(KeepError::InvalidInput(_))
        ));
        assert!(matches!(
            mutate(&keep, "stats..hp", |v| v),
            Err(KeepError::InvalidInput(_))
        ));
        assert_eq!(keep.data()["inventory"], json!(["sword"]));
    }

    #[tokio::test]
    async fn test_on_data_changed_filters_by_path() {
        let (_backend, keep) = keep().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = on_data_changed(&keep, "stats", move |v| sink.lock().push(v.clone())).unwrap();

        mutate(&keep, "stats.hp", |_| json!(1)).unwrap();
        mutate(&keep, "inventory[0]", |_| json!("axe")).unwrap();
        keep.update(|doc| doc["stats"]["hp"] = json!(2)).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![json!({"hp": 1}), json!({"hp": 2})]
        );

        drop(sub);
        mutate(&keep, "stats.hp", |_| json!(3)).unwrap();
        assert_eq!(seen.lock().len(), 2);
    }
}
