//! Structural backfill of template fields
//!
//! `reconcile(data, template)` returns a new document in which every object
//! key present in `template` but absent from `data` has been added, at every
//! depth. Keys already present in `data` are never overwritten, whatever
//! their type or value. Arrays and scalars are leaves: they are taken from
//! `data` as they are.
//!
//! Both inputs are borrowed immutably and the result is built fresh, so a
//! failure part-way through can never leave a half-merged document behind.

use serde_json::{Map, Value};

/// Fill in template keys missing from `data`.
pub fn reconcile(data: &Value, template: &Value) -> Value {
    match (data, template) {
        (Value::Object(data_obj), Value::Object(template_obj)) => {
            let mut merged = Map::with_capacity(data_obj.len().max(template_obj.len()));
            for (key, value) in data_obj {
                let filled = match template_obj.get(key) {
                    Some(template_value) => reconcile(value, template_value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), filled);
            }
            for (key, template_value) in template_obj {
                if !data_obj.contains_key(key) {
                    merged.insert(key.clone(), template_value.clone());
                }
            }
            Value::Object(merged)
        }
        _ => data.clone(),
    }
}

/// Dotted paths of template keys that `data` lacks, outermost first.
///
/// Empty exactly when `reconcile(data, template) == *data`.
pub fn missing_fields(data: &Value, template: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_missing(data, template, String::new(), &mut out);
    out
}

fn collect_missing(data: &Value, template: &Value, prefix: String, out: &mut Vec<String>) {
    let (Value::Object(data_obj), Value::Object(template_obj)) = (data, template) else {
        return;
    };
    for (key, template_value) in template_obj {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match data_obj.get(key) {
            Some(value) => collect_missing(value, template_value, path, out),
            None => out.push(path),
        }
    }
}
