//! Operations on the JSON tree backing the store.
//!
//! The tree never holds nulls or empty objects: writing null deletes, and a
//! parent left without children disappears with its last child.

use serde_json::{Map, Value};

use super::path::StorePath;

/// Value at `segments`, if any.
pub fn get<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// Replace the value at `segments`. Writing [`Value::Null`] removes it.
pub fn write(node: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = prune(value);
        return;
    };

    // Removing beneath a leaf (or nothing) is a no-op.
    if value.is_null() && !node.is_object() {
        return;
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(head.clone()).or_insert(Value::Null);
        write(child, rest, value);
        if child.is_null() {
            map.remove(head);
        }
    }
    if node.as_object().is_some_and(Map::is_empty) {
        *node = Value::Null;
    }
}

/// Drop nulls and empty objects, recursively. Returns null if nothing is left.
pub fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if pruned.is_empty() {
                Value::Null
            } else {
                Value::Object(pruned)
            }
        }
        other => other,
    }
}

/// Collect every non-object leaf beneath `path` as `(leaf path, value)`.
pub fn flatten(path: &StorePath, value: &Value, out: &mut Vec<(StorePath, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten(&path.child(key), child, out);
            }
        }
        Value::Null => {}
        leaf => out.push((path.clone(), leaf.clone())),
    }
}
