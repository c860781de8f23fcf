//! Payload normalization for store writes.
//!
//! Store values must be primitive (string, integer, float, boolean). A nested
//! record is flattened into dotted paths (list items become indexed paths),
//! any non-primitive leaf is replaced by its string form, and the nested shape
//! is rebuilt from the sanitized map.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// Separator between path segments.
pub const SEPARATOR: &str = ".";

/// A record flattened into `path -> leaf` pairs.
///
/// Remembers which paths were lists and whether the record itself was a
/// leaf, so [`unflatten`] rebuilds exactly the original shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flattened {
    pub leaves: Map<String, Value>,
    /// Segment paths of non-empty lists; the empty path is the root.
    lists: BTreeSet<Vec<String>>,
    root_leaf: bool,
}

/// Normalize `value` so every leaf is a primitive.
pub fn normalize(value: &Value) -> Value {
    let mut flat = flatten(value);
    for leaf in flat.leaves.values_mut() {
        if !is_primitive(leaf) {
            *leaf = Value::String(leaf.to_string());
        }
    }
    unflatten(flat)
}

/// Flatten nested objects and arrays into `path -> leaf` pairs.
///
/// Empty objects and arrays are kept as leaves so they are not lost.
pub fn flatten(value: &Value) -> Flattened {
    let mut out = Flattened::default();
    flatten_into(value, &mut Vec::new(), &mut out);
    out
}

fn flatten_into(value: &Value, path: &mut Vec<String>, out: &mut Flattened) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, item) in map {
                path.push(key.clone());
                flatten_into(item, path, out);
                path.pop();
            }
        }
        Value::Array(items) if !items.is_empty() => {
            out.lists.insert(path.clone());
            for (index, item) in items.iter().enumerate() {
                path.push(index.to_string());
                flatten_into(item, path, out);
                path.pop();
            }
        }
        leaf => {
            if path.is_empty() {
                out.root_leaf = true;
            }
            out.leaves.insert(path.join(SEPARATOR), leaf.clone());
        }
    }
}

/// Rebuild the nested shape from dotted paths.
pub fn unflatten(flat: Flattened) -> Value {
    if flat.root_leaf {
        return flat
            .leaves
            .into_iter()
            .next()
            .map(|(_, leaf)| leaf)
            .unwrap_or(Value::Null);
    }

    let mut root = Map::new();
    for (path, leaf) in flat.leaves {
        let segments: Vec<&str> = path.split(SEPARATOR).collect();
        insert_path(&mut root, &segments, leaf);
    }
    restore_lists(Value::Object(root), &mut Vec::new(), &flat.lists)
}

fn insert_path(node: &mut Map<String, Value>, segments: &[&str], leaf: Value) {
    match segments {
        [] => {}
        [last] => {
            node.insert((*last).to_string(), leaf);
        }
        [head, rest @ ..] => {
            let entry = node
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                // A leaf and a subtree share a path; the subtree wins.
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_path(child, rest, leaf);
            }
        }
    }
}

/// Turn the objects at recorded list paths back into lists.
fn restore_lists(value: Value, path: &mut Vec<String>, lists: &BTreeSet<Vec<String>>) -> Value {
    let mut map = match value {
        Value::Object(map) => map,
        other => return other,
    };

    if lists.contains(path) {
        let mut items = Vec::with_capacity(map.len());
        for index in 0..map.len() {
            let key = index.to_string();
            let item = map.remove(&key).unwrap_or(Value::Null);
            path.push(key);
            items.push(restore_lists(item, path, lists));
            path.pop();
        }
        return Value::Array(items);
    }

    let mut out = Map::new();
    for (key, item) in map {
        path.push(key.clone());
        let item = restore_lists(item, path, lists);
        path.pop();
        out.insert(key, item);
    }
    Value::Object(out)
}

fn is_primitive(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_uses_dotted_and_indexed_paths() {
        let flat = flatten(&json!({
            "a": {"b": 1, "c": [true, {"d": "x"}]},
            "e": 2.5
        }));
        assert_eq!(flat.leaves["a.b"], json!(1));
        assert_eq!(flat.leaves["a.c.0"], json!(true));
        assert_eq!(flat.leaves["a.c.1.d"], json!("x"));
        assert_eq!(flat.leaves["e"], json!(2.5));
        assert_eq!(flat.leaves.len(), 4);
    }

    #[test]
    fn normalize_keeps_primitive_records_intact() {
        let record = json!({
            "name": "wait",
            "total": 3,
            "percent": 33.3,
            "done": false,
            "errors": ["one", "two"],
            "nested": {"list": [1, 2, 3]}
        });
        assert_eq!(normalize(&record), record);
    }

    #[test]
    fn normalize_stringifies_non_primitive_leaves() {
        let normalized = normalize(&json!({
            "end": null,
            "meta": {},
            "errors": [],
            "tasks": [{"result": null}]
        }));
        assert_eq!(
            normalized,
            json!({
                "end": "null",
                "meta": "{}",
                "errors": "[]",
                "tasks": [{"result": "null"}]
            })
        );
    }

    #[test]
    fn normalize_top_level_leaf() {
        assert_eq!(normalize(&json!(null)), json!("null"));
        assert_eq!(normalize(&json!(7)), json!(7));
    }

    #[test]
    fn numeric_object_keys_stay_an_object() {
        let record = json!({"meta": {"0": "a", "1": "b"}});
        assert_eq!(normalize(&record), record);
    }

    #[test]
    fn empty_key_is_not_a_top_level_leaf() {
        assert_eq!(normalize(&json!({"": 1})), json!({"": 1}));
    }

    #[test]
    fn top_level_list_is_restored() {
        let record = json!([{"a": 1}, [2, 3], "x"]);
        assert_eq!(normalize(&record), record);
    }

    #[test]
    fn list_of_numeric_keyed_objects() {
        let record = json!({"rows": [{"0": "a"}, {"1": "b"}]});
        assert_eq!(normalize(&record), record);
    }
}
