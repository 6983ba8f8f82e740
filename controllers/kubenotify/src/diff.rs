//! Structural diff over JSON trees.
//!
//! Objects are marshalled into `serde_json::Value` and compared leaf by leaf.
//! Maps are walked key by key in sorted order, arrays index by index. A
//! subtree that exists on only one side is expanded into its leaves so every
//! reported path ends at a scalar, an empty container, or a type change.

use serde_json::{Map, Value};

/// A single leaf-level difference.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// Path segments from the root (map keys and array indices)
    pub path: Vec<String>,
    /// Value before the change, `None` when the field was added
    pub from: Option<Value>,
    /// Value after the change, `None` when the field was removed
    pub to: Option<Value>,
}

impl FieldChange {
    /// Dotted path, e.g. `spec.template.spec.containers.0.image`.
    #[must_use]
    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }
}

/// Diffs two JSON trees.
#[must_use]
pub fn diff(before: &Value, after: &Value) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    let mut path = Vec::new();
    walk(&mut path, Some(before), Some(after), &mut changes);
    changes
}

fn walk(
    path: &mut Vec<String>,
    before: Option<&Value>,
    after: Option<&Value>,
    out: &mut Vec<FieldChange>,
) {
    match (before, after) {
        (Some(Value::Object(a)), Some(Value::Object(b))) => walk_maps(path, Some(a), Some(b), out),
        (Some(Value::Array(a)), Some(Value::Array(b))) => walk_arrays(path, Some(a), Some(b), out),
        (None, Some(Value::Object(b))) if !b.is_empty() => walk_maps(path, None, Some(b), out),
        (Some(Value::Object(a)), None) if !a.is_empty() => walk_maps(path, Some(a), None, out),
        (None, Some(Value::Array(b))) if !b.is_empty() => walk_arrays(path, None, Some(b), out),
        (Some(Value::Array(a)), None) if !a.is_empty() => walk_arrays(path, Some(a), None, out),
        (a, b) if a == b => {}
        (a, b) => out.push(FieldChange {
            path: path.clone(),
            from: a.cloned(),
            to: b.cloned(),
        }),
    }
}

fn walk_maps(
    path: &mut Vec<String>,
    before: Option<&Map<String, Value>>,
    after: Option<&Map<String, Value>>,
    out: &mut Vec<FieldChange>,
) {
    let mut keys: Vec<&String> = before
        .into_iter()
        .flat_map(Map::keys)
        .chain(after.into_iter().flat_map(Map::keys))
        .collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        path.push(key.clone());
        walk(
            path,
            before.and_then(|m| m.get(key)),
            after.and_then(|m| m.get(key)),
            out,
        );
        path.pop();
    }
}

fn walk_arrays(
    path: &mut Vec<String>,
    before: Option<&Vec<Value>>,
    after: Option<&Vec<Value>>,
    out: &mut Vec<FieldChange>,
) {
    let len = before
        .map_or(0, Vec::len)
        .max(after.map_or(0, Vec::len));

    for index in 0..len {
        path.push(index.to_string());
        walk(
            path,
            before.and_then(|v| v.get(index)),
            after.and_then(|v| v.get(index)),
            out,
        );
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(changes: &[FieldChange]) -> Vec<String> {
        changes.iter().map(FieldChange::dotted_path).collect()
    }

    #[test]
    fn test_identical_trees_have_no_changes() {
        let obj = json!({"spec": {"replicas": 3, "template": {"containers": [{"image": "nginx:1"}]}}});
        assert!(diff(&obj, &obj).is_empty());
    }

    #[test]
    fn test_nested_scalar_change() {
        let before = json!({"spec": {"replicas": 3}, "status": {"replicas": 3}});
        let after = json!({"spec": {"replicas": 5}, "status": {"replicas": 3}});

        let changes = diff(&before, &after);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].dotted_path(), "spec.replicas");
        assert_eq!(changes[0].from, Some(json!(3)));
        assert_eq!(changes[0].to, Some(json!(5)));
    }

    #[test]
    fn test_array_elements_are_indexed() {
        let before = json!({"containers": [{"name": "app", "image": "app:1"}]});
        let after = json!({"containers": [{"name": "app", "image": "app:2"}, {"name": "sidecar"}]});

        let changes = diff(&before, &after);

        assert_eq!(paths(&changes), vec!["containers.0.image", "containers.1.name"]);
        assert_eq!(changes[1].from, None);
        assert_eq!(changes[1].to, Some(json!("sidecar")));
    }

    #[test]
    fn test_added_and_removed_subtrees_expand_to_leaves() {
        let before = json!({"metadata": {"labels": {"a": "1"}}});
        let after = json!({"metadata": {"annotations": {"x": "y", "z": "w"}}});

        let changes = diff(&before, &after);

        assert_eq!(
            paths(&changes),
            vec!["metadata.annotations.x", "metadata.annotations.z", "metadata.labels.a"]
        );
        assert_eq!(changes[2].to, None);
    }

    #[test]
    fn test_type_change_is_a_single_leaf() {
        let before = json!({"value": {"nested": 1}});
        let after = json!({"value": "flat"});

        let changes = diff(&before, &after);

        assert_eq!(paths(&changes), vec!["value"]);
        assert_eq!(changes[0].from, Some(json!({"nested": 1})));
    }

    #[test]
    fn test_null_to_value_is_reported() {
        let before = json!({"spec": {"paused": null}});
        let after = json!({"spec": {"paused": true}});

        let changes = diff(&before, &after);

        assert_eq!(paths(&changes), vec!["spec.paused"]);
        assert_eq!(changes[0].from, Some(Value::Null));
    }
}
