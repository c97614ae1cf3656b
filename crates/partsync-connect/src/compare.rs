//! Pure diffing helpers used during reconciliation.
//!
//! - [`compare_part_ids`] partitions two id lists into added / removed /
//!   unchanged.
//! - [`deep_equal`] decides whether a part's config changed between two
//!   reconciles.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde_json::Value;

/// Result of [`compare_part_ids`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartIdDiff<T> {
    /// In `current` but not in `last`, in `current` order.
    pub added: Vec<T>,
    /// In `last` but not in `current`, in `last` order.
    pub removed: Vec<T>,
    /// In both, in `current` order.
    pub unchanged: Vec<T>,
}

impl<T> Default for PartIdDiff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

/// Partition `current` against `last`.
///
/// Each output keeps the relative order (and any repeats) of the list it was
/// drawn from.
///
/// ```
/// use partsync_connect::compare_part_ids;
///
/// let diff = compare_part_ids(&["id2", "id3", "id4"], &["id1", "id2", "id3"]);
/// assert_eq!(diff.added, ["id4"]);
/// assert_eq!(diff.removed, ["id1"]);
/// assert_eq!(diff.unchanged, ["id2", "id3"]);
/// ```
pub fn compare_part_ids<T>(current: &[T], last: &[T]) -> PartIdDiff<T>
where
    T: Eq + Hash + Clone,
{
    let current_set: HashSet<&T> = current.iter().collect();
    let last_set: HashSet<&T> = last.iter().collect();

    let added = current
        .iter()
        .filter(|id| !last_set.contains(id))
        .cloned()
        .collect();
    let removed = last
        .iter()
        .filter(|id| !current_set.contains(id))
        .cloned()
        .collect();
    let unchanged = current
        .iter()
        .filter(|id| last_set.contains(id))
        .cloned()
        .collect();

    PartIdDiff {
        added,
        removed,
        unchanged,
    }
}

/// Structural equality over JSON values.
///
/// Objects and arrays are compared as key/value collections: arrays are keyed
/// by their index, so `{"0": "a", "1": "b"}` equals `["a", "b"]`.  A differing
/// key count is inequality even when every shared key matches, and a key that
/// holds `null` is not the same as an absent key.  Numbers compare by value
/// (`1` equals `1.0`).
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(_) | Value::Object(_), Value::Array(_) | Value::Object(_)) => {
            let left = entries(a);
            let right = entries(b);
            if left.len() != right.len() {
                return false;
            }
            left.iter().all(|(key, value)| {
                right
                    .get(key)
                    .is_some_and(|other| deep_equal(value, other))
            })
        }
        _ => false,
    }
}

fn entries(value: &Value) -> HashMap<String, &Value> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| (index.to_string(), item))
            .collect(),
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        _ => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compare_reports_added_removed_unchanged() {
        let diff = compare_part_ids(&["id2", "id3", "id4"], &["id1", "id2", "id3"]);
        assert_eq!(diff.added, vec!["id4"]);
        assert_eq!(diff.removed, vec!["id1"]);
        assert_eq!(diff.unchanged, vec!["id2", "id3"]);
    }

    #[test]
    fn compare_empty_lists() {
        let diff = compare_part_ids::<&str>(&[], &[]);
        assert_eq!(diff, PartIdDiff::default());
    }

    #[test]
    fn compare_all_added_when_last_is_empty() {
        let diff = compare_part_ids(&["a"], &[]);
        assert_eq!(diff.added, vec!["a"]);
        assert!(diff.removed.is_empty());
        assert!(diff.unchanged.is_empty());
    }

    #[test]
    fn compare_all_removed_when_current_is_empty() {
        let diff = compare_part_ids(&[], &["a", "b"]);
        assert_eq!(diff.removed, vec!["a", "b"]);
        assert!(diff.added.is_empty());
    }

    #[test]
    fn compare_preserves_input_order() {
        let diff = compare_part_ids(&["z", "b", "m", "a"], &["m", "q", "z", "c"]);
        assert_eq!(diff.added, vec!["b", "a"]);
        assert_eq!(diff.removed, vec!["q", "c"]);
        assert_eq!(diff.unchanged, vec!["z", "m"]);
    }

    #[test]
    fn compare_keeps_repeats() {
        let diff = compare_part_ids(&["a", "a", "b"], &["b", "c", "c"]);
        assert_eq!(diff.added, vec!["a", "a"]);
        assert_eq!(diff.removed, vec!["c", "c"]);
        assert_eq!(diff.unchanged, vec!["b"]);
    }

    #[test]
    fn deep_equal_nested_objects() {
        let a = json!({ "host": "arm", "creds": { "type": "api-key", "ids": [1, 2] } });
        let b = json!({ "creds": { "ids": [1, 2], "type": "api-key" }, "host": "arm" });
        assert!(deep_equal(&a, &b));
    }

    #[test]
    fn deep_equal_detects_nested_difference() {
        let a = json!({ "creds": { "ids": [1, 2] } });
        let b = json!({ "creds": { "ids": [1, 3] } });
        assert!(!deep_equal(&a, &b));
    }

    #[test]
    fn deep_equal_key_count_mismatch() {
        let a = json!({ "host": "arm" });
        let b = json!({ "host": "arm", "port": 8080 });
        assert!(!deep_equal(&a, &b));
        assert!(!deep_equal(&b, &a));
    }

    #[test]
    fn deep_equal_null_is_not_absent() {
        let a = json!({ "host": "arm", "signaling_address": null });
        let b = json!({ "host": "arm" });
        assert!(!deep_equal(&a, &b));
    }

    #[test]
    fn deep_equal_object_with_index_keys_matches_array() {
        assert!(deep_equal(&json!({ "0": "a", "1": "b" }), &json!(["a", "b"])));
        assert!(!deep_equal(&json!({ "0": "a", "2": "b" }), &json!(["a", "b"])));
    }

    #[test]
    fn deep_equal_wide_objects_in_any_key_order() {
        let forward: serde_json::Map<String, Value> =
            (0..5_000).map(|i| (format!("k{i}"), json!(i))).collect();
        let backward: serde_json::Map<String, Value> =
            (0..5_000).rev().map(|i| (format!("k{i}"), json!(i))).collect();
        assert!(deep_equal(&Value::Object(forward.clone()), &Value::Object(backward)));

        let mut changed = forward.clone();
        changed.insert("k4999".to_string(), json!("x"));
        assert!(!deep_equal(&Value::Object(forward), &Value::Object(changed)));
    }

    #[test]
    fn deep_equal_primitives() {
        assert!(deep_equal(&json!(null), &json!(null)));
        assert!(deep_equal(&json!(1), &json!(1.0)));
        assert!(!deep_equal(&json!(null), &json!(false)));
        assert!(!deep_equal(&json!("1"), &json!(1)));
        assert!(!deep_equal(&json!([]), &json!(null)));
    }
}
