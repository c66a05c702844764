//! The single structural merge used by every adapter's `update`.
//!
//! Fields absent from a patch are never touched. When both the stored value
//! and the patch value are JSON objects, their top-level keys are merged and
//! nested values are replaced as a whole. Any other patch value replaces the
//! stored one.
//!
//! ```text
//! stored   {"a": 1, "b": {"x": 1, "y": 2}}
//! patch    {"b": {"x": 9}, "c": 3}
//! merged   {"a": 1, "b": {"x": 9}, "c": 3}
//! ```

use super::record::Record;
use serde_json::Value;

/// Merges one field value in place.
pub fn merge_value(stored: &mut Value, patch: Value) {
    match (stored, patch) {
        (Value::Object(base), Value::Object(incoming)) => {
            for (key, value) in incoming {
                base.insert(key, value);
            }
        },
        (slot, incoming) => *slot = incoming,
    }
}

/// Applies a patch to a stored record without clearing omitted fields.
#[must_use]
pub fn merge_record(stored: &Record, patch: &Record) -> Record {
    let mut merged = stored.clone();
    for (field, value) in patch.iter() {
        match merged.get_mut(field) {
            Some(current) => merge_value(current, value.clone()),
            None => {
                merged.insert(field.clone(), value.clone());
            },
        }
    }
    merged
}

/// Returns `true` if applying the patch would change nothing, ignoring the
/// given fields.
#[must_use]
pub fn is_noop_patch(stored: &Record, patch: &Record, ignore: &[&str]) -> bool {
    let merged = merge_record(stored, patch);
    patch
        .fields()
        .filter(|f| !ignore.contains(f))
        .all(|f| stored.get(f) == merged.get(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_omitted_metadata_keys() {
        let stored = Record::new()
            .with("title", "t")
            .with("metadata", json!({"a": 1, "b": 2}));
        let patch = Record::new().with("metadata", json!({"b": 3}));

        let merged = merge_record(&stored, &patch);
        assert_eq!(merged.get("metadata"), Some(&json!({"a": 1, "b": 3})));
        assert_eq!(merged.get_str("title"), Some("t"));
    }

    #[test]
    fn test_nested_values_are_replaced_shallowly() {
        let mut stored = json!({"a": {"x": 1, "y": 2}, "keep": true});
        merge_value(&mut stored, json!({"a": {"x": 9}}));
        assert_eq!(stored, json!({"a": {"x": 9}, "keep": true}));
    }

    #[test]
    fn test_non_object_patch_replaces() {
        let mut stored = json!({"a": 1});
        merge_value(&mut stored, json!(["list"]));
        assert_eq!(stored, json!(["list"]));

        let mut stored = Value::Null;
        merge_value(&mut stored, json!({"a": 1}));
        assert_eq!(stored, json!({"a": 1}));
    }

    #[test]
    fn test_noop_patch_detection() {
        let stored = Record::new().with("key", "k").with("value", "v").with("updated_at", "t1");
        let same = Record::new().with("value", "v").with("updated_at", "t2");
        let different = Record::new().with("value", "w");
        assert!(is_noop_patch(&stored, &same, &["updated_at"]));
        assert!(!is_noop_patch(&stored, &different, &["updated_at"]));
    }
}
