//! Backend-agnostic record types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the identity field shared by every table.
pub const ID_FIELD: &str = "id";

/// Name of the embedding field on vector collections.
pub const EMBEDDING_FIELD: &str = "embedding";

/// Name of the text field on vector collections.
pub const CONTENT_FIELD: &str = "content";

/// An ordered mapping of field name to JSON-like value.
///
/// Field order is preserved as inserted. Rows read back from a backend are
/// ordered by the table's column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Returns the record id, if set.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.get_str(ID_FIELD)
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Returns a mutable field value.
    pub fn get_mut(&mut self, field: &str) -> Option<&mut Value> {
        self.0.get_mut(field)
    }

    /// Returns a string field, or `None` if absent or not a string.
    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Returns an integer field, or `None` if absent or not an integer.
    #[must_use]
    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.0.get(field).and_then(Value::as_i64)
    }

    /// Returns a boolean field, or `None` if absent or not a boolean.
    #[must_use]
    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.0.get(field).and_then(Value::as_bool)
    }

    /// Returns `true` if the field is present (even when `null`).
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Sets a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Removes a field, returning its value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.shift_remove(field)
    }

    /// Iterates over fields in order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Iterates over field names in order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the underlying map.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consumes the record and returns the underlying map.
    #[must_use]
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    /// Converts a JSON value into a record if it is an object.
    #[must_use]
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Returns a copy restricted to the given fields, in the given order.
    ///
    /// `id` is always kept.
    #[must_use]
    pub fn project(&self, fields: &[String]) -> Self {
        let mut out = Map::new();
        if let Some(id) = self.0.get(ID_FIELD) {
            out.insert(ID_FIELD.to_string(), id.clone());
        }
        for field in fields {
            if let Some(value) = self.0.get(field) {
                out.insert(field.clone(), value.clone());
            }
        }
        Self(out)
    }

    /// Reads the embedding field as `f32` values.
    ///
    /// Returns `None` when the field is absent, `null` or not a numeric array.
    #[must_use]
    pub fn embedding(&self) -> Option<Vec<f32>> {
        embedding_from_value(self.0.get(EMBEDDING_FIELD)?)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Self::Object(record.0)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = serde_json::map::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Parses a JSON numeric array into an embedding.
#[must_use]
pub fn embedding_from_value(value: &Value) -> Option<Vec<f32>> {
    let items = value.as_array()?;
    items
        .iter()
        .map(|item| {
            #[allow(clippy::cast_possible_truncation)]
            item.as_f64().map(|f| f as f32)
        })
        .collect()
}

/// Converts an embedding to its JSON representation.
#[must_use]
pub fn embedding_to_value(embedding: &[f32]) -> Value {
    Value::Array(
        embedding
            .iter()
            .map(|&f| serde_json::Number::from_f64(f64::from(f)).map_or(Value::Null, Value::Number))
            .collect(),
    )
}

/// A record in a vector collection.
///
/// Carries the text `content` and a fixed-length `embedding` alongside the
/// other fields of the row.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    /// Remaining fields (`source_id`, `url`, `metadata`, ...).
    pub record: Record,
    /// Text the embedding was computed from.
    pub content: String,
    /// Pre-computed embedding.
    pub embedding: Vec<f32>,
}

impl VectorRecord {
    /// Creates a vector record with no other fields.
    #[must_use]
    pub fn new(content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            record: Record::new(),
            content: content.into(),
            embedding,
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.record.insert(field, value);
        self
    }

    /// Converts into a plain record ready for insertion.
    #[must_use]
    pub fn into_record(self) -> Record {
        let mut record = self.record;
        record.insert(CONTENT_FIELD, self.content);
        record.insert(EMBEDDING_FIELD, embedding_to_value(&self.embedding));
        record
    }
}

/// A field to equality-value map.
///
/// A `null` value means "no constraint". Use an explicit
/// [`Predicate::IsNull`](crate::storage::query::Predicate::IsNull) to match
/// null columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(Map<String, Value>);

impl Filter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Adds an equality constraint.
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Iterates over constraints, including the `null` (unconstrained) ones.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Returns `true` if no field is constrained.
    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.0.values().all(Value::is_null)
    }
}

impl From<Map<String, Value>> for Filter {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_preserves_insertion_order() {
        let record = Record::new().with("b", 1).with("a", 2).with("c", 3);
        let fields: Vec<_> = record.fields().collect();
        assert_eq!(fields, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_project_keeps_id() {
        let record = Record::new()
            .with("id", "r1")
            .with("title", "t")
            .with("status", "todo");
        let projected = record.project(&["status".to_string()]);
        assert_eq!(projected.id(), Some("r1"));
        assert_eq!(projected.get_str("status"), Some("todo"));
        assert!(!projected.contains("title"));
    }

    #[test]
    fn test_vector_record_into_record() {
        let record = VectorRecord::new("hello", vec![0.5, 0.25])
            .with("source_id", "s1")
            .into_record();
        assert_eq!(record.get_str("content"), Some("hello"));
        assert_eq!(record.get_str("source_id"), Some("s1"));
        assert_eq!(record.embedding(), Some(vec![0.5, 0.25]));
    }

    #[test]
    fn test_embedding_rejects_non_numeric() {
        assert_eq!(embedding_from_value(&json!([1.0, "x"])), None);
        assert_eq!(embedding_from_value(&json!("nope")), None);
        assert_eq!(embedding_from_value(&json!([])), Some(vec![]));
    }

    #[test]
    fn test_filter_null_is_unconstrained() {
        assert!(Filter::new().eq("status", Value::Null).is_unconstrained());
        assert!(!Filter::new().eq("status", "todo").is_unconstrained());
    }
}
