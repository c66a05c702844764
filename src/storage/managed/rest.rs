//! PostgREST query parameters and error bodies.

use super::BACKEND;
use crate::models::schema::SEQ_FIELD;
use crate::models::{ColumnType, Record, Table, embedding_from_value};
use crate::storage::key_detail_field;
use crate::storage::query::{Direction, Predicate, Query, format_vector};
use crate::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use std::ops::Bound;

/// Query string pairs for one request.
pub type Params = Vec<(String, String)>;

/// Renders a scalar the way PostgREST parses filter operands.
fn operand(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Quotes a list member so commas and parentheses survive `in.(...)`.
fn list_member(value: &Value) -> String {
    let raw = operand(value);
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `field->a->>b`: the last key extracts text.
fn json_path(field: &str, path: &[String]) -> String {
    let mut out = field.to_string();
    for (i, key) in path.iter().enumerate() {
        out.push_str(if i + 1 == path.len() { "->>" } else { "->" });
        out.push_str(key);
    }
    out
}

/// Renders one predicate as `(column, filter)`. Unconstrained predicates
/// render to nothing.
pub fn predicate(predicate: &Predicate) -> Vec<(String, String)> {
    if !predicate.is_constraint() {
        return Vec::new();
    }
    match predicate {
        Predicate::Equals { field, value } => vec![(field.clone(), format!("eq.{}", operand(value)))],
        Predicate::IsNull { field } => vec![(field.clone(), "is.null".to_string())],
        Predicate::InSet { field, values } => {
            let members: Vec<String> = values.iter().map(list_member).collect();
            vec![(field.clone(), format!("in.({})", members.join(",")))]
        },
        Predicate::JsonPathEquals { field, path, value } => {
            vec![(json_path(field, path), format!("eq.{}", operand(value)))]
        },
        Predicate::Range {
            field,
            lower,
            upper,
        } => {
            let mut out = Vec::new();
            for (bound, inclusive, exclusive) in [(lower, "gte", "gt"), (upper, "lte", "lt")] {
                match bound {
                    Bound::Included(v) => out.push((field.clone(), format!("{inclusive}.{}", operand(v)))),
                    Bound::Excluded(v) => out.push((field.clone(), format!("{exclusive}.{}", operand(v)))),
                    Bound::Unbounded => {},
                }
            }
            out
        },
    }
}

/// Filters for a list of predicates.
pub fn filters(predicates: &[Predicate]) -> Params {
    predicates.iter().flat_map(predicate).collect()
}

/// `order=` value: explicit terms with nulls last, then insertion order.
pub fn order(query: &Query) -> String {
    let schema = query.table.schema();
    let mut terms: Vec<String> = query
        .order
        .iter()
        .filter(|o| schema.column(&o.field).is_some())
        .map(|o| {
            let dir = match o.direction {
                Direction::Asc => "asc",
                Direction::Desc => "desc",
            };
            format!("{}.{dir}.nullslast", o.field)
        })
        .collect();
    terms.push(format!("{SEQ_FIELD}.asc"));
    terms.join(",")
}

/// `select=` value for a query's projection.
pub fn select(query: &Query) -> String {
    match &query.columns {
        None => "*".to_string(),
        Some(columns) => {
            let mut fields = vec![crate::models::ID_FIELD.to_string()];
            for column in columns {
                if !fields.contains(column) {
                    fields.push(column.clone());
                }
            }
            fields.join(",")
        },
    }
}

/// Full parameter list for a checked query whose joins are already
/// resolved to predicates.
pub fn list_params(query: &Query) -> Params {
    let mut params = vec![("select".to_string(), select(query))];
    params.extend(filters(&query.predicates));
    params.push(("order".to_string(), order(query)));
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = query.offset {
        params.push(("offset".to_string(), offset.to_string()));
    }
    params
}

/// Converts a prepared row into a request body. Embeddings travel as
/// pgvector literals.
pub fn encode_row(table: Table, row: &Record) -> Value {
    let mut body = row.clone();
    for column in table.schema().columns {
        if column.ty != ColumnType::Vector {
            continue;
        }
        if let Some(embedding) = row.get(column.name).and_then(embedding_from_value) {
            body.insert(column.name, format_vector(&embedding));
        }
    }
    Value::from(body)
}

/// Error body returned by PostgREST.
#[derive(Debug, Default, Deserialize)]
pub struct ApiError {
    /// SQLSTATE or `PGRST` code.
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
    /// Extra detail, such as the conflicting key.
    #[serde(default)]
    pub details: Option<String>,
}

impl ApiError {
    /// Parses a response body, tolerating non-JSON bodies.
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| Self {
            message: Some(body.to_string()),
            ..Self::default()
        })
    }

    fn describe(&self, status: u16) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("HTTP {status} {code}: {message}"),
            (None, Some(message)) => format!("HTTP {status}: {message}"),
            _ => format!("HTTP {status}"),
        }
    }

    /// Missing table or relation: the schema has not been migrated.
    pub fn is_missing_relation(&self) -> bool {
        matches!(self.code.as_deref(), Some("42P01" | "PGRST205"))
    }
}

/// Maps an error response onto the crate's error taxonomy.
pub fn map_status(operation: &str, status: u16, body: &str) -> Error {
    let api = ApiError::parse(body);
    let description = api.describe(status);
    match (status, api.code.as_deref()) {
        (_, Some("23505" | "23503" | "23502" | "23514")) => {
            let field = api.details.as_deref().and_then(key_detail_field);
            Error::constraint(operation, BACKEND, field, description)
        },
        (_, Some("PGRST202" | "42883")) => {
            Error::validation(operation, BACKEND, "name", description)
        },
        (_, Some("42703" | "PGRST204")) => {
            Error::validation(operation, BACKEND, "field", description)
        },
        (401 | 403, _) => Error::Configuration(format!(
            "{BACKEND} rejected the service key: {description}"
        )),
        (408 | 429 | 502 | 503 | 504, _) => Error::connectivity(operation, BACKEND, description),
        _ => Error::backend(operation, BACKEND, description),
    }
}

/// Maps a transport failure.
pub fn map_transport(operation: &str, err: &reqwest::Error) -> Error {
    if err.is_decode() {
        Error::backend(operation, BACKEND, err)
    } else {
        Error::connectivity(operation, BACKEND, err)
    }
}

/// Total row count from a `Content-Range` header such as `0-24/3573` or
/// `*/0`.
pub fn content_range_total(header: &str) -> Result<u64> {
    header
        .rsplit_once('/')
        .and_then(|(_, total)| total.parse().ok())
        .ok_or_else(|| {
            Error::backend("count", BACKEND, format!("malformed Content-Range '{header}'"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(Predicate::equals("status", "todo"), &[("status", "eq.todo")] ; "equals")]
    #[test_case(Predicate::equals("status", Value::Null), &[] ; "null equals")]
    #[test_case(Predicate::is_null("feature"), &[("feature", "is.null")] ; "is null")]
    #[test_case(Predicate::in_set("status", ["a", "b,c"]), &[("status", "in.(\"a\",\"b,c\")")] ; "in set")]
    #[test_case(Predicate::json_path_equals("metadata", ["a", "b"], 1), &[("metadata->a->>b", "eq.1")] ; "json path")]
    #[test_case(
        Predicate::range("task_order", Bound::Included(json!(1)), Bound::Excluded(json!(5))),
        &[("task_order", "gte.1"), ("task_order", "lt.5")] ;
        "range"
    )]
    fn test_predicate_rendering(predicate: Predicate, expected: &[(&str, &str)]) {
        let rendered = super::predicate(&predicate);
        let expected: Vec<(String, String)> = expected
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_list_params_order_and_paging() {
        let query = Query::table(Table::Tasks)
            .select(["title"])
            .order_by("task_order", Direction::Desc)
            .limit(10)
            .offset(20);
        let params = list_params(&query);
        assert!(params.contains(&("select".to_string(), "id,title".to_string())));
        assert!(params.contains(&("order".to_string(), "task_order.desc.nullslast,_seq.asc".to_string())));
        assert!(params.contains(&("limit".to_string(), "10".to_string())));
        assert!(params.contains(&("offset".to_string(), "20".to_string())));
    }

    #[test]
    fn test_encode_row_formats_embeddings() {
        let row = Record::new().with("id", "c").with("embedding", json!([0.5, 1.0]));
        let body = encode_row(Table::DocumentChunks, &row);
        assert_eq!(body["embedding"], json!("[0.5,1]"));
        let empty = Record::new().with("id", "c").with("embedding", Value::Null);
        assert_eq!(encode_row(Table::DocumentChunks, &empty)["embedding"], Value::Null);
    }

    #[test]
    fn test_map_status_kinds() {
        let unique = r#"{"code":"23505","details":"Key (key)=(theme) already exists.","message":"duplicate key"}"#;
        let err = map_status("create", 409, unique);
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(err.field(), Some("key"));

        let missing_fn = r#"{"code":"PGRST202","message":"Could not find the function"}"#;
        assert_eq!(map_status("call_procedure", 404, missing_fn).field(), Some("name"));

        assert_eq!(map_status("list", 503, "upstream down").kind(), ErrorKind::Connectivity);
        assert_eq!(map_status("list", 401, "{}").kind(), ErrorKind::Configuration);
        assert_eq!(map_status("list", 400, "{}").kind(), ErrorKind::Backend);
    }

    #[test_case("0-24/3573", Some(3573) ; "page")]
    #[test_case("*/0", Some(0) ; "empty")]
    #[test_case("0-24/*", None ; "unknown total")]
    fn test_content_range_total(header: &str, expected: Option<u64>) {
        assert_eq!(content_range_total(header).ok(), expected);
    }
}
