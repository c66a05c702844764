//! Parameter binding and row decoding for the embedded backend.

use super::BACKEND;
use super::connection::map_error;
use crate::models::schema::{format_timestamp, normalize_timestamp};
use crate::models::{Column, ColumnType, Record, ScoredRecord, embedding_to_value};
use crate::storage::query::{SqlParam, SqlStatement};
use crate::{Error, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, Row, params_from_iter};
use serde_json::{Number, Value};

/// Converts a rendered parameter to a `SQLite` value.
///
/// JSON, vectors and timestamps are stored as text.
pub fn to_sql(param: &SqlParam) -> SqlValue {
    match param {
        SqlParam::Null(_) => SqlValue::Null,
        SqlParam::Text(text) => SqlValue::Text(text.clone()),
        SqlParam::Integer(i) => SqlValue::Integer(*i),
        SqlParam::Real(f) => SqlValue::Real(*f),
        SqlParam::Bool(b) => SqlValue::Integer(i64::from(*b)),
        SqlParam::Json(value) => SqlValue::Text(value.to_string()),
        SqlParam::Timestamp(ts) => SqlValue::Text(format_timestamp(*ts)),
        SqlParam::Vector(embedding) => SqlValue::Text(embedding_to_value(embedding).to_string()),
        SqlParam::TextArray(items) => SqlValue::Text(Value::from(items.clone()).to_string()),
    }
}

fn malformed(column: &str, detail: impl std::fmt::Display) -> Error {
    Error::backend(
        "decode",
        BACKEND,
        format!("malformed value in column '{column}': {detail}"),
    )
}

fn utf8<'a>(column: &str, bytes: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(bytes).map_err(|e| malformed(column, e))
}

fn real(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

/// Decodes one stored value according to its column type.
pub fn decode_value(column: &Column, raw: ValueRef<'_>) -> Result<Value> {
    let name = column.name;
    Ok(match (column.ty, raw) {
        (_, ValueRef::Null) => Value::Null,
        (ColumnType::Boolean, ValueRef::Integer(i)) => Value::Bool(i != 0),
        (ColumnType::Integer, ValueRef::Integer(i)) => Value::from(i),
        #[allow(clippy::cast_precision_loss)]
        (ColumnType::Real, ValueRef::Integer(i)) => real(i as f64),
        (ColumnType::Real, ValueRef::Real(f)) => real(f),
        (ColumnType::Text, ValueRef::Text(t)) => Value::String(utf8(name, t)?.to_string()),
        (ColumnType::Timestamp, ValueRef::Text(t)) => {
            let raw = utf8(name, t)?;
            Value::String(normalize_timestamp(raw).unwrap_or_else(|| raw.to_string()))
        },
        (ColumnType::Json | ColumnType::Vector, ValueRef::Text(t)) => {
            serde_json::from_slice(t).map_err(|e| malformed(name, e))?
        },
        (ty, other) => {
            return Err(malformed(
                name,
                format!("{:?} stored in a {ty:?} column", other.data_type()),
            ));
        },
    })
}

/// Decodes the leading `columns` of a row.
pub fn decode_row(row: &Row<'_>, columns: &[&'static Column]) -> Result<Record> {
    let mut record = Record::new();
    for (i, column) in columns.iter().enumerate() {
        let raw = row.get_ref(i).map_err(|e| map_error("decode", e))?;
        record.insert(column.name, decode_value(column, raw)?);
    }
    Ok(record)
}

/// Decodes a row followed by a `_score` column.
pub fn decode_scored(row: &Row<'_>, columns: &[&'static Column]) -> Result<ScoredRecord> {
    let record = decode_row(row, columns)?;
    let score: f64 = row.get(columns.len()).map_err(|e| map_error("decode", e))?;
    #[allow(clippy::cast_possible_truncation)]
    let score = score as f32;
    Ok(ScoredRecord { record, score })
}

/// Decodes a row with no schema, for stored procedures.
///
/// Text that parses as a JSON object or array is returned as JSON.
pub fn decode_dynamic(row: &Row<'_>) -> Result<Record> {
    let names: Vec<String> = row
        .as_ref()
        .column_names()
        .into_iter()
        .map(ToString::to_string)
        .collect();
    let mut record = Record::new();
    for (i, name) in names.into_iter().enumerate() {
        let value = match row.get_ref(i).map_err(|e| map_error("decode", e))? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::from(n),
            ValueRef::Real(f) => real(f),
            ValueRef::Text(t) => {
                let text = utf8(&name, t)?;
                if text.starts_with(['{', '[']) {
                    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
                } else {
                    Value::String(text.to_string())
                }
            },
            ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
        };
        record.insert(name, value);
    }
    Ok(record)
}

/// Runs a statement and decodes every row with `decode`.
pub fn query_with<T>(
    conn: &Connection,
    operation: &str,
    statement: &SqlStatement,
    decode: impl Fn(&Row<'_>) -> Result<T>,
) -> Result<Vec<T>> {
    let mut prepared = conn
        .prepare_cached(&statement.sql)
        .map_err(|e| map_error(operation, e))?;
    let params: Vec<SqlValue> = statement.params.iter().map(to_sql).collect();
    let mut rows = prepared
        .query(params_from_iter(params.iter()))
        .map_err(|e| map_error(operation, e))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| map_error(operation, e))? {
        out.push(decode(row)?);
    }
    Ok(out)
}

/// Runs a statement that returns schema rows.
pub fn query_records(
    conn: &Connection,
    operation: &str,
    statement: &SqlStatement,
) -> Result<Vec<Record>> {
    query_with(conn, operation, statement, |row| decode_row(row, &statement.columns))
}

/// Runs a search statement that returns scored rows.
pub fn query_scored(
    conn: &Connection,
    operation: &str,
    statement: &SqlStatement,
) -> Result<Vec<ScoredRecord>> {
    query_with(conn, operation, statement, |row| {
        decode_scored(row, &statement.columns)
    })
}

/// Runs a statement that returns no rows. Returns the affected row count.
pub fn execute(conn: &Connection, operation: &str, statement: &SqlStatement) -> Result<usize> {
    let mut prepared = conn
        .prepare_cached(&statement.sql)
        .map_err(|e| map_error(operation, e))?;
    let params: Vec<SqlValue> = statement.params.iter().map(to_sql).collect();
    prepared
        .execute(params_from_iter(params.iter()))
        .map_err(|e| map_error(operation, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnDefault, EMBEDDING_FIELD};
    use serde_json::json;

    const FLAG: Column = Column {
        name: "archived",
        ty: ColumnType::Boolean,
        default: ColumnDefault::Boolean(false),
    };
    const DOCS: Column = Column {
        name: "docs",
        ty: ColumnType::Json,
        default: ColumnDefault::EmptyArray,
    };
    const VECTOR: Column = Column {
        name: EMBEDDING_FIELD,
        ty: ColumnType::Vector,
        default: ColumnDefault::Null,
    };

    #[test]
    fn test_decode_value_by_column_type() {
        assert_eq!(decode_value(&FLAG, ValueRef::Integer(1)).unwrap(), json!(true));
        assert_eq!(
            decode_value(&DOCS, ValueRef::Text(br#"[{"a":1}]"#)).unwrap(),
            json!([{"a": 1}])
        );
        assert_eq!(
            decode_value(&VECTOR, ValueRef::Text(b"[0.5,1.0]")).unwrap(),
            json!([0.5, 1.0])
        );
        assert_eq!(decode_value(&DOCS, ValueRef::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_value_rejects_wrong_storage_class() {
        let err = decode_value(&FLAG, ValueRef::Text(b"yes")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Backend);
        assert!(decode_value(&DOCS, ValueRef::Text(b"{not json")).is_err());
    }

    #[test]
    fn test_params_round_trip_through_sqlite() {
        let conn = Connection::open_in_memory().unwrap();
        let statement = SqlStatement {
            sql: "SELECT ?1 AS a, ?2 AS b, ?3 AS c".to_string(),
            params: vec![
                SqlParam::Bool(true),
                SqlParam::Json(json!({"k": [1, 2]})),
                SqlParam::Null(ColumnType::Text),
            ],
            columns: Vec::new(),
            scored: false,
        };
        let rows = query_with(&conn, "test", &statement, decode_dynamic).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i64("a"), Some(1));
        assert_eq!(rows[0].get("b"), Some(&json!({"k": [1, 2]})));
        assert_eq!(rows[0].get("c"), Some(&Value::Null));
    }
}
