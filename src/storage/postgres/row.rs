//! Parameter binding, row decoding and error mapping for PostgreSQL.

use crate::models::schema::format_timestamp;
use crate::models::{Column, ColumnType, Record, ScoredRecord, embedding_to_value};
use crate::storage::key_detail_field;
use crate::storage::query::{SqlParam, format_vector, parse_vector};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::PoolError;
use serde_json::Value;
use tokio_postgres::Row;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;

/// An owned, thread-safe parameter.
pub type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Converts a rendered parameter to a driver value.
///
/// With pgvector, vectors travel as text and are cast in SQL. Without it
/// they are JSONB arrays.
pub fn to_sql(param: &SqlParam, native_vectors: bool) -> BoxedParam {
    match param {
        SqlParam::Null(ty) => match ty {
            ColumnType::Text => Box::new(None::<String>),
            ColumnType::Integer => Box::new(None::<i64>),
            ColumnType::Real => Box::new(None::<f64>),
            ColumnType::Boolean => Box::new(None::<bool>),
            ColumnType::Timestamp => Box::new(None::<DateTime<Utc>>),
            ColumnType::Vector if native_vectors => Box::new(None::<String>),
            ColumnType::Json | ColumnType::Vector => Box::new(None::<Value>),
        },
        SqlParam::Text(text) => Box::new(text.clone()),
        SqlParam::Integer(i) => Box::new(*i),
        SqlParam::Real(f) => Box::new(*f),
        SqlParam::Bool(b) => Box::new(*b),
        SqlParam::Json(value) => Box::new(value.clone()),
        SqlParam::Timestamp(ts) => Box::new(*ts),
        SqlParam::Vector(embedding) => Box::new(format_vector(embedding)),
        SqlParam::TextArray(items) => Box::new(items.clone()),
    }
}

/// Borrows boxed parameters in the form the driver takes.
pub fn param_refs(params: &[BoxedParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn decode_err(backend: &'static str, column: &str, e: impl std::fmt::Display) -> Error {
    Error::backend(
        "decode",
        backend,
        format!("malformed value in column '{column}': {e}"),
    )
}

/// Decodes one column by its schema type.
pub fn decode_value(
    row: &Row,
    index: usize,
    column: &Column,
    native_vectors: bool,
    backend: &'static str,
) -> Result<Value> {
    let err = |e: tokio_postgres::Error| decode_err(backend, column.name, e);
    Ok(match column.ty {
        ColumnType::Text => row
            .try_get::<_, Option<String>>(index)
            .map_err(err)?
            .map_or(Value::Null, Value::String),
        ColumnType::Integer => row
            .try_get::<_, Option<i64>>(index)
            .map_err(err)?
            .map_or(Value::Null, Value::from),
        ColumnType::Real => row
            .try_get::<_, Option<f64>>(index)
            .map_err(err)?
            .map_or(Value::Null, Value::from),
        ColumnType::Boolean => row
            .try_get::<_, Option<bool>>(index)
            .map_err(err)?
            .map_or(Value::Null, Value::Bool),
        ColumnType::Json => row
            .try_get::<_, Option<Value>>(index)
            .map_err(err)?
            .unwrap_or(Value::Null),
        ColumnType::Timestamp => row
            .try_get::<_, Option<DateTime<Utc>>>(index)
            .map_err(err)?
            .map_or(Value::Null, |ts| Value::String(format_timestamp(ts))),
        ColumnType::Vector if native_vectors => {
            match row.try_get::<_, Option<String>>(index).map_err(err)? {
                None => Value::Null,
                Some(text) => parse_vector(&text)
                    .map(|v| embedding_to_value(&v))
                    .ok_or_else(|| decode_err(backend, column.name, "bad vector literal"))?,
            }
        },
        ColumnType::Vector => row
            .try_get::<_, Option<Value>>(index)
            .map_err(err)?
            .unwrap_or(Value::Null),
    })
}

/// Decodes the leading `columns` of a row.
pub fn decode_row(
    row: &Row,
    columns: &[&'static Column],
    native_vectors: bool,
    backend: &'static str,
) -> Result<Record> {
    let mut record = Record::new();
    for (i, column) in columns.iter().enumerate() {
        record.insert(column.name, decode_value(row, i, column, native_vectors, backend)?);
    }
    Ok(record)
}

/// Decodes a row followed by a `_score` column.
pub fn decode_scored(
    row: &Row,
    columns: &[&'static Column],
    native_vectors: bool,
    backend: &'static str,
) -> Result<ScoredRecord> {
    let record = decode_row(row, columns, native_vectors, backend)?;
    let score: f64 = row
        .try_get(columns.len())
        .map_err(|e| decode_err(backend, "_score", e))?;
    #[allow(clippy::cast_possible_truncation)]
    let score = score as f32;
    Ok(ScoredRecord { record, score })
}

/// Maps a driver error onto the crate's error taxonomy.
pub fn map_error(operation: &str, backend: &'static str, err: &tokio_postgres::Error) -> Error {
    let Some(db) = err.as_db_error() else {
        return Error::connectivity(operation, backend, err);
    };
    let code = db.code();
    if *code == SqlState::UNIQUE_VIOLATION
        || *code == SqlState::FOREIGN_KEY_VIOLATION
        || *code == SqlState::NOT_NULL_VIOLATION
        || *code == SqlState::CHECK_VIOLATION
    {
        let field = db
            .column()
            .map(ToString::to_string)
            .or_else(|| db.detail().and_then(key_detail_field));
        return Error::constraint(operation, backend, field, db.message());
    }
    if *code == SqlState::UNDEFINED_FUNCTION && operation == "call_procedure" {
        return Error::validation(operation, backend, "name", db.message());
    }
    if *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
        || *code == SqlState::TOO_MANY_CONNECTIONS
    {
        return Error::connectivity(operation, backend, db.message());
    }
    Error::backend(operation, backend, db.message())
}

/// Maps a pool checkout failure.
pub fn map_pool_error(
    backend: &'static str,
    err: PoolError,
    max_size: usize,
    waited_ms: u64,
) -> Error {
    match err {
        PoolError::Timeout(_) => crate::storage::pool::exhausted(backend, max_size, waited_ms),
        PoolError::Backend(e) => map_error("acquire", backend, &e),
        other => Error::connectivity("acquire", backend, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_vector_params_follow_capability() {
        let native = to_sql(&SqlParam::Null(ColumnType::Vector), true);
        let fallback = to_sql(&SqlParam::Null(ColumnType::Vector), false);
        assert!(format!("{native:?}").contains("None"));
        assert!(format!("{fallback:?}").contains("None"));
        assert_eq!(param_refs(&[native, fallback]).len(), 2);
    }
}
