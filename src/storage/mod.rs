//! Storage layer.
//!
//! - [`traits`]: the [`StorageAdapter`] contract and the [`VectorIndex`] trait
//! - [`query`]: backend-neutral queries, rendered to SQL or evaluated in memory
//! - adapters: [`memory`], [`sqlite`], [`postgres`], [`managed`]
//! - [`vector`]: similarity helpers, hybrid merge and the fallback layer
//! - [`pool`] and [`resilience`]: bounded pools, retry and circuit breaking
//! - [`migrations`]: schema changes and the ledger-backed tracker

// Allow cast precision loss for score calculations where exact precision is not critical.
#![allow(clippy::cast_precision_loss)]
// Dropping pooled connections slightly early has no benefit.
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::match_same_arms)]

pub mod managed;
pub mod memory;
pub mod metrics;
pub mod migrations;
pub mod pool;
pub mod postgres;
pub mod query;
pub mod resilience;
pub mod sqlite;
pub mod traits;
pub mod vector;

pub use memory::InMemoryAdapter;
pub use migrations::{Migration, MigrationTracker, SchemaChange};
pub use pool::{PoolConfig, SlotLimiter};
pub use query::{Direction, Join, Predicate, Query};
pub use resilience::{CircuitBreaker, RetryPolicy};
pub use sqlite::SqliteAdapter;
pub use traits::{Capabilities, StorageAdapter, VectorIndex};
pub use vector::{InMemoryVectorIndex, VectorFallback};

use crate::models::schema::{CREATED_AT_FIELD, SEQ_FIELD, UPDATED_AT_FIELD, normalize_timestamp};
use crate::models::{
    ColumnType, EMBEDDING_FIELD, ID_FIELD, Record, Table, VectorQuery, embedding_to_value,
};
use crate::storage::query::parse_vector;
use crate::{Error, Result};
use serde_json::Value;

/// Checks a vector query against the collection and dimensionality.
pub(crate) fn check_vector_query(
    query: &VectorQuery,
    backend: &'static str,
    dimensions: usize,
) -> Result<()> {
    if !query.collection.is_vector_collection() {
        return Err(Error::validation(
            "search_by_vector",
            backend,
            "collection",
            format!("'{}' is not a vector collection", query.collection),
        ));
    }
    if query.embedding.len() != dimensions {
        return Err(Error::validation(
            "search_by_vector",
            backend,
            EMBEDDING_FIELD,
            format!(
                "expected {dimensions} dimensions, got {}",
                query.embedding.len()
            ),
        ));
    }
    Ok(())
}

/// Drops the embedding from a search hit.
pub(crate) fn without_embedding(mut record: Record) -> Record {
    record.remove(EMBEDDING_FIELD);
    record
}

/// Fields an upsert may overwrite on conflict.
pub(crate) fn upsert_fields(table: Table, record: &Record) -> Vec<String> {
    let key = table.schema().conflict_key();
    record
        .fields()
        .filter(|f| ![ID_FIELD, key, CREATED_AT_FIELD, UPDATED_AT_FIELD].contains(f))
        .map(ToString::to_string)
        .collect()
}

/// Shapes a procedure result into records.
///
/// Arrays become one record per element, objects become one record and
/// scalars are wrapped as `{"value": ...}`. `null` is no rows.
pub(crate) fn procedure_rows(value: Value) -> Vec<Record> {
    fn one(value: Value) -> Record {
        match value {
            Value::Object(map) => Record::from(map),
            other => Record::new().with("value", other),
        }
    }
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.into_iter().map(one).collect(),
        other => vec![one(other)],
    }
}

/// Decodes a row that arrived as JSON (`to_jsonb` or a REST body).
///
/// Timestamps are rewritten to the canonical UTC form, vector literals
/// become numeric arrays and the hidden sequence column is dropped.
pub(crate) fn decode_json_row(table: Table, value: Value) -> Record {
    let mut record = match value {
        Value::Object(map) => Record::from(map),
        other => Record::new().with("value", other),
    };
    record.remove(SEQ_FIELD);
    for column in table.schema().columns {
        let Some(value) = record.get_mut(column.name) else {
            continue;
        };
        let replacement = match (column.ty, &*value) {
            (ColumnType::Timestamp, Value::String(raw)) => {
                normalize_timestamp(raw).map(Value::String)
            },
            (ColumnType::Vector, Value::String(raw)) => {
                parse_vector(raw).map(|v| embedding_to_value(&v))
            },
            _ => None,
        };
        if let Some(replacement) = replacement {
            *value = replacement;
        }
    }
    record
}

/// Shapes a procedure result, decoding the rows of `match_<table>`
/// functions against the table schema.
pub(crate) fn procedure_result(name: &str, value: Value) -> Vec<Record> {
    let table = name.strip_prefix("match_").and_then(Table::parse);
    let mut rows = procedure_rows(value);
    if let Some(table) = table {
        for row in &mut rows {
            if let Some(record) = row.remove("record") {
                row.insert("record", Value::from(decode_json_row(table, record)));
            }
        }
    }
    rows
}

/// Column named in a PostgreSQL constraint detail, such as
/// `Key (key)=(theme) already exists.`
#[cfg_attr(not(any(feature = "postgres", feature = "managed")), allow(dead_code))]
pub(crate) fn key_detail_field(detail: &str) -> Option<String> {
    let start = detail.find("Key (")? + "Key (".len();
    let end = detail[start..].find(")=")? + start;
    detail[start..end]
        .split(',')
        .next()
        .map(|c| c.trim().to_string())
}

/// Validates a procedure name as a plain SQL identifier.
pub(crate) fn check_procedure_name(name: &str, backend: &'static str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::validation(
            "call_procedure",
            backend,
            "name",
            format!("'{name}' is not a valid procedure name"),
        ))
    }
}
