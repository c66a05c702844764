//! Embedded single-file backend.
//!
//! ## Module Structure
//!
//! - [`connection`]: [`SqliteManager`], pragmas and driver error mapping
//! - [`row`]: parameter binding and typed row decoding
//!
//! ## Concurrency Model
//!
//! Connections come from a bounded deadpool pool fronted by a
//! [`WaitQueue`]. Every call checks one out on the async side and moves it
//! into `spawn_blocking`, so a cancelled caller still returns the connection
//! when the blocking task finishes.
//! WAL mode gives concurrent readers; writers take `BEGIN IMMEDIATE` and
//! wait on `busy_timeout`.
//!
//! An in-memory database has a single connection, so its pool holds one
//! slot regardless of configuration.
//!
//! ## Vectors
//!
//! There is no native similarity search. Wrap the adapter in
//! [`VectorFallback`](crate::storage::VectorFallback).

mod connection;
mod row;

pub use connection::{SharedConnection, SqliteManager, configure_connection};

use crate::models::merge::merge_record;
use crate::models::schema::{LEDGER_TABLE, MIGRATION_FAILURES_TABLE, format_timestamp};
use crate::models::{
    ApplyOutcome, KeywordQuery, MigrationFailure, MigrationRecord, Record, ScoredRecord, SearchResults,
    Table, UnitOfWork, VectorQuery, WriteContext, WriteOp, WriteOutcome,
};
use crate::storage::metrics::observe;
use crate::storage::migrations::Migration;
use crate::storage::pool::{self, PoolConfig, WaitQueue, acquire_lock};
use crate::storage::query::{Predicate, Query, SqlBuilder, SqlParam, SqlStatement};
use crate::storage::traits::{Capabilities, StorageAdapter};
use crate::storage::{check_procedure_name, check_vector_query, procedure_rows, upsert_fields};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use connection::map_error;
use deadpool::Runtime;
use deadpool::managed::{Object, Pool, PoolError};
use rusqlite::{Connection, TransactionBehavior};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::instrument;

pub(crate) const BACKEND: &str = "embedded-file";

/// Rows per `DELETE ... IN (...)` statement.
const DELETE_CHUNK: usize = 500;

const SQL: SqlBuilder = SqlBuilder::sqlite();

/// [`StorageAdapter`] over an embedded `SQLite` database.
pub struct SqliteAdapter {
    pool: Pool<SqliteManager>,
    waiters: WaitQueue,
    config: PoolConfig,
    location: String,
    dimensions: usize,
    procedures: Arc<Mutex<HashMap<String, String>>>,
}

impl std::fmt::Debug for SqliteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAdapter")
            .field("location", &self.location)
            .field("dimensions", &self.dimensions)
            .field("status", &self.pool.status())
            .finish_non_exhaustive()
    }
}

impl SqliteAdapter {
    /// Opens a database file. `":memory:"` opens a private in-memory
    /// database instead.
    ///
    /// Connections open lazily; call [`health_check`](StorageAdapter::health_check)
    /// to surface a bad path early.
    ///
    /// # Errors
    ///
    /// Returns an error if an in-memory database cannot be created.
    pub fn open(path: impl Into<PathBuf>, dimensions: usize, pool: PoolConfig) -> Result<Self> {
        let path = path.into();
        if path.as_os_str() == ":memory:" {
            return Self::in_memory_with_pool(dimensions, pool);
        }
        Self::with_manager(SqliteManager::file(path), dimensions, pool)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` cannot create the database.
    pub fn in_memory(dimensions: usize) -> Result<Self> {
        Self::in_memory_with_pool(dimensions, PoolConfig::default())
    }

    fn in_memory_with_pool(dimensions: usize, pool: PoolConfig) -> Result<Self> {
        let manager = SqliteManager::memory()?;
        Self::with_manager(manager, dimensions, pool.with_max_size(1))
    }

    fn with_manager(manager: SqliteManager, dimensions: usize, config: PoolConfig) -> Result<Self> {
        let config = config.normalized();
        let location = manager.location();
        let pool = Pool::builder(manager)
            .max_size(config.max_size)
            .wait_timeout(Some(config.acquire_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| Error::Configuration(format!("cannot create SQLite pool: {e}")))?;
        Ok(Self {
            pool,
            waiters: WaitQueue::new(config.max_waiters, BACKEND),
            config,
            location,
            dimensions,
            procedures: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Opens `min_size` connections so the first callers find them idle.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection cannot be opened.
    pub async fn warm_up(&self) -> Result<()> {
        let mut opened = Vec::with_capacity(self.config.min_size);
        for _ in 0..self.config.min_size {
            opened.push(self.checkout().await?);
        }
        tracing::debug!(location = %self.location, opened = opened.len(), "Warmed SQLite pool");
        Ok(())
    }

    /// Registers a named SQL procedure for
    /// [`call_procedure`](StorageAdapter::call_procedure).
    ///
    /// The SQL may take one parameter, `?1`, bound to the JSON parameters as
    /// text. Read them with `json_extract(?1, '$.field')`.
    pub fn register_procedure(&self, name: impl Into<String>, sql: impl Into<String>) {
        acquire_lock(&self.procedures).insert(name.into(), sql.into());
    }

    /// The connection pool.
    #[must_use]
    pub const fn pool(&self) -> &Pool<SqliteManager> {
        &self.pool
    }

    async fn checkout(&self) -> Result<Object<SqliteManager>> {
        pool::checkout(&self.pool, &self.waiters, self.config.max_size, |err, waited_ms| {
            match err {
                PoolError::Timeout(_) => pool::exhausted(BACKEND, self.config.max_size, waited_ms),
                PoolError::Backend(e) => e,
                other => Error::connectivity("acquire", BACKEND, other),
            }
        })
        .await
    }

    const fn ctx(&self, operation: &'static str) -> WriteContext {
        WriteContext::new(operation, BACKEND, self.dimensions)
    }

    /// Runs blocking work on a pooled connection.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let start = Instant::now();
        let result = async {
            let pooled = self.checkout().await?;
            let shared = Arc::clone(&*pooled);
            let joined = tokio::task::spawn_blocking(move || {
                let mut conn = acquire_lock(&shared);
                f(&mut conn)
            })
            .await;
            match joined {
                Ok(result) => {
                    if result.as_ref().is_err_and(Error::is_retryable) {
                        drop(Object::take(pooled));
                    }
                    result
                },
                Err(join) => {
                    drop(Object::take(pooled));
                    Err(Error::backend(operation, BACKEND, join))
                },
            }
        }
        .await;
        observe(BACKEND, operation, start, result)
    }

    /// Runs blocking work inside an immediate transaction.
    async fn with_tx<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(operation, move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| map_error(operation, e))?;
            let value = f(&tx)?;
            tx.commit().map_err(|e| map_error(operation, e))?;
            Ok(value)
        })
        .await
    }
}

// ============================================================================
// Blocking operations. Callers own the transaction.
// ============================================================================

fn fetch(conn: &Connection, operation: &str, table: Table, id: &str) -> Result<Option<Record>> {
    let statement = SQL.get_by_id(table, id)?;
    Ok(row::query_records(conn, operation, &statement)?.into_iter().next())
}

fn insert_row(conn: &Connection, operation: &str, table: Table, row: Record) -> Result<Record> {
    let statement = SQL.insert(table, std::slice::from_ref(&row))?;
    row::execute(conn, operation, &statement)?;
    Ok(row)
}

fn update_row(
    conn: &Connection,
    operation: &str,
    table: Table,
    id: &str,
    patch: &Record,
) -> Result<Option<Record>> {
    let Some(stored) = fetch(conn, operation, table, id)? else {
        return Ok(None);
    };
    let merged = merge_record(&stored, patch);
    let changes: Record = patch
        .fields()
        .filter_map(|f| merged.get(f).map(|v| (f.to_string(), v.clone())))
        .collect();
    let statement = SQL.update(table, id, &changes)?;
    Ok(row::query_records(conn, operation, &statement)?.into_iter().next())
}

fn delete_ids(conn: &Connection, operation: &str, table: Table, ids: &[String]) -> Result<u64> {
    let mut deleted = 0;
    for chunk in ids.chunks(DELETE_CHUNK) {
        let statement = SQL.delete_by_ids(table, chunk);
        deleted += row::execute(conn, operation, &statement)? as u64;
    }
    Ok(deleted)
}

fn upsert_row(
    conn: &Connection,
    operation: &str,
    table: Table,
    supplied: &Record,
    row: Record,
) -> Result<Record> {
    let key = table.schema().conflict_key();
    let statement = SQL.upsert(table, &row, &upsert_fields(table, supplied))?;
    row::execute(conn, operation, &statement)?;

    let key_value = row.get(key).cloned().unwrap_or(Value::Null);
    let lookup = Query::table(table)
        .filter(Predicate::equals(key, key_value))
        .limit(1);
    row::query_records(conn, operation, &SQL.select(&lookup)?)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::backend(operation, BACKEND, "upserted row is not readable"))
}

fn apply_ops(
    conn: &Connection,
    ops: Vec<WriteOp>,
    dimensions: usize,
    depth: usize,
) -> Result<Vec<WriteOutcome>> {
    let ctx = WriteContext::new("apply", BACKEND, dimensions);
    let mut outcomes = Vec::with_capacity(ops.len());
    for op in ops {
        let outcome = match op {
            WriteOp::Create { table, record } => {
                let row = table.schema().prepare_insert(record, &ctx)?;
                WriteOutcome::Created(insert_row(conn, "apply", table, row)?)
            },
            WriteOp::Update { table, id, patch } => {
                let patch = table.schema().prepare_patch(patch, &ctx)?;
                WriteOutcome::Updated(update_row(conn, "apply", table, &id, &patch)?)
            },
            WriteOp::Delete { table, id } => {
                WriteOutcome::Deleted(delete_ids(conn, "apply", table, &[id])? > 0)
            },
            WriteOp::Upsert { table, record } => {
                let row = table.schema().prepare_insert(record.clone(), &ctx)?;
                WriteOutcome::Upserted(upsert_row(conn, "apply", table, &record, row)?)
            },
            WriteOp::Savepoint(group) => {
                let name = format!("sp_{depth}");
                let run = |sql: String| conn.execute_batch(&sql).map_err(|e| map_error("apply", e));
                run(format!("SAVEPOINT {name}"))?;
                match apply_ops(conn, group, dimensions, depth + 1) {
                    Ok(inner) => {
                        run(format!("RELEASE {name}"))?;
                        WriteOutcome::Group(inner)
                    },
                    Err(e) => {
                        run(format!("ROLLBACK TO {name}; RELEASE {name}"))?;
                        tracing::debug!(backend = BACKEND, error = %e, "Savepoint rolled back");
                        WriteOutcome::RolledBack(Box::new(e))
                    },
                }
            },
        };
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn table_exists(conn: &Connection, operation: &str, name: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |r| r.get(0),
        )
        .map_err(|e| map_error(operation, e))?;
    Ok(count > 0)
}

fn parse_timestamp(operation: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::backend(operation, BACKEND, e))
}

fn read_failures(conn: &Connection) -> Result<Vec<MigrationFailure>> {
    let operation = "migration_failures";
    if !table_exists(conn, operation, MIGRATION_FAILURES_TABLE)? {
        return Ok(Vec::new());
    }
    let mut statement = conn
        .prepare(&SQL.failures_select())
        .map_err(|e| map_error(operation, e))?;
    let rows = statement
        .query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
        })
        .map_err(|e| map_error(operation, e))?;
    let mut failures = Vec::new();
    for row in rows {
        let (version, cause, failed_at) = row.map_err(|e| map_error(operation, e))?;
        failures.push(MigrationFailure {
            version,
            cause,
            failed_at: parse_timestamp(operation, &failed_at)?,
        });
    }
    Ok(failures)
}

fn read_ledger(conn: &Connection) -> Result<Vec<MigrationRecord>> {
    if !table_exists(conn, "applied_migrations", LEDGER_TABLE)? {
        return Ok(Vec::new());
    }
    let mut statement = conn
        .prepare(&SQL.ledger_select())
        .map_err(|e| map_error("applied_migrations", e))?;
    let rows = statement
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .map_err(|e| map_error("applied_migrations", e))?;
    let mut records = Vec::new();
    for row in rows {
        let (version, description, checksum, applied_at) =
            row.map_err(|e| map_error("applied_migrations", e))?;
        records.push(MigrationRecord {
            version,
            description,
            checksum,
            applied_at: parse_timestamp("applied_migrations", &applied_at)?,
        });
    }
    Ok(records)
}

fn apply_changes(
    conn: &Connection,
    migration: &Migration,
    checksum: &str,
    dimensions: usize,
) -> Result<ApplyOutcome> {
    let applied: i64 = conn
        .query_row(&SQL.ledger_exists(), [&migration.version], |r| r.get(0))
        .map_err(|e| map_error("apply_migration", e))?;
    if applied > 0 {
        return Ok(ApplyOutcome::AlreadyApplied);
    }
    for change in &migration.changes {
        for sql in SQL.ddl(change, dimensions) {
            conn.execute_batch(&sql).map_err(|e| Error::Migration {
                version: migration.version.clone(),
                cause: e.to_string(),
            })?;
        }
    }
    let record = migration.ledger_record(checksum);
    conn.execute(
        &SQL.ledger_insert(),
        rusqlite::params![
            record.version,
            record.description,
            record.checksum,
            format_timestamp(record.applied_at)
        ],
    )
    .map_err(|e| map_error("apply_migration", e))?;
    Ok(ApplyOutcome::Applied(record))
}

fn run_procedure(conn: &Connection, name: &str, sql: &str, params: &Value) -> Result<Vec<Record>> {
    let prepared = conn.prepare(sql).map_err(|e| map_error("call_procedure", e))?;
    let bound = match prepared.parameter_count() {
        0 => Vec::new(),
        1 => vec![SqlParam::Text(params.to_string())],
        n => {
            return Err(Error::validation(
                "call_procedure",
                BACKEND,
                "name",
                format!("procedure '{name}' declares {n} parameters, expected at most 1"),
            ));
        },
    };
    drop(prepared);
    let statement = SqlStatement {
        sql: sql.to_string(),
        params: bound,
        columns: Vec::new(),
        scored: false,
    };
    row::query_with(conn, "call_procedure", &statement, row::decode_dynamic)
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_vectors: false,
            transactional_batches: true,
            transactional_ddl: true,
            savepoints: true,
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[instrument(skip(self), fields(backend = BACKEND, table = %table))]
    async fn get(&self, table: Table, id: &str) -> Result<Option<Record>> {
        let id = id.to_string();
        self.with_conn("get", move |conn| fetch(conn, "get", table, &id))
            .await
    }

    #[instrument(skip(self, query), fields(backend = BACKEND, table = %query.table))]
    async fn list(&self, query: Query) -> Result<Vec<Record>> {
        let statement = SQL.select(&query.checked(BACKEND)?)?;
        self.with_conn("list", move |conn| {
            row::query_records(conn, "list", &statement)
        })
        .await
    }

    async fn count(&self, query: Query) -> Result<u64> {
        let statement = SQL.count(&query.checked(BACKEND)?)?;
        self.with_conn("count", move |conn| {
            let counts = row::query_with(conn, "count", &statement, |r| {
                r.get::<_, i64>(0).map_err(|e| map_error("count", e))
            })?;
            Ok(counts.first().copied().unwrap_or(0).unsigned_abs())
        })
        .await
    }

    #[instrument(skip(self, record), fields(backend = BACKEND, table = %table))]
    async fn create(&self, table: Table, record: Record) -> Result<Record> {
        let row = table.schema().prepare_insert(record, &self.ctx("create"))?;
        self.with_conn("create", move |conn| insert_row(conn, "create", table, row))
            .await
    }

    #[instrument(skip(self, records), fields(backend = BACKEND, table = %table, count = records.len()))]
    async fn create_batch(&self, table: Table, records: Vec<Record>) -> Result<Vec<Record>> {
        let ctx = self.ctx("create_batch");
        let rows = records
            .into_iter()
            .map(|r| table.schema().prepare_insert(r, &ctx))
            .collect::<Result<Vec<_>>>()?;
        if rows.is_empty() {
            return Ok(rows);
        }
        self.with_tx("create_batch", move |conn| {
            rows.into_iter()
                .map(|row| insert_row(conn, "create_batch", table, row))
                .collect()
        })
        .await
    }

    #[instrument(skip(self, patch), fields(backend = BACKEND, table = %table))]
    async fn update(&self, table: Table, id: &str, patch: Record) -> Result<Option<Record>> {
        let patch = table.schema().prepare_patch(patch, &self.ctx("update"))?;
        let id = id.to_string();
        self.with_tx("update", move |conn| {
            update_row(conn, "update", table, &id, &patch)
        })
        .await
    }

    #[instrument(skip(self), fields(backend = BACKEND, table = %table))]
    async fn delete(&self, table: Table, id: &str) -> Result<bool> {
        let ids = vec![id.to_string()];
        self.with_conn("delete", move |conn| {
            Ok(delete_ids(conn, "delete", table, &ids)? > 0)
        })
        .await
    }

    #[instrument(skip(self, query), fields(backend = BACKEND, table = %query.table))]
    async fn delete_matching(&self, query: Query) -> Result<u64> {
        let query = query.checked(BACKEND)?;
        let statement = SQL.select_ids(&query)?;
        self.with_tx("delete_matching", move |conn| {
            let ids: Vec<String> = row::query_records(conn, "delete_matching", &statement)?
                .iter()
                .filter_map(Record::id)
                .map(ToString::to_string)
                .collect();
            delete_ids(conn, "delete_matching", query.table, &ids)
        })
        .await
    }

    #[instrument(skip(self, record), fields(backend = BACKEND, table = %table))]
    async fn upsert(&self, table: Table, record: Record) -> Result<Record> {
        let row = table
            .schema()
            .prepare_insert(record.clone(), &self.ctx("upsert"))?;
        self.with_tx("upsert", move |conn| {
            upsert_row(conn, "upsert", table, &record, row)
        })
        .await
    }

    #[instrument(skip(self, unit), fields(backend = BACKEND, ops = unit.len()))]
    async fn apply(&self, unit: UnitOfWork) -> Result<Vec<WriteOutcome>> {
        let dimensions = self.dimensions;
        self.with_tx("apply", move |conn| {
            apply_ops(conn, unit.into_ops(), dimensions, 0)
        })
        .await
    }

    async fn search_by_vector(&self, query: VectorQuery) -> Result<SearchResults> {
        check_vector_query(&query, BACKEND, self.dimensions)?;
        Err(Error::Configuration(format!(
            "{BACKEND} has no native vector search; configure a vector fallback strategy"
        )))
    }

    #[instrument(skip(self, query), fields(backend = BACKEND, table = %query.collection))]
    async fn keyword_search(&self, query: KeywordQuery) -> Result<Vec<ScoredRecord>> {
        let scoped = Query::table(query.collection)
            .filter_by(&query.filters)
            .checked(BACKEND)?;
        let terms = query.terms();
        let statement = SQL.keyword_search(&scoped, &terms, query.top_k)?;
        if terms.is_empty() || query.top_k == 0 {
            return Ok(Vec::new());
        }
        self.with_conn("keyword_search", move |conn| {
            row::query_scored(conn, "keyword_search", &statement)
        })
        .await
    }

    #[instrument(skip(self, params), fields(backend = BACKEND))]
    async fn call_procedure(&self, name: &str, params: Value) -> Result<Vec<Record>> {
        check_procedure_name(name, BACKEND)?;
        let Some(sql) = acquire_lock(&self.procedures).get(name).cloned() else {
            return Err(Error::validation(
                "call_procedure",
                BACKEND,
                "name",
                format!("unknown procedure '{name}'"),
            ));
        };
        let name = name.to_string();
        let rows = self
            .with_conn("call_procedure", move |conn| {
                run_procedure(conn, &name, &sql, &params)
            })
            .await?;
        Ok(procedure_rows(Value::Array(
            rows.into_iter().map(Value::from).collect(),
        )))
    }

    async fn ensure_ledger(&self) -> Result<()> {
        self.with_conn("ensure_ledger", |conn| {
            conn.execute_batch(&SQL.ledger_ddl())
                .and_then(|()| conn.execute_batch(&SQL.failures_ddl()))
                .map_err(|e| map_error("ensure_ledger", e))
        })
        .await
    }

    async fn record_migration_failure(&self, failure: &MigrationFailure) -> Result<()> {
        let failure = failure.clone();
        self.with_conn("record_migration_failure", move |conn| {
            conn.execute_batch(&SQL.failures_ddl())
                .and_then(|()| {
                    conn.execute(
                        &SQL.failures_upsert(),
                        rusqlite::params![
                            failure.version,
                            failure.cause,
                            format_timestamp(failure.failed_at)
                        ],
                    )
                })
                .map(|_| ())
                .map_err(|e| map_error("record_migration_failure", e))
        })
        .await
    }

    async fn migration_failures(&self) -> Result<Vec<MigrationFailure>> {
        self.with_conn("migration_failures", |conn| read_failures(conn))
            .await
    }

    async fn clear_migration_failure(&self, version: &str) -> Result<bool> {
        let version = version.to_string();
        self.with_conn("clear_migration_failure", move |conn| {
            if !table_exists(conn, "clear_migration_failure", MIGRATION_FAILURES_TABLE)? {
                return Ok(false);
            }
            conn.execute(&SQL.failures_delete(), [&version])
                .map(|n| n > 0)
                .map_err(|e| map_error("clear_migration_failure", e))
        })
        .await
    }

    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>> {
        self.with_conn("applied_migrations", |conn| read_ledger(conn))
            .await
    }

    #[instrument(skip(self, migration, checksum), fields(backend = BACKEND, version = %migration.version))]
    async fn apply_migration(&self, migration: &Migration, checksum: &str) -> Result<ApplyOutcome> {
        let migration = migration.clone();
        let checksum = checksum.to_string();
        let dimensions = self.dimensions;
        self.with_tx("apply_migration", move |conn| {
            apply_changes(conn, &migration, &checksum, dimensions)
        })
        .await
    }

    async fn health_check(&self) -> Result<()> {
        self.with_conn("health_check", |conn| {
            conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
                .map(|_| ())
                .map_err(|e| Error::connectivity("health_check", BACKEND, e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::models::{EMBEDDING_FIELD, VectorRecord};
    use crate::storage::migrations::{MigrationTracker, SchemaChange};
    use crate::storage::query::Direction;
    use serde_json::json;

    async fn migrated() -> SqliteAdapter {
        let adapter = SqliteAdapter::in_memory(3).unwrap();
        MigrationTracker::builtin(3).unwrap().run(&adapter).await.unwrap();
        adapter
    }

    async fn project(adapter: &SqliteAdapter) -> String {
        adapter
            .create(Table::Projects, Record::new().with("title", "Docs"))
            .await
            .unwrap()
            .id()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let adapter = migrated().await;
        let pid = project(&adapter).await;
        let task = adapter
            .create(
                Table::Tasks,
                Record::new()
                    .with("project_id", pid.as_str())
                    .with("title", "Write")
                    .with("sources", json!([{"url": "u"}])),
            )
            .await
            .unwrap();
        let fetched = adapter
            .get(Table::Tasks, task.id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, task);
        assert_eq!(fetched.get_str("status"), Some("todo"));
        assert_eq!(fetched.get_bool("archived"), Some(false));
    }

    #[tokio::test]
    async fn test_update_merges_json_objects() {
        let adapter = migrated().await;
        let src = adapter
            .create(
                Table::Sources,
                Record::new().with("metadata", json!({"a": 1, "b": {"x": 1}})),
            )
            .await
            .unwrap();
        let updated = adapter
            .update(
                Table::Sources,
                src.id().unwrap(),
                Record::new().with("metadata", json!({"b": {"y": 2}, "c": 3})),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            updated.get("metadata"),
            Some(&json!({"a": 1, "b": {"y": 2}, "c": 3}))
        );
        assert!(adapter.update(Table::Sources, "missing", Record::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unique_key_violation_names_field() {
        let adapter = migrated().await;
        let setting = Record::new().with("key", "theme");
        adapter.create(Table::Settings, setting.clone()).await.unwrap();
        let err = adapter.create(Table::Settings, setting).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(err.field(), Some("key"));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let adapter = migrated().await;
        let setting = Record::new().with("key", "theme").with("value", "dark");
        let first = adapter.upsert(Table::Settings, setting.clone()).await.unwrap();
        let second = adapter.upsert(Table::Settings, setting).await.unwrap();
        assert_eq!(first, second);

        let changed = adapter
            .upsert(Table::Settings, Record::new().with("key", "theme").with("value", "light"))
            .await
            .unwrap();
        assert_eq!(changed.id(), first.id());
        assert_eq!(changed.get_str("value"), Some("light"));
    }

    #[tokio::test]
    async fn test_delete_cascades_through_foreign_keys() {
        let adapter = migrated().await;
        let pid = project(&adapter).await;
        adapter
            .create(Table::Tasks, Record::new().with("project_id", pid.as_str()).with("title", "t"))
            .await
            .unwrap();
        assert!(adapter.delete(Table::Projects, &pid).await.unwrap());
        assert_eq!(adapter.count(Query::table(Table::Tasks)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_rolls_back_on_constraint_failure() {
        let adapter = migrated().await;
        let rows = vec![
            Record::new().with("key", "a"),
            Record::new().with("key", "a"),
        ];
        let err = adapter.create_batch(Table::Settings, rows).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(adapter.count(Query::table(Table::Settings)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_savepoint_keeps_outer_writes() {
        let adapter = migrated().await;
        let unit = UnitOfWork::new()
            .create(Table::Projects, Record::new().with("id", "p1").with("title", "kept"))
            .savepoint(
                UnitOfWork::new()
                    .create(Table::Projects, Record::new().with("id", "p2").with("title", "x"))
                    .create(Table::Tasks, Record::new().with("project_id", "nope").with("title", "t")),
            );
        let outcomes = adapter.apply(unit).await.unwrap();
        assert!(matches!(outcomes[1], WriteOutcome::RolledBack(_)));
        assert!(adapter.get(Table::Projects, "p1").await.unwrap().is_some());
        assert!(adapter.get(Table::Projects, "p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_orders_nulls_last_then_insertion() {
        let adapter = migrated().await;
        let pid = project(&adapter).await;
        for (title, feature) in [("a", Value::Null), ("b", json!("z")), ("c", json!("m"))] {
            adapter
                .create(
                    Table::Tasks,
                    Record::new()
                        .with("project_id", pid.as_str())
                        .with("title", title)
                        .with("feature", feature),
                )
                .await
                .unwrap();
        }
        let rows = adapter
            .list(Query::table(Table::Tasks).order_by("feature", Direction::Asc))
            .await
            .unwrap();
        let titles: Vec<_> = rows.iter().filter_map(|r| r.get_str("title")).collect();
        assert_eq!(titles, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_keyword_search_scores_terms() {
        let adapter = migrated().await;
        let src = adapter.create(Table::Sources, Record::new()).await.unwrap();
        let sid = src.id().unwrap();
        for content in ["rust async runtime", "async python", "nothing here"] {
            adapter
                .create(
                    Table::DocumentChunks,
                    VectorRecord::new(content, vec![1.0, 0.0, 0.0])
                        .with("source_id", sid)
                        .into_record(),
                )
                .await
                .unwrap();
        }
        let hits = adapter
            .keyword_search(KeywordQuery::new(Table::DocumentChunks, "Rust async", 10))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.get_str("content"), Some("rust async runtime"));
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!((hits[1].score - 0.5).abs() < 1e-6);
        assert!(!hits[0].record.contains(EMBEDDING_FIELD));
    }

    #[tokio::test]
    async fn test_vector_search_needs_fallback() {
        let adapter = migrated().await;
        let err = adapter
            .search_by_vector(VectorQuery::new(Table::DocumentChunks, vec![1.0, 0.0, 0.0], 3))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_registered_procedure_reads_json_params() {
        let adapter = migrated().await;
        adapter.register_procedure("echo", "SELECT json_extract(?1, '$.n') * 2 AS doubled");
        let rows = adapter.call_procedure("echo", json!({"n": 21})).await.unwrap();
        assert_eq!(rows[0].get_i64("doubled"), Some(42));
        let err = adapter.call_procedure("unknown", Value::Null).await.unwrap_err();
        assert_eq!(err.field(), Some("name"));
    }

    #[tokio::test]
    async fn test_failed_migration_rolls_back_ddl() {
        let adapter = migrated().await;
        let broken = Migration::new(
            "9999",
            "broken",
            vec![
                SchemaChange::RawSql {
                    sqlite: "CREATE TABLE scratch (x INTEGER)".into(),
                    postgres: String::new(),
                },
                SchemaChange::RawSql {
                    sqlite: "CREATE TABLE scratch (x INTEGER)".into(),
                    postgres: String::new(),
                },
            ],
        );
        adapter.ensure_ledger().await.unwrap();
        let err = adapter.apply_migration(&broken, "c").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Migration);
        let applied = adapter.applied_migrations().await.unwrap();
        assert!(applied.iter().all(|r| r.version != "9999"));

        let ok = Migration::new(
            "9999",
            "fixed",
            vec![SchemaChange::RawSql {
                sqlite: "CREATE TABLE scratch (x INTEGER)".into(),
                postgres: String::new(),
            }],
        );
        assert!(matches!(
            adapter.apply_migration(&ok, "c").await.unwrap(),
            ApplyOutcome::Applied(_)
        ));
    }

    #[tokio::test]
    async fn test_file_database_persists_across_adapters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let adapter = SqliteAdapter::open(&path, 3, PoolConfig::default()).unwrap();
            MigrationTracker::builtin(3).unwrap().run(&adapter).await.unwrap();
            adapter
                .create(Table::Projects, Record::new().with("id", "p").with("title", "t"))
                .await
                .unwrap();
        }
        let reopened = SqliteAdapter::open(&path, 3, PoolConfig::default()).unwrap();
        assert!(reopened.get(Table::Projects, "p").await.unwrap().is_some());
        assert!(!reopened.applied_migrations().await.unwrap().is_empty());
    }
}
