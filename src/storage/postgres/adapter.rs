//! [`StorageAdapter`] over PostgreSQL.

use super::VectorSupport;
use super::row::{self, BoxedParam};
use crate::models::schema::{LEDGER_TABLE, MIGRATION_FAILURES_TABLE};
use crate::models::{
    ApplyOutcome, KeywordQuery, MigrationFailure, MigrationRecord, Record, ScoredRecord,
    SearchMode, SearchResults, Table, UnitOfWork, VectorQuery, WriteContext, WriteOp,
    WriteOutcome,
};
use crate::storage::metrics::observe;
use crate::storage::migrations::Migration;
use crate::storage::pool::{self, PoolConfig, WaitQueue};
use crate::storage::query::{Predicate, Query, SqlBuilder, SqlStatement, quote};
use crate::storage::traits::{Capabilities, StorageAdapter};
use crate::storage::{
    check_procedure_name, check_vector_query, procedure_result, upsert_fields,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, GenericClient, Object, Pool, Runtime, Transaction};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio_postgres::NoTls;
use tracing::instrument;

/// Key for `pg_advisory_xact_lock`, serializing migration runners.
const MIGRATION_LOCK_KEY: i64 = 0x6b73_746f_7265;

/// Rows per `DELETE ... IN (...)` statement.
const DELETE_CHUNK: usize = 1_000;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// [`StorageAdapter`] over a PostgreSQL database, with or without pgvector.
///
/// Pooling uses `deadpool-postgres`. A [`WaitQueue`] in front of the pool
/// bounds the number of callers waiting for a connection.
pub struct PostgresAdapter {
    pool: Pool,
    waiters: WaitQueue,
    config: PoolConfig,
    sql: SqlBuilder,
    backend: &'static str,
    native: bool,
    dimensions: usize,
}

impl std::fmt::Debug for PostgresAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresAdapter")
            .field("backend", &self.backend)
            .field("dimensions", &self.dimensions)
            .field("status", &self.pool.status())
            .finish_non_exhaustive()
    }
}

/// Builds a deadpool config from a connection string.
///
/// The wait timeout is the configured acquire timeout. Connection creation
/// and recycling get 5 seconds each.
fn build_pool_config(url: &str, pool: &PoolConfig) -> Config {
    let mut cfg = Config::new();
    cfg.url = Some(url.to_string());
    cfg.pool = Some(deadpool_postgres::PoolConfig {
        max_size: pool.max_size.max(1),
        timeouts: deadpool_postgres::Timeouts {
            wait: Some(pool.acquire_timeout),
            create: Some(Duration::from_secs(5)),
            recycle: Some(Duration::from_secs(5)),
        },
        ..Default::default()
    });
    cfg.manager = Some(deadpool_postgres::ManagerConfig {
        recycling_method: deadpool_postgres::RecyclingMethod::Fast,
    });
    cfg
}

impl PostgresAdapter {
    /// Creates the pool and checks that the vector extension is available
    /// when `vectors` is [`VectorSupport::Native`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a malformed connection string or
    /// a missing pgvector extension, and a connectivity error if the server
    /// cannot be reached for the extension probe.
    pub async fn connect(
        url: &str,
        dimensions: usize,
        pool: PoolConfig,
        vectors: VectorSupport,
    ) -> Result<Self> {
        url.parse::<tokio_postgres::Config>()
            .map_err(|e| Error::Configuration(format!("invalid PostgreSQL connection string: {e}")))?;
        let pg_pool = build_pool_config(url, &pool)
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| Error::Configuration(format!("cannot create PostgreSQL pool: {e}")))?;
        let backend = vectors.backend();
        let native = vectors == VectorSupport::Native;
        let adapter = Self {
            pool: pg_pool,
            waiters: WaitQueue::new(pool.max_waiters, backend),
            config: pool,
            sql: SqlBuilder::postgres(native, backend),
            backend,
            native,
            dimensions,
        };
        if native && !adapter.vector_extension_available().await? {
            return Err(Error::Configuration(
                "the 'vector' extension is not available on this server; \
                 use the relational-no-vector backend instead"
                    .to_string(),
            ));
        }
        tracing::info!(backend, dimensions, max_size = pool.max_size, "PostgreSQL adapter ready");
        Ok(adapter)
    }

    async fn vector_extension_available(&self) -> Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_available_extensions WHERE name = 'vector')",
                &[],
            )
            .await
            .map_err(|e| row::map_error("connect", self.backend, &e))?;
        row.try_get(0)
            .map_err(|e| Error::backend("connect", self.backend, e))
    }

    /// Checks out a connection, joining the wait queue if none is idle.
    async fn client(&self) -> Result<Object> {
        pool::checkout(&self.pool, &self.waiters, self.config.max_size, |e, waited_ms| {
            row::map_pool_error(self.backend, e, self.config.max_size, waited_ms)
        })
        .await
    }

    const fn ctx(&self, operation: &'static str) -> WriteContext {
        WriteContext::new(operation, self.backend, self.dimensions)
    }

    fn params(&self, statement: &SqlStatement) -> Vec<BoxedParam> {
        statement
            .params
            .iter()
            .map(|p| row::to_sql(p, self.native))
            .collect()
    }

    async fn query_records<C: GenericClient + Sync>(
        &self,
        client: &C,
        operation: &str,
        statement: &SqlStatement,
    ) -> Result<Vec<Record>> {
        let params = self.params(statement);
        let rows = client
            .query(statement.sql.as_str(), &row::param_refs(&params))
            .await
            .map_err(|e| row::map_error(operation, self.backend, &e))?;
        rows.iter()
            .map(|r| row::decode_row(r, &statement.columns, self.native, self.backend))
            .collect()
    }

    async fn query_scored<C: GenericClient + Sync>(
        &self,
        client: &C,
        operation: &str,
        statement: &SqlStatement,
    ) -> Result<Vec<ScoredRecord>> {
        let params = self.params(statement);
        let rows = client
            .query(statement.sql.as_str(), &row::param_refs(&params))
            .await
            .map_err(|e| row::map_error(operation, self.backend, &e))?;
        rows.iter()
            .map(|r| row::decode_scored(r, &statement.columns, self.native, self.backend))
            .collect()
    }

    async fn execute<C: GenericClient + Sync>(
        &self,
        client: &C,
        operation: &str,
        statement: &SqlStatement,
    ) -> Result<u64> {
        let params = self.params(statement);
        client
            .execute(statement.sql.as_str(), &row::param_refs(&params))
            .await
            .map_err(|e| row::map_error(operation, self.backend, &e))
    }

    async fn fetch<C: GenericClient + Sync>(
        &self,
        client: &C,
        operation: &str,
        table: Table,
        id: &str,
    ) -> Result<Option<Record>> {
        let statement = self.sql.get_by_id(table, id)?;
        Ok(self
            .query_records(client, operation, &statement)
            .await?
            .into_iter()
            .next())
    }

    async fn insert_row<C: GenericClient + Sync>(
        &self,
        client: &C,
        operation: &str,
        table: Table,
        row: Record,
    ) -> Result<Record> {
        let statement = self.sql.insert(table, std::slice::from_ref(&row))?;
        self.execute(client, operation, &statement).await?;
        Ok(row)
    }

    /// JSON object columns merge in SQL, so no read is needed first.
    async fn update_row<C: GenericClient + Sync>(
        &self,
        client: &C,
        operation: &str,
        table: Table,
        id: &str,
        patch: &Record,
    ) -> Result<Option<Record>> {
        if patch.is_empty() {
            return self.fetch(client, operation, table, id).await;
        }
        let statement = self.sql.update(table, id, patch)?;
        Ok(self
            .query_records(client, operation, &statement)
            .await?
            .into_iter()
            .next())
    }

    async fn delete_ids<C: GenericClient + Sync>(
        &self,
        client: &C,
        operation: &str,
        table: Table,
        ids: &[String],
    ) -> Result<u64> {
        let mut deleted = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let statement = self.sql.delete_by_ids(table, chunk);
            deleted += self.execute(client, operation, &statement).await?;
        }
        Ok(deleted)
    }

    async fn upsert_row<C: GenericClient + Sync>(
        &self,
        client: &C,
        operation: &str,
        table: Table,
        supplied: &Record,
        row: Record,
    ) -> Result<Record> {
        let key = table.schema().conflict_key();
        let statement = self.sql.upsert(table, &row, &upsert_fields(table, supplied))?;
        self.execute(client, operation, &statement).await?;

        let key_value = row.get(key).cloned().unwrap_or(Value::Null);
        let lookup = Query::table(table)
            .filter(Predicate::equals(key, key_value))
            .limit(1);
        self.query_records(client, operation, &self.sql.select(&lookup)?)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::backend(operation, self.backend, "upserted row is not readable"))
    }

    async fn savepoint(&self, tx: &Transaction<'_>, statement: String) -> Result<()> {
        tx.batch_execute(&statement)
            .await
            .map_err(|e| row::map_error("apply", self.backend, &e))
    }

    fn apply_ops<'a>(
        &'a self,
        tx: &'a Transaction<'a>,
        ops: Vec<WriteOp>,
        depth: usize,
    ) -> BoxFuture<'a, Result<Vec<WriteOutcome>>> {
        Box::pin(async move {
            let ctx = self.ctx("apply");
            let mut outcomes = Vec::with_capacity(ops.len());
            for op in ops {
                let outcome = match op {
                    WriteOp::Create { table, record } => {
                        let row = table.schema().prepare_insert(record, &ctx)?;
                        WriteOutcome::Created(self.insert_row(tx, "apply", table, row).await?)
                    },
                    WriteOp::Update { table, id, patch } => {
                        let patch = table.schema().prepare_patch(patch, &ctx)?;
                        WriteOutcome::Updated(
                            self.update_row(tx, "apply", table, &id, &patch).await?,
                        )
                    },
                    WriteOp::Delete { table, id } => {
                        let deleted = self.delete_ids(tx, "apply", table, &[id]).await?;
                        WriteOutcome::Deleted(deleted > 0)
                    },
                    WriteOp::Upsert { table, record } => {
                        let row = table.schema().prepare_insert(record.clone(), &ctx)?;
                        WriteOutcome::Upserted(
                            self.upsert_row(tx, "apply", table, &record, row).await?,
                        )
                    },
                    WriteOp::Savepoint(group) => {
                        let name = format!("sp_{depth}");
                        self.savepoint(tx, format!("SAVEPOINT {name}")).await?;
                        match self.apply_ops(tx, group, depth + 1).await {
                            Ok(inner) => {
                                self.savepoint(tx, format!("RELEASE SAVEPOINT {name}"))
                                    .await?;
                                WriteOutcome::Group(inner)
                            },
                            Err(e) => {
                                self.savepoint(
                                    tx,
                                    format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"),
                                )
                                .await?;
                                tracing::debug!(backend = self.backend, error = %e, "Savepoint rolled back");
                                WriteOutcome::RolledBack(Box::new(e))
                            },
                        }
                    },
                };
                outcomes.push(outcome);
            }
            Ok(outcomes)
        })
    }

    async fn table_exists<C: GenericClient + Sync>(
        &self,
        client: &C,
        operation: &str,
        name: &str,
    ) -> Result<bool> {
        let row = client
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&name])
            .await
            .map_err(|e| row::map_error(operation, self.backend, &e))?;
        row.try_get(0)
            .map_err(|e| Error::backend(operation, self.backend, e))
    }

    async fn apply_changes(
        &self,
        tx: &Transaction<'_>,
        migration: &Migration,
        checksum: &str,
    ) -> Result<ApplyOutcome> {
        let operation = "apply_migration";
        let map = |e: tokio_postgres::Error| row::map_error(operation, self.backend, &e);
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&MIGRATION_LOCK_KEY])
            .await
            .map_err(map)?;
        let applied: i64 = tx
            .query_one(self.sql.ledger_exists().as_str(), &[&migration.version])
            .await
            .map_err(map)?
            .try_get(0)
            .map_err(map)?;
        if applied > 0 {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        for change in &migration.changes {
            for sql in self.sql.ddl(change, self.dimensions) {
                tx.batch_execute(&sql).await.map_err(|e| Error::Migration {
                    version: migration.version.clone(),
                    cause: e
                        .as_db_error()
                        .map_or_else(|| e.to_string(), |db| db.message().to_string()),
                })?;
            }
        }
        let record = migration.ledger_record(checksum);
        tx.execute(
            self.sql.ledger_insert().as_str(),
            &[
                &record.version,
                &record.description,
                &record.checksum,
                &record.applied_at,
            ],
        )
        .await
        .map_err(map)?;
        Ok(ApplyOutcome::Applied(record))
    }

    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        observe(self.backend, operation, Instant::now(), f.await)
    }
}

#[async_trait]
impl StorageAdapter for PostgresAdapter {
    fn backend(&self) -> &'static str {
        self.backend
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_vectors: self.native,
            transactional_batches: true,
            transactional_ddl: true,
            savepoints: true,
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[instrument(skip(self), fields(backend = self.backend, table = %table))]
    async fn get(&self, table: Table, id: &str) -> Result<Option<Record>> {
        self.run("get", async {
            let client = self.client().await?;
            self.fetch(&client, "get", table, id).await
        })
        .await
    }

    #[instrument(skip(self, query), fields(backend = self.backend, table = %query.table))]
    async fn list(&self, query: Query) -> Result<Vec<Record>> {
        let statement = self.sql.select(&query.checked(self.backend)?)?;
        self.run("list", async {
            let client = self.client().await?;
            self.query_records(&client, "list", &statement).await
        })
        .await
    }

    async fn count(&self, query: Query) -> Result<u64> {
        let statement = self.sql.count(&query.checked(self.backend)?)?;
        self.run("count", async {
            let client = self.client().await?;
            let params = self.params(&statement);
            let row = client
                .query_one(statement.sql.as_str(), &row::param_refs(&params))
                .await
                .map_err(|e| row::map_error("count", self.backend, &e))?;
            let count: i64 = row
                .try_get(0)
                .map_err(|e| Error::backend("count", self.backend, e))?;
            Ok(count.unsigned_abs())
        })
        .await
    }

    #[instrument(skip(self, record), fields(backend = self.backend, table = %table))]
    async fn create(&self, table: Table, record: Record) -> Result<Record> {
        let row = table.schema().prepare_insert(record, &self.ctx("create"))?;
        self.run("create", async {
            let client = self.client().await?;
            self.insert_row(&client, "create", table, row).await
        })
        .await
    }

    #[instrument(skip(self, records), fields(backend = self.backend, table = %table, count = records.len()))]
    async fn create_batch(&self, table: Table, records: Vec<Record>) -> Result<Vec<Record>> {
        let ctx = self.ctx("create_batch");
        let rows = records
            .into_iter()
            .map(|r| table.schema().prepare_insert(r, &ctx))
            .collect::<Result<Vec<_>>>()?;
        if rows.is_empty() {
            return Ok(rows);
        }
        let statement = self.sql.insert(table, &rows)?;
        self.run("create_batch", async {
            let client = self.client().await?;
            self.execute(&client, "create_batch", &statement).await?;
            Ok(rows)
        })
        .await
    }

    #[instrument(skip(self, patch), fields(backend = self.backend, table = %table))]
    async fn update(&self, table: Table, id: &str, patch: Record) -> Result<Option<Record>> {
        let patch = table.schema().prepare_patch(patch, &self.ctx("update"))?;
        self.run("update", async {
            let client = self.client().await?;
            self.update_row(&client, "update", table, id, &patch).await
        })
        .await
    }

    #[instrument(skip(self), fields(backend = self.backend, table = %table))]
    async fn delete(&self, table: Table, id: &str) -> Result<bool> {
        self.run("delete", async {
            let client = self.client().await?;
            let ids = [id.to_string()];
            Ok(self.delete_ids(&client, "delete", table, &ids).await? > 0)
        })
        .await
    }

    #[instrument(skip(self, query), fields(backend = self.backend, table = %query.table))]
    async fn delete_matching(&self, query: Query) -> Result<u64> {
        let query = query.checked(self.backend)?;
        let statement = self.sql.select_ids(&query)?;
        self.run("delete_matching", async {
            let mut client = self.client().await?;
            let tx = client
                .transaction()
                .await
                .map_err(|e| row::map_error("delete_matching", self.backend, &e))?;
            let ids: Vec<String> = self
                .query_records(&tx, "delete_matching", &statement)
                .await?
                .iter()
                .filter_map(Record::id)
                .map(ToString::to_string)
                .collect();
            let deleted = self
                .delete_ids(&tx, "delete_matching", query.table, &ids)
                .await?;
            tx.commit()
                .await
                .map_err(|e| row::map_error("delete_matching", self.backend, &e))?;
            Ok(deleted)
        })
        .await
    }

    #[instrument(skip(self, record), fields(backend = self.backend, table = %table))]
    async fn upsert(&self, table: Table, record: Record) -> Result<Record> {
        let row = table
            .schema()
            .prepare_insert(record.clone(), &self.ctx("upsert"))?;
        self.run("upsert", async {
            let client = self.client().await?;
            self.upsert_row(&client, "upsert", table, &record, row).await
        })
        .await
    }

    #[instrument(skip(self, unit), fields(backend = self.backend, ops = unit.len()))]
    async fn apply(&self, unit: UnitOfWork) -> Result<Vec<WriteOutcome>> {
        self.run("apply", async {
            let mut client = self.client().await?;
            let tx = client
                .transaction()
                .await
                .map_err(|e| row::map_error("apply", self.backend, &e))?;
            let outcomes = self.apply_ops(&tx, unit.into_ops(), 0).await?;
            tx.commit()
                .await
                .map_err(|e| row::map_error("apply", self.backend, &e))?;
            Ok(outcomes)
        })
        .await
    }

    #[instrument(skip(self, query), fields(backend = self.backend, table = %query.collection))]
    async fn search_by_vector(&self, query: VectorQuery) -> Result<SearchResults> {
        check_vector_query(&query, self.backend, self.dimensions)?;
        if !self.native {
            return Err(Error::Configuration(format!(
                "{} has no native vector search; configure a vector fallback strategy",
                self.backend
            )));
        }
        let scoped = Query::table(query.collection)
            .filter_by(&query.filters)
            .checked(self.backend)?;
        if query.top_k == 0 {
            return Ok(SearchResults::new(Vec::new(), SearchMode::Native));
        }
        let statement = self
            .sql
            .vector_search(&scoped, &query.embedding, query.top_k)?;
        self.run("search_by_vector", async {
            let client = self.client().await?;
            let hits = self
                .query_scored(&client, "search_by_vector", &statement)
                .await?;
            Ok(SearchResults::new(hits, SearchMode::Native))
        })
        .await
    }

    #[instrument(skip(self, query), fields(backend = self.backend, table = %query.collection))]
    async fn keyword_search(&self, query: KeywordQuery) -> Result<Vec<ScoredRecord>> {
        let scoped = Query::table(query.collection)
            .filter_by(&query.filters)
            .checked(self.backend)?;
        let terms = query.terms();
        let statement = self.sql.keyword_search(&scoped, &terms, query.top_k)?;
        if terms.is_empty() || query.top_k == 0 {
            return Ok(Vec::new());
        }
        self.run("keyword_search", async {
            let client = self.client().await?;
            self.query_scored(&client, "keyword_search", &statement)
                .await
        })
        .await
    }

    /// Calls `name(jsonb)` and returns each result row as JSON.
    #[instrument(skip(self, params), fields(backend = self.backend))]
    async fn call_procedure(&self, name: &str, params: Value) -> Result<Vec<Record>> {
        check_procedure_name(name, self.backend)?;
        let sql = format!("SELECT to_jsonb(r) FROM {}($1::jsonb) AS r", quote(name));
        self.run("call_procedure", async {
            let client = self.client().await?;
            let rows = client
                .query(sql.as_str(), &[&params])
                .await
                .map_err(|e| row::map_error("call_procedure", self.backend, &e))?;
            let values = rows
                .iter()
                .map(|r| r.try_get::<_, Value>(0))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::backend("call_procedure", self.backend, e))?;
            Ok(procedure_result(name, Value::Array(values)))
        })
        .await
    }

    async fn ensure_ledger(&self) -> Result<()> {
        self.run("ensure_ledger", async {
            let mut client = self.client().await?;
            let map = |e: tokio_postgres::Error| row::map_error("ensure_ledger", self.backend, &e);
            let tx = client.transaction().await.map_err(map)?;
            tx.execute("SELECT pg_advisory_xact_lock($1)", &[&MIGRATION_LOCK_KEY])
                .await
                .map_err(map)?;
            tx.batch_execute(&self.sql.ledger_ddl()).await.map_err(map)?;
            tx.batch_execute(&self.sql.failures_ddl()).await.map_err(map)?;
            tx.commit().await.map_err(map)
        })
        .await
    }

    async fn record_migration_failure(&self, failure: &MigrationFailure) -> Result<()> {
        self.run("record_migration_failure", async {
            let client = self.client().await?;
            let map = |e: tokio_postgres::Error| {
                row::map_error("record_migration_failure", self.backend, &e)
            };
            client.batch_execute(&self.sql.failures_ddl()).await.map_err(map)?;
            client
                .execute(
                    self.sql.failures_upsert().as_str(),
                    &[&failure.version, &failure.cause, &failure.failed_at],
                )
                .await
                .map(|_| ())
                .map_err(map)
        })
        .await
    }

    async fn migration_failures(&self) -> Result<Vec<MigrationFailure>> {
        self.run("migration_failures", async {
            let client = self.client().await?;
            if !self
                .table_exists(&client, "migration_failures", MIGRATION_FAILURES_TABLE)
                .await?
            {
                return Ok(Vec::new());
            }
            let map =
                |e: tokio_postgres::Error| row::map_error("migration_failures", self.backend, &e);
            let rows = client
                .query(self.sql.failures_select().as_str(), &[])
                .await
                .map_err(map)?;
            rows.iter()
                .map(|r| -> Result<MigrationFailure> {
                    Ok(MigrationFailure {
                        version: r.try_get(0).map_err(map)?,
                        cause: r.try_get(1).map_err(map)?,
                        failed_at: r.try_get::<_, DateTime<Utc>>(2).map_err(map)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn clear_migration_failure(&self, version: &str) -> Result<bool> {
        self.run("clear_migration_failure", async {
            let client = self.client().await?;
            if !self
                .table_exists(&client, "clear_migration_failure", MIGRATION_FAILURES_TABLE)
                .await?
            {
                return Ok(false);
            }
            client
                .execute(self.sql.failures_delete().as_str(), &[&version])
                .await
                .map(|n| n > 0)
                .map_err(|e| row::map_error("clear_migration_failure", self.backend, &e))
        })
        .await
    }

    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>> {
        self.run("applied_migrations", async {
            let client = self.client().await?;
            if !self.table_exists(&client, "applied_migrations", LEDGER_TABLE).await? {
                return Ok(Vec::new());
            }
            let map =
                |e: tokio_postgres::Error| row::map_error("applied_migrations", self.backend, &e);
            let rows = client
                .query(self.sql.ledger_select().as_str(), &[])
                .await
                .map_err(map)?;
            rows.iter()
                .map(|r| -> Result<MigrationRecord> {
                    Ok(MigrationRecord {
                        version: r.try_get(0).map_err(map)?,
                        description: r.try_get(1).map_err(map)?,
                        checksum: r.try_get(2).map_err(map)?,
                        applied_at: r.try_get::<_, DateTime<Utc>>(3).map_err(map)?,
                    })
                })
                .collect()
        })
        .await
    }

    #[instrument(skip(self, migration, checksum), fields(backend = self.backend, version = %migration.version))]
    async fn apply_migration(&self, migration: &Migration, checksum: &str) -> Result<ApplyOutcome> {
        self.run("apply_migration", async {
            let mut client = self.client().await?;
            let tx = client
                .transaction()
                .await
                .map_err(|e| row::map_error("apply_migration", self.backend, &e))?;
            let outcome = self.apply_changes(&tx, migration, checksum).await?;
            tx.commit()
                .await
                .map_err(|e| row::map_error("apply_migration", self.backend, &e))?;
            Ok(outcome)
        })
        .await
    }

    async fn health_check(&self) -> Result<()> {
        self.run("health_check", async {
            let client = self.client().await?;
            client
                .query_one("SELECT 1", &[])
                .await
                .map(|_| ())
                .map_err(|e| Error::connectivity("health_check", self.backend, e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::storage::migrations::MigrationTracker;
    use serde_json::json;
    use std::env;

    /// Gets test database URL from environment or skips test.
    fn get_test_db_url() -> Option<String> {
        env::var("KSTORE_TEST_POSTGRES_URL").ok()
    }

    #[test]
    fn test_build_pool_config() {
        let pool = PoolConfig::default()
            .with_max_size(7)
            .with_acquire_timeout(Duration::from_millis(250));
        let cfg = build_pool_config("postgres://u:p@localhost/db", &pool);
        let pool_cfg = cfg.pool.unwrap();
        assert_eq!(pool_cfg.max_size, 7);
        assert_eq!(pool_cfg.timeouts.wait, Some(Duration::from_millis(250)));
        assert_eq!(cfg.url.as_deref(), Some("postgres://u:p@localhost/db"));
    }

    #[tokio::test]
    async fn test_malformed_url_is_configuration_error() {
        let err = PostgresAdapter::connect(
            "postgres://host:notaport/db",
            3,
            PoolConfig::default(),
            VectorSupport::Fallback,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_crud_against_live_server() {
        let Some(url) = get_test_db_url() else {
            eprintln!("Skipping: KSTORE_TEST_POSTGRES_URL not set");
            return;
        };
        let adapter = PostgresAdapter::connect(&url, 3, PoolConfig::default(), VectorSupport::Fallback)
            .await
            .unwrap();
        MigrationTracker::builtin(3).unwrap().run(&adapter).await.unwrap();

        let key = format!("pg-test-{}", uuid::Uuid::new_v4());
        let first = adapter
            .upsert(Table::Settings, Record::new().with("key", key.as_str()).with("value", "a"))
            .await
            .unwrap();
        let again = adapter
            .upsert(Table::Settings, Record::new().with("key", key.as_str()).with("value", "a"))
            .await
            .unwrap();
        assert_eq!(first, again);

        let dup = adapter
            .create(Table::Settings, Record::new().with("key", key.as_str()))
            .await
            .unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(dup.field(), Some("key"));

        let src = adapter
            .create(Table::Sources, Record::new().with("metadata", json!({"a": 1})))
            .await
            .unwrap();
        let merged = adapter
            .update(Table::Sources, src.id().unwrap(), Record::new().with("metadata", json!({"b": 2})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.get("metadata"), Some(&json!({"a": 1, "b": 2})));
        assert!(adapter.delete(Table::Sources, src.id().unwrap()).await.unwrap());
        assert!(adapter.delete(Table::Settings, first.id().unwrap()).await.unwrap());
    }
}
