//! [`StorageAdapter`] over a PostgREST endpoint.

use super::rest::{self, Params};
use super::{BACKEND, EXEC_SQL_FUNCTION};
use crate::models::merge::merge_record;
use crate::models::schema::{
    LEDGER_TABLE, MIGRATION_FAILURES_TABLE, UPDATED_AT_FIELD, format_timestamp,
};
use crate::models::{
    ApplyOutcome, EMBEDDING_FIELD, ID_FIELD, KeywordQuery, MigrationFailure, MigrationRecord,
    Record, ScoredRecord, SearchMode, SearchResults, Table, UnitOfWork, VectorQuery,
    WriteContext, WriteOp, WriteOutcome, embedding_to_value,
};
use crate::storage::metrics::observe;
use crate::storage::migrations::Migration;
use crate::storage::pool::{PoolConfig, SlotLimiter};
use crate::storage::query::eval::{keyword_score, values_equal};
use crate::storage::query::{Predicate, Query, SqlBuilder};
use crate::storage::traits::{Capabilities, StorageAdapter};
use crate::storage::{
    check_procedure_name, check_vector_query, decode_json_row, procedure_result, upsert_fields,
    without_embedding,
};
use crate::{Error, ErrorKind, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Ids per `id=in.(...)` filter, keeping URLs short.
const DELETE_CHUNK: usize = 100;

/// Renders migration DDL; the service runs PostgreSQL with pgvector.
const SQL: SqlBuilder = SqlBuilder::postgres(true, BACKEND);

/// One row of a `match_<table>` response.
#[derive(Debug, Deserialize)]
struct MatchRow {
    record: Value,
    similarity: f64,
}

/// [`StorageAdapter`] over a managed PostgREST service.
///
/// Every call is one or more HTTP requests authenticated with the service
/// key. A [`SlotLimiter`] bounds concurrent requests.
pub struct ManagedAdapter {
    client: Client,
    base_url: Url,
    slots: SlotLimiter,
    dimensions: usize,
}

impl std::fmt::Debug for ManagedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedAdapter")
            .field("base_url", &self.base_url.as_str())
            .field("dimensions", &self.dimensions)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl ManagedAdapter {
    /// Creates an adapter for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a malformed URL, an empty key,
    /// or an HTTP client that cannot be built.
    pub fn new(
        base_url: &str,
        service_key: SecretString,
        dimensions: usize,
        pool: PoolConfig,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| Error::Configuration(format!("invalid service URL '{base_url}': {e}")))?;
        if service_key.expose_secret().trim().is_empty() {
            return Err(Error::Configuration(format!(
                "{BACKEND} requires a service key"
            )));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .default_headers(Self::auth_headers(&service_key)?)
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            slots: SlotLimiter::new(pool, BACKEND),
            dimensions,
        })
    }

    fn auth_headers(key: &SecretString) -> Result<HeaderMap> {
        let invalid = |e: reqwest::header::InvalidHeaderValue| Error::Configuration(format!("service key is not a valid header: {e}"));
        let mut apikey = HeaderValue::from_str(key.expose_secret()).map_err(invalid)?;
        apikey.set_sensitive(true);
        let mut bearer =
            HeaderValue::from_str(&format!("Bearer {}", key.expose_secret())).map_err(invalid)?;
        bearer.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert("apikey", apikey);
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    /// The request slot pool.
    #[must_use]
    pub const fn pool(&self) -> &SlotLimiter {
        &self.slots
    }

    const fn ctx(&self, operation: &'static str) -> WriteContext {
        WriteContext::new(operation, BACKEND, self.dimensions)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/v1/{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// Sends a request on a slot and maps non-success statuses.
    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let _slot = self.slots.acquire().await?;
        let response = request
            .send()
            .await
            .map_err(|e| rest::map_transport(operation, &e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(rest::map_status(operation, status.as_u16(), &body))
    }

    async fn send_json(&self, operation: &str, request: RequestBuilder) -> Result<Value> {
        let response = self.send(operation, request).await?;
        let text = response
            .text()
            .await
            .map_err(|e| rest::map_transport(operation, &e))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| Error::backend(operation, BACKEND, e))
    }

    async fn send_rows(
        &self,
        operation: &str,
        table: Table,
        request: RequestBuilder,
    ) -> Result<Vec<Record>> {
        Ok(match self.send_json(operation, request).await? {
            Value::Array(rows) => rows
                .into_iter()
                .map(|row| decode_json_row(table, row))
                .collect(),
            Value::Null => Vec::new(),
            other => vec![decode_json_row(table, other)],
        })
    }

    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        observe(BACKEND, operation, Instant::now(), f.await)
    }

    /// Rewrites semi-joins as `InSet` filters on the local field.
    async fn resolve_joins(&self, operation: &str, mut query: Query) -> Result<Query> {
        for join in std::mem::take(&mut query.joins) {
            let mut lookup = Query::table(join.table).select([join.foreign_field.clone()]);
            lookup.predicates = join.predicates;
            let mut values: Vec<Value> = Vec::new();
            for row in self.get_rows(operation, &lookup).await? {
                if let Some(value) = row.get(&join.foreign_field)
                    && !value.is_null()
                    && !values.iter().any(|v| values_equal(v, value))
                {
                    values.push(value.clone());
                }
            }
            query = query.filter(Predicate::in_set(join.local_field, values));
        }
        Ok(query)
    }

    async fn get_rows(&self, operation: &str, query: &Query) -> Result<Vec<Record>> {
        if query.is_unsatisfiable() {
            return Ok(Vec::new());
        }
        let request = self
            .request(Method::GET, query.table.name())
            .query(&rest::list_params(query));
        self.send_rows(operation, query.table, request).await
    }

    async fn fetch(&self, operation: &str, table: Table, id: &str) -> Result<Option<Record>> {
        let query = Query::table(table)
            .filter(Predicate::equals(ID_FIELD, id))
            .limit(1);
        Ok(self.get_rows(operation, &query).await?.into_iter().next())
    }

    async fn insert(&self, operation: &str, table: Table, rows: &[Record]) -> Result<Vec<Record>> {
        let body: Vec<Value> = rows.iter().map(|r| rest::encode_row(table, r)).collect();
        let request = self
            .request(Method::POST, table.name())
            .header("Prefer", "return=representation")
            .json(&body);
        self.send_rows(operation, table, request).await
    }

    async fn patch(
        &self,
        operation: &str,
        table: Table,
        id: &str,
        changes: &Record,
    ) -> Result<Option<Record>> {
        let request = self
            .request(Method::PATCH, table.name())
            .query(&[(ID_FIELD, format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(&rest::encode_row(table, changes));
        Ok(self
            .send_rows(operation, table, request)
            .await?
            .into_iter()
            .next())
    }

    /// Read-merge-write: PostgREST has no JSON merge operator.
    async fn update_row(
        &self,
        operation: &str,
        table: Table,
        id: &str,
        patch: &Record,
    ) -> Result<Option<Record>> {
        let Some(stored) = self.fetch(operation, table, id).await? else {
            return Ok(None);
        };
        if patch.is_empty() {
            return Ok(Some(stored));
        }
        let merged = merge_record(&stored, patch);
        let changes: Record = patch
            .fields()
            .filter_map(|f| merged.get(f).map(|v| (f.to_string(), v.clone())))
            .collect();
        self.patch(operation, table, id, &changes).await
    }

    async fn delete_ids(&self, operation: &str, table: Table, ids: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let filter = rest::predicate(&Predicate::in_set(ID_FIELD, chunk.iter().cloned()));
            let mut params: Params = filter;
            params.push(("select".to_string(), ID_FIELD.to_string()));
            let request = self
                .request(Method::DELETE, table.name())
                .query(&params)
                .header("Prefer", "return=representation");
            deleted += self.send_rows(operation, table, request).await?.len() as u64;
        }
        Ok(deleted)
    }

    /// Conflict-key upsert that writes only supplied fields that changed.
    async fn upsert_row(
        &self,
        operation: &str,
        table: Table,
        supplied: &Record,
        row: Record,
    ) -> Result<Record> {
        let key = table.schema().conflict_key();
        let key_value = row.get(key).cloned().unwrap_or(Value::Null);
        let lookup = Query::table(table)
            .filter(Predicate::equals(key, key_value))
            .limit(1);
        for _ in 0..2 {
            if let Some(stored) = self.get_rows(operation, &lookup).await?.into_iter().next() {
                let mut changes: Record = upsert_fields(table, supplied)
                    .into_iter()
                    .filter_map(|f| {
                        let value = row.get(&f)?;
                        let differs = stored.get(&f).is_none_or(|s| !values_equal(s, value));
                        differs.then(|| (f, value.clone()))
                    })
                    .collect();
                if changes.is_empty() {
                    return Ok(stored);
                }
                if let Some(updated_at) = row.get(UPDATED_AT_FIELD) {
                    changes.insert(UPDATED_AT_FIELD, updated_at.clone());
                }
                let id = stored.id().unwrap_or_default().to_string();
                return self
                    .patch(operation, table, &id, &changes)
                    .await?
                    .ok_or_else(|| Error::backend(operation, BACKEND, "upserted row vanished"));
            }
            match self.insert(operation, table, std::slice::from_ref(&row)).await {
                Ok(mut rows) if !rows.is_empty() => return Ok(rows.swap_remove(0)),
                Ok(_) => return Err(Error::backend(operation, BACKEND, "insert returned no row")),
                // A concurrent insert won the key; read it back and patch.
                Err(e) if e.field() == Some(key) => {},
                Err(e) => return Err(e),
            }
        }
        Err(Error::backend(operation, BACKEND, "upsert lost a repeated key race"))
    }

    async fn apply_op(&self, op: WriteOp) -> Result<WriteOutcome> {
        let ctx = self.ctx("apply");
        Ok(match op {
            WriteOp::Create { table, record } => {
                let row = table.schema().prepare_insert(record, &ctx)?;
                let mut rows = self.insert("apply", table, std::slice::from_ref(&row)).await?;
                WriteOutcome::Created(rows.pop().unwrap_or(row))
            },
            WriteOp::Update { table, id, patch } => {
                let patch = table.schema().prepare_patch(patch, &ctx)?;
                WriteOutcome::Updated(self.update_row("apply", table, &id, &patch).await?)
            },
            WriteOp::Delete { table, id } => {
                WriteOutcome::Deleted(self.delete_ids("apply", table, &[id]).await? > 0)
            },
            WriteOp::Upsert { table, record } => {
                let row = table.schema().prepare_insert(record.clone(), &ctx)?;
                WriteOutcome::Upserted(self.upsert_row("apply", table, &record, row).await?)
            },
            WriteOp::Savepoint(_) => {
                return Err(Error::validation(
                    "apply",
                    BACKEND,
                    "savepoint",
                    "savepoints need a transactional backend",
                ));
            },
        })
    }

    /// Runs DDL through the `exec_sql` function.
    /// Reads a migration bookkeeping table ordered by version. A table that
    /// does not exist yet reads as empty.
    async fn read_bookkeeping<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        table: &str,
    ) -> Result<Vec<T>> {
        let request = self
            .request(Method::GET, table)
            .query(&[("select", "*"), ("order", "version.asc")]);
        let _slot = self.slots.acquire().await?;
        let response = request
            .send()
            .await
            .map_err(|e| rest::map_transport(operation, &e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| rest::map_transport(operation, &e))?;
        if !status.is_success() {
            if rest::ApiError::parse(&body).is_missing_relation() {
                return Ok(Vec::new());
            }
            return Err(rest::map_status(operation, status.as_u16(), &body));
        }
        serde_json::from_str::<Vec<T>>(&body).map_err(|e| Error::backend(operation, BACKEND, e))
    }

    async fn exec_sql(&self, operation: &str, sql: &str) -> Result<()> {
        let request = self
            .request(Method::POST, &format!("rpc/{EXEC_SQL_FUNCTION}"))
            .json(&json!({ "sql": sql }));
        self.send(operation, request).await.map(|_| ())
    }
}

/// Appends partial-progress context to an `apply` failure.
fn partially_applied(err: Error, applied: usize, total: usize) -> Error {
    if applied == 0 {
        return err;
    }
    let note = format!("{applied} of {total} writes were already committed");
    match err {
        Error::Validation {
            operation,
            backend,
            field,
            message,
        } => Error::Validation {
            operation,
            backend,
            field,
            message: format!("{message} ({note})"),
        },
        Error::ConstraintViolation {
            operation,
            backend,
            field,
            cause,
        } => Error::ConstraintViolation {
            operation,
            backend,
            field,
            cause: format!("{cause} ({note})"),
        },
        Error::Connectivity {
            operation,
            backend,
            cause,
        } => Error::Connectivity {
            operation,
            backend,
            cause: format!("{cause} ({note})"),
        },
        Error::Backend {
            operation,
            backend,
            cause,
        } => Error::Backend {
            operation,
            backend,
            cause: format!("{cause} ({note})"),
        },
        other => other,
    }
}

#[async_trait]
impl StorageAdapter for ManagedAdapter {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_vectors: true,
            transactional_batches: false,
            transactional_ddl: false,
            savepoints: false,
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[instrument(skip(self), fields(backend = BACKEND, table = %table))]
    async fn get(&self, table: Table, id: &str) -> Result<Option<Record>> {
        self.run("get", self.fetch("get", table, id)).await
    }

    #[instrument(skip(self, query), fields(backend = BACKEND, table = %query.table))]
    async fn list(&self, query: Query) -> Result<Vec<Record>> {
        let query = query.checked(BACKEND)?;
        self.run("list", async {
            let query = self.resolve_joins("list", query).await?;
            self.get_rows("list", &query).await
        })
        .await
    }

    async fn count(&self, query: Query) -> Result<u64> {
        let query = query.checked(BACKEND)?;
        self.run("count", async {
            let mut query = self.resolve_joins("count", query).await?;
            if query.is_unsatisfiable() {
                return Ok(0);
            }
            query.limit = None;
            query.offset = None;
            query.columns = Some(Vec::new());
            let mut params = rest::list_params(&query);
            params.push(("limit".to_string(), "1".to_string()));
            let request = self
                .request(Method::GET, query.table.name())
                .query(&params)
                .header("Prefer", "count=exact");
            let response = self.send("count", request).await?;
            let range = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            rest::content_range_total(range)
        })
        .await
    }

    #[instrument(skip(self, record), fields(backend = BACKEND, table = %table))]
    async fn create(&self, table: Table, record: Record) -> Result<Record> {
        let row = table.schema().prepare_insert(record, &self.ctx("create"))?;
        self.run("create", async {
            let mut rows = self.insert("create", table, std::slice::from_ref(&row)).await?;
            Ok(rows.pop().unwrap_or(row))
        })
        .await
    }

    /// One bulk insert, so the batch is atomic.
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
        self.run("create_batch", self.insert("create_batch", table, &rows))
            .await
    }

    #[instrument(skip(self, patch), fields(backend = BACKEND, table = %table))]
    async fn update(&self, table: Table, id: &str, patch: Record) -> Result<Option<Record>> {
        let patch = table.schema().prepare_patch(patch, &self.ctx("update"))?;
        self.run("update", self.update_row("update", table, id, &patch))
            .await
    }

    #[instrument(skip(self), fields(backend = BACKEND, table = %table))]
    async fn delete(&self, table: Table, id: &str) -> Result<bool> {
        let ids = [id.to_string()];
        self.run("delete", async {
            Ok(self.delete_ids("delete", table, &ids).await? > 0)
        })
        .await
    }

    #[instrument(skip(self, query), fields(backend = BACKEND, table = %query.table))]
    async fn delete_matching(&self, query: Query) -> Result<u64> {
        let query = query.checked(BACKEND)?;
        self.run("delete_matching", async {
            let mut query = self.resolve_joins("delete_matching", query).await?;
            query.columns = Some(Vec::new());
            let table = query.table;
            let ids: Vec<String> = self
                .get_rows("delete_matching", &query)
                .await?
                .iter()
                .filter_map(Record::id)
                .map(ToString::to_string)
                .collect();
            self.delete_ids("delete_matching", table, &ids).await
        })
        .await
    }

    #[instrument(skip(self, record), fields(backend = BACKEND, table = %table))]
    async fn upsert(&self, table: Table, record: Record) -> Result<Record> {
        let row = table
            .schema()
            .prepare_insert(record.clone(), &self.ctx("upsert"))?;
        self.run("upsert", self.upsert_row("upsert", table, &record, row))
            .await
    }

    /// Applies writes one request at a time. A failure leaves earlier
    /// writes in place and says how many there were.
    #[instrument(skip(self, unit), fields(backend = BACKEND, ops = unit.len()))]
    async fn apply(&self, unit: UnitOfWork) -> Result<Vec<WriteOutcome>> {
        let ops = unit.into_ops();
        let total = ops.len();
        self.run("apply", async {
            let mut outcomes = Vec::with_capacity(total);
            for op in ops {
                match self.apply_op(op).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        tracing::warn!(
                            backend = BACKEND,
                            applied = outcomes.len(),
                            total,
                            error = %e,
                            "Unit of work failed part way; earlier writes remain"
                        );
                        return Err(partially_applied(e, outcomes.len(), total));
                    },
                }
            }
            Ok(outcomes)
        })
        .await
    }

    /// Calls the `match_<table>` function over RPC.
    #[instrument(skip(self, query), fields(backend = BACKEND, table = %query.collection))]
    async fn search_by_vector(&self, query: VectorQuery) -> Result<SearchResults> {
        check_vector_query(&query, BACKEND, self.dimensions)?;
        Query::table(query.collection)
            .filter_by(&query.filters)
            .checked(BACKEND)?;
        if query.top_k == 0 {
            return Ok(SearchResults::new(Vec::new(), SearchMode::Native));
        }
        let filter: serde_json::Map<String, Value> = query
            .filters
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let body = json!({
            "query_embedding": embedding_to_value(&query.embedding),
            "match_count": query.top_k,
            "filter": filter,
        });
        let function = format!("rpc/match_{}", query.collection.name());
        self.run("search_by_vector", async {
            let request = self.request(Method::POST, &function).json(&body);
            let value = self.send_json("search_by_vector", request).await?;
            let rows: Vec<MatchRow> = serde_json::from_value(value)
                .map_err(|e| Error::backend("search_by_vector", BACKEND, e))?;
            let hits = rows
                .into_iter()
                .map(|row| {
                    let mut record = decode_json_row(query.collection, row.record);
                    record.remove(EMBEDDING_FIELD);
                    #[allow(clippy::cast_possible_truncation)]
                    let score = row.similarity.clamp(0.0, 1.0) as f32;
                    ScoredRecord { record, score }
                })
                .collect();
            Ok(SearchResults::new(hits, SearchMode::Native))
        })
        .await
    }

    /// Prefilters with `ilike` on the server and scores locally.
    #[instrument(skip(self, query), fields(backend = BACKEND, table = %query.collection))]
    async fn keyword_search(&self, query: KeywordQuery) -> Result<Vec<ScoredRecord>> {
        let schema = query.collection.schema();
        let text_column = schema.text_column.ok_or_else(|| {
            Error::validation(
                "keyword_search",
                BACKEND,
                "content",
                format!("table '{}' has no text column", query.collection.name()),
            )
        })?;
        let scoped = Query::table(query.collection)
            .filter_by(&query.filters)
            .checked(BACKEND)?;
        let terms = query.terms();
        if terms.is_empty() || query.top_k == 0 {
            return Ok(Vec::new());
        }
        self.run("keyword_search", async {
            let alternatives: Vec<String> = terms
                .iter()
                .map(|t| {
                    let pattern = format!("*{}*", t.replace('"', ""));
                    format!("{text_column}.ilike.\"{pattern}\"")
                })
                .collect();
            let mut params = rest::list_params(&scoped);
            params.push(("or".to_string(), format!("({})", alternatives.join(","))));
            let request = self
                .request(Method::GET, query.collection.name())
                .query(&params);
            let rows = self
                .send_rows("keyword_search", query.collection, request)
                .await?;
            let mut hits: Vec<ScoredRecord> = rows
                .into_iter()
                .filter_map(|r| {
                    let score = keyword_score(r.get_str(text_column)?, &terms);
                    (score > 0.0).then(|| ScoredRecord {
                        record: without_embedding(r),
                        score,
                    })
                })
                .collect();
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            hits.truncate(query.top_k);
            Ok(hits)
        })
        .await
    }

    #[instrument(skip(self, params), fields(backend = BACKEND))]
    async fn call_procedure(&self, name: &str, params: Value) -> Result<Vec<Record>> {
        check_procedure_name(name, BACKEND)?;
        self.run("call_procedure", async {
            let request = self
                .request(Method::POST, &format!("rpc/{name}"))
                .json(&params);
            let value = self.send_json("call_procedure", request).await?;
            Ok(procedure_result(name, value))
        })
        .await
    }

    async fn ensure_ledger(&self) -> Result<()> {
        self.run("ensure_ledger", async {
            self.exec_sql("ensure_ledger", &SQL.ledger_ddl()).await?;
            self.exec_sql("ensure_ledger", &SQL.failures_ddl()).await
        })
        .await
    }

    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>> {
        self.run(
            "applied_migrations",
            self.read_bookkeeping("applied_migrations", LEDGER_TABLE),
        )
        .await
    }

    async fn record_migration_failure(&self, failure: &MigrationFailure) -> Result<()> {
        self.run("record_migration_failure", async {
            self.exec_sql("record_migration_failure", &SQL.failures_ddl()).await?;
            let row = json!({
                "version": failure.version,
                "cause": failure.cause,
                "failed_at": format_timestamp(failure.failed_at),
            });
            let request = self
                .request(Method::POST, MIGRATION_FAILURES_TABLE)
                .header("Prefer", "resolution=merge-duplicates")
                .json(&row);
            self.send("record_migration_failure", request).await.map(|_| ())
        })
        .await
    }

    async fn migration_failures(&self) -> Result<Vec<MigrationFailure>> {
        self.run(
            "migration_failures",
            self.read_bookkeeping("migration_failures", MIGRATION_FAILURES_TABLE),
        )
        .await
    }

    async fn clear_migration_failure(&self, version: &str) -> Result<bool> {
        self.run("clear_migration_failure", async {
            let request = self
                .request(Method::DELETE, MIGRATION_FAILURES_TABLE)
                .query(&[("version", format!("eq.{version}"))])
                .header("Prefer", "return=representation");
            let recorded: Vec<MigrationFailure> = self
                .read_bookkeeping("clear_migration_failure", MIGRATION_FAILURES_TABLE)
                .await?;
            if !recorded.iter().any(|failure| failure.version == version) {
                return Ok(false);
            }
            let removed = self.send_json("clear_migration_failure", request).await?;
            Ok(removed.as_array().is_some_and(|rows| !rows.is_empty()))
        })
        .await
    }

    /// DDL and the ledger write are separate requests. A failure after the
    /// DDL leaves the schema changed without a ledger row; every built-in
    /// change is idempotent, so re-running is safe.
    #[instrument(skip(self, migration, checksum), fields(backend = BACKEND, version = %migration.version))]
    async fn apply_migration(&self, migration: &Migration, checksum: &str) -> Result<ApplyOutcome> {
        self.run("apply_migration", async {
            let request = self
                .request(Method::GET, LEDGER_TABLE)
                .query(&[("select", "version".to_string()), ("version", format!("eq.{}", migration.version))]);
            let existing = self.send_json("apply_migration", request).await?;
            if existing.as_array().is_some_and(|rows| !rows.is_empty()) {
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            for change in &migration.changes {
                for sql in SQL.ddl(change, self.dimensions) {
                    self.exec_sql("apply_migration", &sql)
                        .await
                        .map_err(|e| Error::Migration {
                            version: migration.version.clone(),
                            cause: e.to_string(),
                        })?;
                }
            }
            if let Err(e) = self.exec_sql("apply_migration", "NOTIFY pgrst, 'reload schema'").await {
                tracing::warn!(error = %e, "Schema cache reload request failed");
            }
            let record = migration.ledger_record(checksum);
            let row = json!({
                "version": record.version,
                "description": record.description,
                "checksum": record.checksum,
                "applied_at": format_timestamp(record.applied_at),
            });
            let request = self.request(Method::POST, LEDGER_TABLE).json(&row);
            self.send("apply_migration", request).await?;
            Ok(ApplyOutcome::Applied(record))
        })
        .await
    }

    async fn health_check(&self) -> Result<()> {
        self.run("health_check", async {
            let request = self.request(Method::GET, "");
            self.send("health_check", request)
                .await
                .map(|_| ())
                .map_err(|e| match e.kind() {
                    ErrorKind::Configuration | ErrorKind::Connectivity | ErrorKind::PoolExhausted => e,
                    _ => Error::connectivity("health_check", BACKEND, e),
                })
        })
        .await
    }
}
