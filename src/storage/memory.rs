//! In-memory storage adapter.
//!
//! A test double with the same contract as the database adapters. All state
//! lives behind one mutex; every public method takes it once. Atomic
//! batches and units of work are simulated by snapshotting the state and
//! restoring it on failure.
//!
//! Tables only exist after a migration creates them, foreign keys are
//! checked on write and cascades are walked explicitly, so code that works
//! against the fake behaves the same against a real database.
//!
//! # Latency simulation
//!
//! [`InMemoryAdapter::with_latency`] sleeps inside each call while holding
//! a pool slot, never while holding the state lock. Combined with a small
//! pool this reproduces pool exhaustion without a database.

use crate::models::merge::{is_noop_patch, merge_record};
use crate::models::schema::UPDATED_AT_FIELD;
use crate::models::{
    ApplyOutcome, Filter, ID_FIELD, KeywordQuery, MigrationFailure, MigrationRecord, Record,
    ScoredRecord, SearchMode, SearchResults, Table, UnitOfWork, VectorQuery, WriteContext,
    WriteOp, WriteOutcome, embedding_from_value,
};
use crate::storage::metrics::observe;
use crate::storage::migrations::{Migration, SchemaChange};
use crate::storage::pool::{PoolConfig, SlotLimiter, acquire_lock};
use crate::storage::query::{Query, eval};
use crate::storage::traits::{Capabilities, StorageAdapter};
use crate::storage::vector::rank_by_similarity;
use crate::storage::{
    check_procedure_name, check_vector_query, procedure_rows, upsert_fields, without_embedding,
};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;

const BACKEND: &str = "in-memory-fake";

/// A registered stored procedure: JSON parameters in, JSON result out.
pub type Procedure = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct TableData {
    rows: BTreeMap<u64, Record>,
    ids: HashMap<String, u64>,
    indexes: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<Table, TableData>,
    ledger: Option<Vec<MigrationRecord>>,
    failures: BTreeMap<String, MigrationFailure>,
    match_functions: HashSet<Table>,
    next_seq: u64,
}

fn missing_table(operation: &str, table: Table) -> Error {
    Error::backend(
        operation,
        BACKEND,
        format!("no such table: {} (run migrations first)", table.name()),
    )
}

impl MemoryState {
    fn table(&self, operation: &str, table: Table) -> Result<&TableData> {
        self.tables
            .get(&table)
            .ok_or_else(|| missing_table(operation, table))
    }

    fn table_mut(&mut self, operation: &str, table: Table) -> Result<&mut TableData> {
        self.tables
            .get_mut(&table)
            .ok_or_else(|| missing_table(operation, table))
    }

    fn find(&self, table: Table, id: &str) -> Option<&Record> {
        let data = self.tables.get(&table)?;
        data.ids.get(id).and_then(|seq| data.rows.get(seq))
    }

    fn find_by(&self, table: Table, field: &str, value: &Value) -> Option<&Record> {
        if value.is_null() {
            return None;
        }
        self.tables
            .get(&table)?
            .rows
            .values()
            .find(|r| r.get(field).is_some_and(|v| eval::values_equal(v, value)))
    }

    /// Checks foreign keys and the unique key for a full row.
    fn check_constraints(&self, operation: &str, table: Table, row: &Record) -> Result<()> {
        let schema = table.schema();
        let id = row.id().unwrap_or_default();
        if let Some(key) = schema.unique_key
            && let Some(value) = row.get(key)
            && let Some(existing) = self.find_by(table, key, value)
            && existing.id() != Some(id)
        {
            return Err(Error::constraint(
                operation,
                BACKEND,
                Some(key.to_string()),
                format!("duplicate value for unique key '{key}' on {}", table.name()),
            ));
        }
        for fk in schema.foreign_keys {
            let Some(parent_id) = row.get_str(fk.column) else {
                continue;
            };
            let self_reference = fk.parent == table && parent_id == id;
            if !self_reference && self.find(fk.parent, parent_id).is_none() {
                return Err(Error::constraint(
                    operation,
                    BACKEND,
                    Some(fk.column.to_string()),
                    format!(
                        "foreign key '{}' references missing {} row '{parent_id}'",
                        fk.column,
                        fk.parent.name()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn insert(&mut self, operation: &str, table: Table, row: Record) -> Result<Record> {
        let id = row
            .id()
            .map(ToString::to_string)
            .ok_or_else(|| Error::validation(operation, BACKEND, ID_FIELD, "id is missing"))?;
        if self.table(operation, table)?.ids.contains_key(&id) {
            return Err(Error::constraint(
                operation,
                BACKEND,
                Some(ID_FIELD.to_string()),
                format!("duplicate id '{id}' on {}", table.name()),
            ));
        }
        self.check_constraints(operation, table, &row)?;

        let seq = self.next_seq;
        self.next_seq += 1;
        let data = self.table_mut(operation, table)?;
        data.ids.insert(id, seq);
        data.rows.insert(seq, row.clone());
        Ok(row)
    }

    fn replace(&mut self, operation: &str, table: Table, row: Record) -> Result<Record> {
        self.check_constraints(operation, table, &row)?;
        let data = self.table_mut(operation, table)?;
        if let Some(seq) = row.id().and_then(|id| data.ids.get(id)).copied() {
            data.rows.insert(seq, row.clone());
        }
        Ok(row)
    }

    fn update(&mut self, table: Table, id: &str, patch: &Record) -> Result<Option<Record>> {
        self.table("update", table)?;
        let Some(stored) = self.find(table, id) else {
            return Ok(None);
        };
        let merged = merge_record(stored, patch);
        self.replace("update", table, merged).map(Some)
    }

    fn upsert(&mut self, table: Table, supplied: &Record, row: Record) -> Result<Record> {
        let key = table.schema().conflict_key();
        let existing = row
            .get(key)
            .and_then(|value| self.find_by(table, key, value))
            .cloned();
        let Some(stored) = existing else {
            return self.insert("upsert", table, row);
        };

        let fields = upsert_fields(table, supplied);
        let mut patch: Record = fields
            .iter()
            .filter_map(|f| row.get(f).map(|v| (f.clone(), v.clone())))
            .collect();
        if fields.is_empty() || is_noop_patch(&stored, &patch, &[]) {
            return Ok(stored);
        }
        let mut updated = stored;
        if let Some(now) = row.get(UPDATED_AT_FIELD) {
            patch.insert(UPDATED_AT_FIELD, now.clone());
        }
        for (field, value) in patch {
            updated.insert(field, value);
        }
        self.replace("upsert", table, updated)
    }

    /// Removes rows and everything that references them.
    ///
    /// Returns how many of `ids` existed.
    fn delete_cascade(&mut self, table: Table, ids: Vec<String>) -> Result<u64> {
        let data = self.table("delete", table)?;
        let existing: Vec<String> = ids.into_iter().filter(|id| data.ids.contains_key(id)).collect();
        let removed = existing.len() as u64;

        let mut doomed: HashSet<(Table, String)> = HashSet::new();
        let mut stack = vec![(table, existing)];
        while let Some((table, ids)) = stack.pop() {
            let fresh: Vec<String> = ids
                .into_iter()
                .filter(|id| doomed.insert((table, id.clone())))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            for (child, column) in table.children() {
                let Some(data) = self.tables.get(&child) else {
                    continue;
                };
                let children: Vec<String> = data
                    .rows
                    .values()
                    .filter(|r| r.get_str(column).is_some_and(|p| fresh.iter().any(|f| f == p)))
                    .filter_map(|r| r.id().map(ToString::to_string))
                    .collect();
                if !children.is_empty() {
                    stack.push((child, children));
                }
            }
        }

        for (table, id) in doomed {
            if let Some(data) = self.tables.get_mut(&table)
                && let Some(seq) = data.ids.remove(&id)
            {
                data.rows.remove(&seq);
            }
        }
        Ok(removed)
    }

    fn select(&self, query: &Query) -> Result<Vec<Record>> {
        let data = self.table("list", query.table)?;
        for join in &query.joins {
            self.table("list", join.table)?;
        }
        Ok(eval::select(
            query,
            data.rows.iter().map(|(seq, r)| (*seq, r)),
            |table| {
                self.tables
                    .get(&table)
                    .map(|d| d.rows.values().collect())
                    .unwrap_or_default()
            },
        ))
    }

    fn vector_search(&self, query: &VectorQuery) -> Result<Vec<ScoredRecord>> {
        let filters = Query::table(query.collection)
            .filter_by(&query.filters)
            .checked(BACKEND)?;
        let data = self.table("search_by_vector", query.collection)?;
        let candidates = data
            .rows
            .values()
            .filter(|r| eval::matches_all(&filters.predicates, r))
            .filter_map(|r| Some((r, r.embedding()?)));
        Ok(rank_by_similarity(&query.embedding, candidates, query.top_k)
            .into_iter()
            .map(|(record, score)| ScoredRecord {
                record: without_embedding(record.clone()),
                score,
            })
            .collect())
    }

    fn keyword_search(&self, query: &KeywordQuery) -> Result<Vec<ScoredRecord>> {
        let schema = query.collection.schema();
        let text_column = schema.text_column.ok_or_else(|| {
            Error::validation(
                "keyword_search",
                BACKEND,
                "content",
                format!("table '{}' has no text column", query.collection.name()),
            )
        })?;
        let filters = Query::table(query.collection)
            .filter_by(&query.filters)
            .checked(BACKEND)?;
        let data = self.table("keyword_search", query.collection)?;
        let terms = query.terms();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut scored: Vec<ScoredRecord> = data
            .rows
            .values()
            .filter(|r| eval::matches_all(&filters.predicates, r))
            .filter_map(|r| {
                let score = eval::keyword_score(r.get_str(text_column)?, &terms);
                (score > 0.0).then(|| ScoredRecord {
                    record: without_embedding(r.clone()),
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(query.top_k);
        Ok(scored)
    }

    fn apply_change(&mut self, change: &SchemaChange) -> Result<()> {
        match change {
            SchemaChange::EnableVectorExtension | SchemaChange::RawSql { .. } => {},
            SchemaChange::CreateTable(table) => {
                self.tables.entry(*table).or_default();
            },
            SchemaChange::CreateIndex { table, columns } => {
                for column in columns {
                    if table.schema().column(column).is_none() {
                        return Err(Error::backend(
                            "apply_migration",
                            BACKEND,
                            format!("no such column: {}.{column}", table.name()),
                        ));
                    }
                }
                let data = self.table_mut("apply_migration", *table)?;
                if !data.indexes.contains(columns) {
                    data.indexes.push(columns.clone());
                }
            },
            SchemaChange::CreateVectorIndex(table) => {
                self.table("apply_migration", *table)?;
            },
            SchemaChange::CreateMatchFunction(table) => {
                self.table("apply_migration", *table)?;
                self.match_functions.insert(*table);
            },
        }
        Ok(())
    }

    fn apply_op(&mut self, op: WriteOp, dimensions: usize) -> Result<WriteOutcome> {
        Ok(match op {
            WriteOp::Create { table, record } => {
                let ctx = WriteContext::new("apply", BACKEND, dimensions);
                let row = table.schema().prepare_insert(record, &ctx)?;
                WriteOutcome::Created(self.insert("apply", table, row)?)
            },
            WriteOp::Update { table, id, patch } => {
                let ctx = WriteContext::new("apply", BACKEND, dimensions);
                let patch = table.schema().prepare_patch(patch, &ctx)?;
                WriteOutcome::Updated(self.update(table, &id, &patch)?)
            },
            WriteOp::Delete { table, id } => {
                WriteOutcome::Deleted(self.delete_cascade(table, vec![id])? > 0)
            },
            WriteOp::Upsert { table, record } => {
                let ctx = WriteContext::new("apply", BACKEND, dimensions);
                let row = table.schema().prepare_insert(record.clone(), &ctx)?;
                WriteOutcome::Upserted(self.upsert(table, &record, row)?)
            },
            WriteOp::Savepoint(group) => {
                let snapshot = self.clone();
                match self.apply_ops(group, dimensions) {
                    Ok(outcomes) => WriteOutcome::Group(outcomes),
                    Err(e) => {
                        *self = snapshot;
                        tracing::debug!(backend = BACKEND, error = %e, "Savepoint rolled back");
                        WriteOutcome::RolledBack(Box::new(e))
                    },
                }
            },
        })
    }

    fn apply_ops(&mut self, ops: Vec<WriteOp>, dimensions: usize) -> Result<Vec<WriteOutcome>> {
        ops.into_iter().map(|op| self.apply_op(op, dimensions)).collect()
    }
}

/// In-memory [`StorageAdapter`] for tests.
pub struct InMemoryAdapter {
    state: Mutex<MemoryState>,
    dimensions: usize,
    slots: SlotLimiter,
    latency: Option<Duration>,
    procedures: Mutex<HashMap<String, Procedure>>,
}

impl std::fmt::Debug for InMemoryAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAdapter")
            .field("dimensions", &self.dimensions)
            .field("slots", &self.slots)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl InMemoryAdapter {
    /// Creates an empty store with the default pool bounds.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self::with_pool(dimensions, PoolConfig::default())
    }

    /// Creates an empty store bounded by `pool`.
    #[must_use]
    pub fn with_pool(dimensions: usize, pool: PoolConfig) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            dimensions,
            slots: SlotLimiter::new(pool, BACKEND),
            latency: None,
            procedures: Mutex::new(HashMap::new()),
        }
    }

    /// Sleeps for `latency` inside every call, holding a pool slot.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Registers a stored procedure under `name`.
    pub fn register_procedure<F>(&self, name: impl Into<String>, procedure: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        acquire_lock(&self.procedures).insert(name.into(), Arc::new(procedure));
    }

    /// The slot pool bounding concurrent calls.
    #[must_use]
    pub const fn pool(&self) -> &SlotLimiter {
        &self.slots
    }

    async fn slot(&self) -> Result<OwnedSemaphorePermit> {
        let slot = self.slots.acquire().await?;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(slot)
    }

    /// Runs `f` under the state lock while holding a pool slot.
    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut MemoryState) -> Result<T> + Send,
        T: Send,
    {
        let start = Instant::now();
        let result = match self.slot().await {
            Ok(_slot) => {
                let mut state = acquire_lock(&self.state);
                f(&mut state)
            },
            Err(e) => Err(e),
        };
        observe(BACKEND, operation, start, result)
    }

    const fn ctx(&self, operation: &'static str) -> WriteContext {
        WriteContext::new(operation, BACKEND, self.dimensions)
    }

    fn match_query(&self, table: Table, params: &Value) -> Result<VectorQuery> {
        let embedding = params
            .get("query_embedding")
            .and_then(embedding_from_value)
            .ok_or_else(|| {
                Error::validation(
                    "call_procedure",
                    BACKEND,
                    "query_embedding",
                    "expected an array of numbers",
                )
            })?;
        let top_k = params
            .get("match_count")
            .and_then(Value::as_u64)
            .map_or(10, |n| usize::try_from(n).unwrap_or(usize::MAX));
        let filters = match params.get("filter") {
            Some(Value::Object(map)) => Filter::from(map.clone()),
            _ => Filter::new(),
        };
        let query = VectorQuery::new(table, embedding, top_k).with_filters(filters);
        check_vector_query(&query, BACKEND, self.dimensions)?;
        Ok(query)
    }
}

#[async_trait]
impl StorageAdapter for InMemoryAdapter {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_vectors: true,
            transactional_batches: true,
            transactional_ddl: true,
            savepoints: true,
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn get(&self, table: Table, id: &str) -> Result<Option<Record>> {
        self.run("get", |state| {
            state.table("get", table)?;
            Ok(state.find(table, id).cloned())
        })
        .await
    }

    async fn list(&self, query: Query) -> Result<Vec<Record>> {
        let query = query.checked(BACKEND)?;
        self.run("list", |state| state.select(&query)).await
    }

    async fn count(&self, query: Query) -> Result<u64> {
        let mut query = query.checked(BACKEND)?;
        query.limit = None;
        query.offset = None;
        query.columns = Some(Vec::new());
        self.run("count", |state| Ok(state.select(&query)?.len() as u64))
            .await
    }

    async fn create(&self, table: Table, record: Record) -> Result<Record> {
        let row = table.schema().prepare_insert(record, &self.ctx("create"))?;
        self.run("create", |state| state.insert("create", table, row))
            .await
    }

    async fn create_batch(&self, table: Table, records: Vec<Record>) -> Result<Vec<Record>> {
        let ctx = self.ctx("create_batch");
        let rows = records
            .into_iter()
            .map(|r| table.schema().prepare_insert(r, &ctx))
            .collect::<Result<Vec<_>>>()?;
        self.run("create_batch", |state| {
            let snapshot = state.clone();
            let result = rows
                .into_iter()
                .map(|row| state.insert("create_batch", table, row))
                .collect::<Result<Vec<_>>>();
            if result.is_err() {
                *state = snapshot;
            }
            result
        })
        .await
    }

    async fn update(&self, table: Table, id: &str, patch: Record) -> Result<Option<Record>> {
        let patch = table.schema().prepare_patch(patch, &self.ctx("update"))?;
        self.run("update", |state| state.update(table, id, &patch))
            .await
    }

    async fn delete(&self, table: Table, id: &str) -> Result<bool> {
        self.run("delete", |state| {
            Ok(state.delete_cascade(table, vec![id.to_string()])? > 0)
        })
        .await
    }

    async fn delete_matching(&self, query: Query) -> Result<u64> {
        let mut query = query.checked(BACKEND)?;
        query.columns = Some(Vec::new());
        self.run("delete_matching", |state| {
            let ids = state
                .select(&query)?
                .iter()
                .filter_map(Record::id)
                .map(ToString::to_string)
                .collect();
            state.delete_cascade(query.table, ids)
        })
        .await
    }

    async fn upsert(&self, table: Table, record: Record) -> Result<Record> {
        let row = table
            .schema()
            .prepare_insert(record.clone(), &self.ctx("upsert"))?;
        self.run("upsert", |state| state.upsert(table, &record, row))
            .await
    }

    async fn apply(&self, unit: UnitOfWork) -> Result<Vec<WriteOutcome>> {
        let dimensions = self.dimensions;
        self.run("apply", |state| {
            let snapshot = state.clone();
            let result = state.apply_ops(unit.into_ops(), dimensions);
            if result.is_err() {
                *state = snapshot;
            }
            result
        })
        .await
    }

    async fn search_by_vector(&self, query: VectorQuery) -> Result<SearchResults> {
        check_vector_query(&query, BACKEND, self.dimensions)?;
        self.run("search_by_vector", |state| {
            Ok(SearchResults::new(state.vector_search(&query)?, SearchMode::Native))
        })
        .await
    }

    async fn keyword_search(&self, query: KeywordQuery) -> Result<Vec<ScoredRecord>> {
        self.run("keyword_search", |state| state.keyword_search(&query))
            .await
    }

    async fn call_procedure(&self, name: &str, params: Value) -> Result<Vec<Record>> {
        check_procedure_name(name, BACKEND)?;
        let registered = acquire_lock(&self.procedures).get(name).cloned();
        if let Some(procedure) = registered {
            let _slot = self.slot().await?;
            return procedure(params).map(procedure_rows);
        }

        let table = name
            .strip_prefix("match_")
            .and_then(Table::parse)
            .filter(|t| t.is_vector_collection());
        let Some(table) = table else {
            return Err(Error::validation(
                "call_procedure",
                BACKEND,
                "name",
                format!("unknown procedure '{name}'"),
            ));
        };
        let query = self.match_query(table, &params)?;
        self.run("call_procedure", |state| {
            if !state.match_functions.contains(&table) {
                return Err(Error::validation(
                    "call_procedure",
                    BACKEND,
                    "name",
                    format!("unknown procedure '{name}'"),
                ));
            }
            let rows = state
                .vector_search(&query)?
                .into_iter()
                .map(|hit| json!({"record": Value::from(hit.record), "similarity": hit.score}))
                .collect();
            Ok(procedure_rows(Value::Array(rows)))
        })
        .await
    }

    async fn ensure_ledger(&self) -> Result<()> {
        self.run("ensure_ledger", |state| {
            state.ledger.get_or_insert_with(Vec::new);
            Ok(())
        })
        .await
    }

    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>> {
        self.run("applied_migrations", |state| {
            let mut records = state.ledger.clone().unwrap_or_default();
            records.sort_by(|a, b| a.version.cmp(&b.version));
            Ok(records)
        })
        .await
    }

    async fn record_migration_failure(&self, failure: &MigrationFailure) -> Result<()> {
        self.run("record_migration_failure", |state| {
            state
                .failures
                .insert(failure.version.clone(), failure.clone());
            Ok(())
        })
        .await
    }

    async fn migration_failures(&self) -> Result<Vec<MigrationFailure>> {
        self.run("migration_failures", |state| {
            Ok(state.failures.values().cloned().collect())
        })
        .await
    }

    async fn clear_migration_failure(&self, version: &str) -> Result<bool> {
        self.run("clear_migration_failure", |state| {
            Ok(state.failures.remove(version).is_some())
        })
        .await
    }

    async fn apply_migration(&self, migration: &Migration, checksum: &str) -> Result<ApplyOutcome> {
        self.run("apply_migration", |state| {
            let applied = state
                .ledger
                .as_ref()
                .is_some_and(|l| l.iter().any(|r| r.version == migration.version));
            if applied {
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            let snapshot = state.clone();
            for change in &migration.changes {
                if let Err(e) = state.apply_change(change) {
                    *state = snapshot;
                    return Err(Error::Migration {
                        version: migration.version.clone(),
                        cause: e.to_string(),
                    });
                }
            }
            let record = migration.ledger_record(checksum);
            state
                .ledger
                .get_or_insert_with(Vec::new)
                .push(record.clone());
            Ok(ApplyOutcome::Applied(record))
        })
        .await
    }

    async fn health_check(&self) -> Result<()> {
        self.run("health_check", |_| Ok(())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::models::{EMBEDDING_FIELD, VectorRecord};
    use crate::storage::migrations::MigrationTracker;
    use crate::storage::query::{Direction, Predicate};

    async fn migrated() -> InMemoryAdapter {
        let adapter = InMemoryAdapter::new(3);
        MigrationTracker::builtin(3).unwrap().run(&adapter).await.unwrap();
        adapter
    }

    async fn source(adapter: &InMemoryAdapter) -> String {
        adapter
            .create(Table::Sources, Record::new().with("source_url", "https://example.com"))
            .await
            .unwrap()
            .id()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_tables_need_migrations() {
        let adapter = InMemoryAdapter::new(3);
        let err = adapter.get(Table::Projects, "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[tokio::test]
    async fn test_create_fills_defaults_and_get_round_trips() {
        let adapter = migrated().await;
        let project = adapter
            .create(Table::Projects, Record::new().with("title", "Docs"))
            .await
            .unwrap();
        let task = adapter
            .create(
                Table::Tasks,
                Record::new()
                    .with("project_id", project.id().unwrap())
                    .with("title", "Write"),
            )
            .await
            .unwrap();
        assert_eq!(task.get_str("status"), Some("todo"));
        assert_eq!(task.get_bool("archived"), Some(false));

        let fetched = adapter.get(Table::Tasks, task.id().unwrap()).await.unwrap();
        assert_eq!(fetched, Some(task));
        assert_eq!(adapter.get(Table::Tasks, "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_foreign_key_is_enforced() {
        let adapter = migrated().await;
        let err = adapter
            .create(Table::Tasks, Record::new().with("project_id", "nope").with("title", "t"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(err.field(), Some("project_id"));
    }

    #[tokio::test]
    async fn test_delete_source_cascades() {
        let adapter = migrated().await;
        let src = source(&adapter).await;
        let page = adapter
            .create(Table::Pages, Record::new().with("source_id", src.as_str()).with("url", "u"))
            .await
            .unwrap();
        adapter
            .create(
                Table::DocumentChunks,
                VectorRecord::new("text", vec![1.0, 0.0, 0.0])
                    .with("source_id", src.as_str())
                    .with("page_id", page.id().unwrap())
                    .into_record(),
            )
            .await
            .unwrap();

        assert!(adapter.delete(Table::Sources, &src).await.unwrap());
        assert_eq!(adapter.count(Query::table(Table::Pages)).await.unwrap(), 0);
        assert_eq!(adapter.count(Query::table(Table::DocumentChunks)).await.unwrap(), 0);
        assert!(!adapter.delete(Table::Sources, &src).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let adapter = migrated().await;
        let src = source(&adapter).await;
        let rows = vec![
            VectorRecord::new("a", vec![1.0, 0.0, 0.0]).with("source_id", src.as_str()).into_record(),
            VectorRecord::new("b", vec![1.0, 0.0]).with("source_id", src.as_str()).into_record(),
        ];
        let err = adapter.create_batch(Table::DocumentChunks, rows).await.unwrap_err();
        assert_eq!(err.field(), Some("embedding"));

        let rows = vec![
            Record::new().with("id", "dup").with("title", "a"),
            Record::new().with("id", "dup").with("title", "b"),
        ];
        let err = adapter.create_batch(Table::Projects, rows).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(adapter.count(Query::table(Table::Projects)).await.unwrap(), 0);
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
        assert_eq!(adapter.count(Query::table(Table::Settings)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_savepoint_rolls_back_group_only() {
        let adapter = migrated().await;
        let unit = UnitOfWork::new()
            .create(Table::Projects, Record::new().with("id", "p1").with("title", "kept"))
            .savepoint(
                UnitOfWork::new()
                    .create(Table::Projects, Record::new().with("id", "p2").with("title", "dropped"))
                    .create(Table::Tasks, Record::new().with("project_id", "missing").with("title", "t")),
            );
        let outcomes = adapter.apply(unit).await.unwrap();
        assert!(matches!(outcomes[1], WriteOutcome::RolledBack(_)));
        assert!(adapter.get(Table::Projects, "p1").await.unwrap().is_some());
        assert!(adapter.get(Table::Projects, "p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_unit_commits_nothing() {
        let adapter = migrated().await;
        let unit = UnitOfWork::new()
            .create(Table::Projects, Record::new().with("id", "p1").with("title", "a"))
            .create(Table::Tasks, Record::new().with("project_id", "missing").with("title", "t"));
        adapter.apply(unit).await.unwrap_err();
        assert!(adapter.get(Table::Projects, "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vector_search_ranks_and_strips_embeddings() {
        let adapter = migrated().await;
        let src = source(&adapter).await;
        for (content, embedding) in [("x", vec![1.0, 0.0, 0.0]), ("y", vec![0.0, 1.0, 0.0])] {
            adapter
                .create(
                    Table::DocumentChunks,
                    VectorRecord::new(content, embedding).with("source_id", src.as_str()).into_record(),
                )
                .await
                .unwrap();
        }
        let results = adapter
            .search_by_vector(VectorQuery::new(Table::DocumentChunks, vec![0.0, 1.0, 0.0], 1))
            .await
            .unwrap();
        assert_eq!(results.mode, SearchMode::Native);
        assert_eq!(results.hits[0].record.get_str("content"), Some("y"));
        assert!(!results.hits[0].record.contains(EMBEDDING_FIELD));
    }

    #[tokio::test]
    async fn test_match_procedure_and_registered_procedures() {
        let adapter = migrated().await;
        let src = source(&adapter).await;
        adapter
            .create(
                Table::CodeExamples,
                VectorRecord::new("fn main() {}", vec![1.0, 0.0, 0.0])
                    .with("source_id", src.as_str())
                    .into_record(),
            )
            .await
            .unwrap();
        let rows = adapter
            .call_procedure(
                "match_code_examples",
                json!({"query_embedding": [1.0, 0.0, 0.0], "match_count": 5}),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].get("similarity").is_some());

        adapter.register_procedure("double", |v| Ok(json!(v["n"].as_i64().unwrap_or(0) * 2)));
        let rows = adapter.call_procedure("double", json!({"n": 4})).await.unwrap();
        assert_eq!(rows[0].get_i64("value"), Some(8));

        let err = adapter.call_procedure("nope", Value::Null).await.unwrap_err();
        assert_eq!(err.field(), Some("name"));
    }

    #[tokio::test]
    async fn test_list_orders_and_filters() {
        let adapter = migrated().await;
        let project = adapter
            .create(Table::Projects, Record::new().with("title", "p"))
            .await
            .unwrap();
        let pid = project.id().unwrap();
        for (title, order) in [("b", 2), ("a", 1), ("c", 2)] {
            adapter
                .create(
                    Table::Tasks,
                    Record::new().with("project_id", pid).with("title", title).with("task_order", order),
                )
                .await
                .unwrap();
        }
        let rows = adapter
            .list(
                Query::table(Table::Tasks)
                    .filter(Predicate::equals("project_id", pid))
                    .order_by("task_order", Direction::Desc)
                    .limit(2),
            )
            .await
            .unwrap();
        let titles: Vec<_> = rows.iter().filter_map(|r| r.get_str("title")).collect();
        assert_eq!(titles, vec!["b", "c"]);
        let total = adapter
            .count(Query::table(Table::Tasks).limit(1))
            .await
            .unwrap();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_latency_holds_pool_slot() {
        let adapter = Arc::new(
            InMemoryAdapter::with_pool(
                3,
                PoolConfig::default()
                    .with_max_size(1)
                    .with_acquire_timeout(Duration::from_millis(20)),
            )
            .with_latency(Duration::from_millis(200)),
        );
        let slow = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.health_check().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = adapter.health_check().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        slow.await.unwrap().unwrap();
    }
}
