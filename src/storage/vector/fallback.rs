//! Similarity search for adapters without native vector support.
//!
//! [`VectorFallback`] wraps an adapter and owns everything vector-related the
//! inner adapter cannot do. Row storage and every non-vector operation pass
//! straight through.
//!
//! # Strategies
//!
//! | Strategy | Search | Writes |
//! |----------|--------|--------|
//! | `ExternalIndex` | KNN in the index, rows re-read and filtered from the database, window widened until `top_k` rows pass | Database first, then index |
//! | `KeywordDegrade` | Term match over `content` using `query_text` | Pass through |
//!
//! The database is the source of truth. A failed index write after `create`
//! deletes the new row again; after `update`, `upsert` or `apply` it is
//! logged and counted, and [`rebuild_vector_index`](StorageAdapter::rebuild_vector_index)
//! brings the index back in line.

use crate::models::{
    ApplyOutcome, EMBEDDING_FIELD, ID_FIELD, KeywordQuery, MigrationFailure, MigrationRecord,
    Record, ScoredRecord, SearchMode, SearchResults, Table, UnitOfWork, VectorQuery, WriteOp,
    WriteOutcome,
};
use crate::storage::migrations::Migration;
use crate::storage::query::{Predicate, Query};
use crate::storage::traits::{Capabilities, StorageAdapter, VectorIndex};
use crate::storage::{check_vector_query, without_embedding};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Candidates fetched per requested hit when filters may discard some.
const FILTER_OVERSAMPLE: usize = 4;

/// Ids per `IN (...)` lookup when joining index hits back to rows.
const JOIN_CHUNK: usize = 500;

/// How similarity search is served when the backend cannot do it.
#[derive(Debug, Clone)]
pub enum FallbackStrategy {
    /// Rank ids in an external index and join back to stored rows.
    ExternalIndex(Arc<dyn VectorIndex>),
    /// Match `query_text` terms against the text column instead.
    KeywordDegrade,
}

impl FallbackStrategy {
    /// The search mode results are reported with.
    #[must_use]
    pub const fn mode(&self) -> SearchMode {
        match self {
            Self::ExternalIndex(_) => SearchMode::ExternalIndex,
            Self::KeywordDegrade => SearchMode::KeywordDegraded,
        }
    }
}

enum IndexSync {
    Put(Table, String, Vec<f32>),
    Remove(Table, String),
}

/// Adapter decorator that serves vector search through a fallback.
#[derive(Debug)]
pub struct VectorFallback {
    inner: Arc<dyn StorageAdapter>,
    strategy: FallbackStrategy,
}

impl VectorFallback {
    /// Wraps an adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the index dimensionality differs
    /// from the adapter's.
    pub fn new(inner: Arc<dyn StorageAdapter>, strategy: FallbackStrategy) -> Result<Self> {
        if let FallbackStrategy::ExternalIndex(index) = &strategy
            && index.dimensions() != inner.dimensions()
        {
            return Err(Error::Configuration(format!(
                "external index '{}' has {} dimensions, store has {}",
                index.name(),
                index.dimensions(),
                inner.dimensions()
            )));
        }
        if inner.capabilities().native_vectors {
            tracing::warn!(
                backend = inner.backend(),
                "Vector fallback wraps a backend with native vector search"
            );
        }
        tracing::info!(
            backend = inner.backend(),
            mode = ?strategy.mode(),
            "Vector fallback enabled"
        );
        Ok(Self { inner, strategy })
    }

    /// The configured strategy.
    #[must_use]
    pub const fn strategy(&self) -> &FallbackStrategy {
        &self.strategy
    }

    /// The wrapped adapter.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn StorageAdapter> {
        &self.inner
    }

    const fn index(&self) -> Option<&Arc<dyn VectorIndex>> {
        match &self.strategy {
            FallbackStrategy::ExternalIndex(index) => Some(index),
            FallbackStrategy::KeywordDegrade => None,
        }
    }

    fn sync_for(table: Table, record: &Record) -> Option<IndexSync> {
        if !table.is_vector_collection() {
            return None;
        }
        let id = record.id()?.to_string();
        Some(match record.embedding() {
            Some(embedding) => IndexSync::Put(table, id, embedding),
            None => IndexSync::Remove(table, id),
        })
    }

    async fn sync_one(index: &dyn VectorIndex, sync: &IndexSync) -> Result<()> {
        match sync {
            IndexSync::Put(table, id, embedding) => index.upsert(*table, id, embedding).await,
            IndexSync::Remove(table, id) => index.remove(*table, id).await.map(|_| ()),
        }
    }

    /// Applies index changes after the database committed, logging failures.
    async fn sync_after_commit(&self, operation: &'static str, changes: Vec<IndexSync>) {
        let Some(index) = self.index() else {
            return;
        };
        for change in &changes {
            if let Err(e) = Self::sync_one(index.as_ref(), change).await {
                tracing::warn!(
                    backend = self.inner.backend(),
                    index = index.name(),
                    operation,
                    error = %e,
                    "Vector index out of sync with database; rebuild to repair"
                );
                metrics::counter!(
                    "storage_vector_index_sync_failures_total",
                    "backend" => self.inner.backend(),
                    "operation" => operation
                )
                .increment(1);
            }
        }
    }

    /// Removes a batch whose indexing failed from both stores.
    ///
    /// Every row is attempted; failures are logged and counted so the
    /// caller can still report the indexing error that triggered this.
    async fn compensate_batch(&self, index: &dyn VectorIndex, table: Table, stored: &[Record]) {
        let mut failures = 0_u64;
        for id in stored.iter().filter_map(Record::id) {
            if let Err(e) = self.inner.delete(table, id).await {
                failures += 1;
                tracing::error!(
                    backend = self.inner.backend(),
                    table = table.name(),
                    id,
                    error = %e,
                    "Could not remove row after failed indexing"
                );
            }
            if let Err(e) = index.remove(table, id).await {
                failures += 1;
                tracing::warn!(
                    backend = self.inner.backend(),
                    index = index.name(),
                    id,
                    error = %e,
                    "Could not remove index entry after failed indexing"
                );
            }
        }
        if failures > 0 {
            metrics::counter!(
                "storage_vector_index_sync_failures_total",
                "backend" => self.inner.backend(),
                "operation" => "create_batch"
            )
            .increment(failures);
        }
    }

    /// Vector rows that deleting `ids` from `table` removes, including
    /// cascaded descendants.
    async fn cascade_targets(&self, table: Table, ids: Vec<String>) -> Result<Vec<(Table, String)>> {
        let mut targets = Vec::new();
        let mut seen: HashSet<(Table, String)> = HashSet::new();
        let mut stack = vec![(table, ids)];
        while let Some((table, ids)) = stack.pop() {
            let fresh: Vec<String> = ids
                .into_iter()
                .filter(|id| seen.insert((table, id.clone())))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            if table.is_vector_collection() {
                targets.extend(fresh.iter().map(|id| (table, id.clone())));
            }
            for (child, column) in table.children() {
                if !reaches_vectors(child) {
                    continue;
                }
                let rows = self
                    .inner
                    .list(
                        Query::table(child)
                            .select([ID_FIELD])
                            .filter(Predicate::in_set(column, fresh.iter().cloned())),
                    )
                    .await?;
                let child_ids: Vec<String> = rows
                    .iter()
                    .filter_map(Record::id)
                    .map(ToString::to_string)
                    .collect();
                if !child_ids.is_empty() {
                    stack.push((child, child_ids));
                }
            }
        }
        Ok(targets)
    }

    fn delete_count(ops: &[WriteOp]) -> usize {
        ops.iter()
            .map(|op| match op {
                WriteOp::Delete { .. } => 1,
                WriteOp::Savepoint(group) => Self::delete_count(group),
                _ => 0,
            })
            .sum()
    }

    /// Cascade targets for every delete in a unit, in depth-first op order.
    async fn unit_cascades(&self, ops: &[WriteOp]) -> Result<Vec<Vec<(Table, String)>>> {
        let mut pending: Vec<&WriteOp> = ops.iter().rev().collect();
        let mut cascades = Vec::new();
        while let Some(op) = pending.pop() {
            match op {
                WriteOp::Delete { table, id } => {
                    cascades.push(self.cascade_targets(*table, vec![id.clone()]).await?);
                },
                WriteOp::Savepoint(group) => pending.extend(group.iter().rev()),
                _ => {},
            }
        }
        Ok(cascades)
    }

    fn collect_unit_sync(
        ops: &[WriteOp],
        outcomes: &[WriteOutcome],
        cascades: &mut std::vec::IntoIter<Vec<(Table, String)>>,
        out: &mut Vec<IndexSync>,
    ) {
        for (op, outcome) in ops.iter().zip(outcomes) {
            match (op, outcome) {
                (WriteOp::Create { table, .. }, WriteOutcome::Created(record))
                | (WriteOp::Upsert { table, .. }, WriteOutcome::Upserted(record))
                | (WriteOp::Update { table, .. }, WriteOutcome::Updated(Some(record))) => {
                    out.extend(Self::sync_for(*table, record));
                },
                (WriteOp::Delete { .. }, WriteOutcome::Deleted(deleted)) => {
                    let targets = cascades.next().unwrap_or_default();
                    if *deleted {
                        out.extend(targets.into_iter().map(|(t, id)| IndexSync::Remove(t, id)));
                    }
                },
                (WriteOp::Savepoint(group), WriteOutcome::Group(inner)) => {
                    Self::collect_unit_sync(group, inner, cascades, out);
                },
                (WriteOp::Savepoint(group), WriteOutcome::RolledBack(_)) => {
                    for _ in 0..Self::delete_count(group) {
                        cascades.next();
                    }
                },
                _ => {},
            }
        }
    }

    /// Stored rows for ranked ids that pass the query filters, in rank order.
    async fn join_ranked(
        &self,
        query: &VectorQuery,
        ranked: &[(String, f32)],
    ) -> Result<Vec<ScoredRecord>> {
        let mut by_id: HashMap<String, Record> = HashMap::with_capacity(ranked.len());
        for chunk in ranked.chunks(JOIN_CHUNK) {
            let rows = self
                .inner
                .list(
                    Query::table(query.collection)
                        .filter(Predicate::in_set(ID_FIELD, chunk.iter().map(|(id, _)| id.clone())))
                        .filter_by(&query.filters),
                )
                .await?;
            by_id.extend(rows.into_iter().filter_map(|r| Some((r.id()?.to_string(), r))));
        }
        Ok(ranked
            .iter()
            .filter_map(|(id, score)| {
                by_id.remove(id).map(|record| ScoredRecord {
                    record: without_embedding(record),
                    score: *score,
                })
            })
            .collect())
    }

    /// Ranks in the index, then keeps rows that exist and pass the filters.
    ///
    /// The candidate window doubles until `top_k` rows survive or the
    /// collection is exhausted, so a filter that rejects every near neighbour
    /// still finds the rows it admits.
    async fn search_index(
        &self,
        index: &dyn VectorIndex,
        query: VectorQuery,
    ) -> Result<SearchResults> {
        let total = index.count(query.collection).await?;
        if total == 0 {
            return Ok(SearchResults::new(Vec::new(), SearchMode::ExternalIndex));
        }
        let mut fetch = if query.filters.is_unconstrained() {
            query.top_k
        } else {
            query.top_k.saturating_mul(FILTER_OVERSAMPLE)
        }
        .min(total);

        let mut joined: HashSet<String> = HashSet::new();
        let mut hits: Vec<ScoredRecord> = Vec::new();
        let mut rounds = 0;
        loop {
            rounds += 1;
            let ranked = index.search(query.collection, &query.embedding, fetch).await?;
            let fresh: Vec<(String, f32)> = ranked
                .iter()
                .filter(|(id, _)| joined.insert(id.clone()))
                .cloned()
                .collect();
            hits.extend(self.join_ranked(&query, &fresh).await?);
            if hits.len() >= query.top_k || ranked.len() < fetch || fetch >= total {
                break;
            }
            fetch = fetch.saturating_mul(2).min(total);
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(query.top_k);
        tracing::debug!(
            backend = self.inner.backend(),
            index = index.name(),
            hits = hits.len(),
            rounds,
            "External index search"
        );
        Ok(SearchResults::new(hits, SearchMode::ExternalIndex))
    }

    async fn search_keywords(&self, query: VectorQuery) -> Result<SearchResults> {
        let text = query
            .query_text
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                Error::validation(
                    "search_by_vector",
                    self.inner.backend(),
                    "query_text",
                    "keyword-degrade fallback needs the original query text",
                )
            })?;
        let hits = self
            .inner
            .keyword_search(
                KeywordQuery::new(query.collection, text, query.top_k).with_filters(query.filters),
            )
            .await?
            .into_iter()
            .map(|hit| ScoredRecord {
                record: without_embedding(hit.record),
                score: hit.score,
            })
            .collect();
        tracing::debug!(backend = self.inner.backend(), "Vector search degraded to keywords");
        metrics::counter!(
            "storage_vector_search_degraded_total",
            "backend" => self.inner.backend()
        )
        .increment(1);
        Ok(SearchResults::new(hits, SearchMode::KeywordDegraded))
    }
}

/// Returns `true` if deleting from `table` can cascade into a vector
/// collection.
fn reaches_vectors(table: Table) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![table];
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if current.is_vector_collection() {
            return true;
        }
        stack.extend(current.children().into_iter().map(|(child, _)| child));
    }
    false
}

#[async_trait]
impl StorageAdapter for VectorFallback {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn get(&self, table: Table, id: &str) -> Result<Option<Record>> {
        self.inner.get(table, id).await
    }

    async fn list(&self, query: Query) -> Result<Vec<Record>> {
        self.inner.list(query).await
    }

    async fn count(&self, query: Query) -> Result<u64> {
        self.inner.count(query).await
    }

    async fn create(&self, table: Table, record: Record) -> Result<Record> {
        let stored = self.inner.create(table, record).await?;
        let (Some(index), Some(sync)) = (self.index(), Self::sync_for(table, &stored)) else {
            return Ok(stored);
        };
        if let Err(e) = Self::sync_one(index.as_ref(), &sync).await {
            tracing::warn!(
                backend = self.inner.backend(),
                index = index.name(),
                error = %e,
                "Indexing new row failed, removing it"
            );
            self.compensate_batch(index.as_ref(), table, std::slice::from_ref(&stored)).await;
            return Err(e);
        }
        Ok(stored)
    }

    async fn create_batch(&self, table: Table, records: Vec<Record>) -> Result<Vec<Record>> {
        let stored = self.inner.create_batch(table, records).await?;
        let Some(index) = self.index() else {
            return Ok(stored);
        };
        for record in &stored {
            let Some(sync) = Self::sync_for(table, record) else {
                continue;
            };
            if let Err(e) = Self::sync_one(index.as_ref(), &sync).await {
                tracing::warn!(
                    backend = self.inner.backend(),
                    index = index.name(),
                    rows = stored.len(),
                    error = %e,
                    "Indexing batch failed, removing it"
                );
                self.compensate_batch(index.as_ref(), table, &stored).await;
                return Err(e);
            }
        }
        Ok(stored)
    }

    async fn update(&self, table: Table, id: &str, patch: Record) -> Result<Option<Record>> {
        let touches_index = patch.contains(EMBEDDING_FIELD);
        let updated = self.inner.update(table, id, patch).await?;
        if touches_index && let Some(record) = &updated {
            self.sync_after_commit("update", Self::sync_for(table, record).into_iter().collect())
                .await;
        }
        Ok(updated)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<bool> {
        if self.index().is_none() || !reaches_vectors(table) {
            return self.inner.delete(table, id).await;
        }
        let targets = self.cascade_targets(table, vec![id.to_string()]).await?;
        let deleted = self.inner.delete(table, id).await?;
        if deleted {
            let changes = targets.into_iter().map(|(t, id)| IndexSync::Remove(t, id)).collect();
            self.sync_after_commit("delete", changes).await;
        }
        Ok(deleted)
    }

    async fn delete_matching(&self, query: Query) -> Result<u64> {
        if self.index().is_none() || !reaches_vectors(query.table) {
            return self.inner.delete_matching(query).await;
        }
        let matched = self.inner.list(query.clone().select([ID_FIELD])).await?;
        let ids = matched.iter().filter_map(Record::id).map(ToString::to_string).collect();
        let targets = self.cascade_targets(query.table, ids).await?;
        let deleted = self.inner.delete_matching(query).await?;
        let changes = targets.into_iter().map(|(t, id)| IndexSync::Remove(t, id)).collect();
        self.sync_after_commit("delete_matching", changes).await;
        Ok(deleted)
    }

    async fn upsert(&self, table: Table, record: Record) -> Result<Record> {
        let touches_index = record.contains(EMBEDDING_FIELD);
        let stored = self.inner.upsert(table, record).await?;
        if touches_index {
            self.sync_after_commit("upsert", Self::sync_for(table, &stored).into_iter().collect())
                .await;
        }
        Ok(stored)
    }

    async fn apply(&self, unit: UnitOfWork) -> Result<Vec<WriteOutcome>> {
        if self.index().is_none() {
            return self.inner.apply(unit).await;
        }
        let ops = unit.ops().to_vec();
        let cascades = self.unit_cascades(&ops).await?;
        let outcomes = self.inner.apply(unit).await?;

        let mut changes = Vec::new();
        Self::collect_unit_sync(&ops, &outcomes, &mut cascades.into_iter(), &mut changes);
        self.sync_after_commit("apply", changes).await;
        Ok(outcomes)
    }

    async fn search_by_vector(&self, query: VectorQuery) -> Result<SearchResults> {
        check_vector_query(&query, self.inner.backend(), self.inner.dimensions())?;
        if query.top_k == 0 {
            return Ok(SearchResults::new(Vec::new(), self.strategy.mode()));
        }
        match &self.strategy {
            FallbackStrategy::ExternalIndex(index) => self.search_index(index.as_ref(), query).await,
            FallbackStrategy::KeywordDegrade => self.search_keywords(query).await,
        }
    }

    async fn keyword_search(&self, query: KeywordQuery) -> Result<Vec<ScoredRecord>> {
        self.inner.keyword_search(query).await
    }

    async fn call_procedure(&self, name: &str, params: Value) -> Result<Vec<Record>> {
        self.inner.call_procedure(name, params).await
    }

    async fn ensure_ledger(&self) -> Result<()> {
        self.inner.ensure_ledger().await
    }

    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>> {
        self.inner.applied_migrations().await
    }

    async fn record_migration_failure(&self, failure: &MigrationFailure) -> Result<()> {
        self.inner.record_migration_failure(failure).await
    }

    async fn migration_failures(&self) -> Result<Vec<MigrationFailure>> {
        self.inner.migration_failures().await
    }

    async fn clear_migration_failure(&self, version: &str) -> Result<bool> {
        self.inner.clear_migration_failure(version).await
    }

    async fn apply_migration(&self, migration: &Migration, checksum: &str) -> Result<ApplyOutcome> {
        self.inner.apply_migration(migration, checksum).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }

    async fn rebuild_vector_index(&self, table: Table) -> Result<usize> {
        let Some(index) = self.index() else {
            return Ok(0);
        };
        if !table.is_vector_collection() {
            return Ok(0);
        }
        index.clear(table).await?;
        let rows = self
            .inner
            .list(Query::table(table).select([EMBEDDING_FIELD]))
            .await?;
        let mut indexed = 0;
        for row in &rows {
            if let (Some(id), Some(embedding)) = (row.id(), row.embedding()) {
                index.upsert(table, id, &embedding).await?;
                indexed += 1;
            }
        }
        tracing::info!(
            backend = self.inner.backend(),
            index = index.name(),
            table = %table,
            indexed,
            "Rebuilt vector index"
        );
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::models::VectorRecord;
    use crate::storage::migrations::MigrationTracker;
    use crate::storage::sqlite::SqliteAdapter;
    use crate::storage::vector::InMemoryVectorIndex;

    async fn store() -> (VectorFallback, Arc<InMemoryVectorIndex>) {
        let sqlite = SqliteAdapter::in_memory(3).unwrap();
        MigrationTracker::builtin(3).unwrap().run(&sqlite).await.unwrap();
        let index = Arc::new(InMemoryVectorIndex::new(3));
        let fallback = VectorFallback::new(
            Arc::new(sqlite),
            FallbackStrategy::ExternalIndex(Arc::clone(&index) as Arc<dyn VectorIndex>),
        )
        .unwrap();
        (fallback, index)
    }

    async fn source(adapter: &dyn StorageAdapter) -> String {
        let row = adapter
            .create(Table::Sources, Record::new().with("source_url", "https://docs.rs"))
            .await
            .unwrap();
        row.id().unwrap().to_string()
    }

    fn chunk(source_id: &str, content: &str, embedding: Vec<f32>) -> Record {
        VectorRecord::new(content, embedding).with("source_id", source_id).into_record()
    }

    #[tokio::test]
    async fn test_external_index_search_joins_rows() {
        let (store, index) = store().await;
        let src = source(&store).await;
        store.create(Table::DocumentChunks, chunk(&src, "alpha", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.create(Table::DocumentChunks, chunk(&src, "beta", vec![0.0, 1.0, 0.0])).await.unwrap();
        assert_eq!(index.count(Table::DocumentChunks).await.unwrap(), 2);

        let results = store
            .search_by_vector(VectorQuery::new(Table::DocumentChunks, vec![1.0, 0.1, 0.0], 1))
            .await
            .unwrap();
        assert_eq!(results.mode, SearchMode::ExternalIndex);
        assert_eq!(results.len(), 1);
        assert_eq!(results.hits[0].record.get_str("content"), Some("alpha"));
        assert!(!results.hits[0].record.contains("embedding"));
    }

    #[tokio::test]
    async fn test_external_index_applies_filters() {
        let (store, _index) = store().await;
        let a = source(&store).await;
        let b = source(&store).await;
        store.create(Table::DocumentChunks, chunk(&a, "near", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.create(Table::DocumentChunks, chunk(&b, "far", vec![0.5, 0.5, 0.0])).await.unwrap();

        let results = store
            .search_by_vector(
                VectorQuery::new(Table::DocumentChunks, vec![1.0, 0.0, 0.0], 5)
                    .with_filters(crate::models::Filter::new().eq("source_id", b.as_str())),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results.hits[0].record.get_str("content"), Some("far"));
    }

    #[tokio::test]
    async fn test_filter_reaches_past_rejected_neighbours() {
        let (store, _index) = store().await;
        let a = source(&store).await;
        let b = source(&store).await;
        let crowd: Vec<Record> = (0..10)
            .map(|n| chunk(&a, &format!("near {n}"), vec![1.0, 0.0, 0.0]))
            .collect();
        store.create_batch(Table::DocumentChunks, crowd).await.unwrap();
        store.create(Table::DocumentChunks, chunk(&b, "far", vec![0.5, 0.5, 0.0])).await.unwrap();

        let results = store
            .search_by_vector(
                VectorQuery::new(Table::DocumentChunks, vec![1.0, 0.0, 0.0], 1)
                    .with_filters(crate::models::Filter::new().eq("source_id", b.as_str())),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results.hits[0].record.get_str("content"), Some("far"));

        let none = store
            .search_by_vector(
                VectorQuery::new(Table::DocumentChunks, vec![1.0, 0.0, 0.0], 3)
                    .with_filters(crate::models::Filter::new().eq("source_id", "missing")),
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    /// Accepts `healthy_writes` upserts, then fails every write.
    #[derive(Debug)]
    struct FlakyIndex {
        inner: InMemoryVectorIndex,
        healthy_writes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl VectorIndex for FlakyIndex {
        fn name(&self) -> &'static str {
            "flaky-index"
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn upsert(&self, collection: Table, id: &str, embedding: &[f32]) -> Result<()> {
            let left = self.healthy_writes.load(std::sync::atomic::Ordering::SeqCst);
            if left == 0 {
                return Err(Error::connectivity("index_upsert", "flaky-index", "index offline"));
            }
            self.healthy_writes.store(left - 1, std::sync::atomic::Ordering::SeqCst);
            self.inner.upsert(collection, id, embedding).await
        }

        async fn remove(&self, _collection: Table, _id: &str) -> Result<bool> {
            Err(Error::connectivity("index_remove", "flaky-index", "index offline"))
        }

        async fn search(&self, collection: Table, embedding: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
            self.inner.search(collection, embedding, limit).await
        }

        async fn count(&self, collection: Table) -> Result<usize> {
            self.inner.count(collection).await
        }

        async fn clear(&self, collection: Table) -> Result<()> {
            self.inner.clear(collection).await
        }
    }

    #[tokio::test]
    async fn test_failed_batch_indexing_removes_every_row() {
        let sqlite = SqliteAdapter::in_memory(3).unwrap();
        MigrationTracker::builtin(3).unwrap().run(&sqlite).await.unwrap();
        let index = Arc::new(FlakyIndex {
            inner: InMemoryVectorIndex::new(3),
            healthy_writes: std::sync::atomic::AtomicUsize::new(1),
        });
        let store = VectorFallback::new(Arc::new(sqlite), FallbackStrategy::ExternalIndex(index)).unwrap();
        let src = source(&store).await;

        let batch = vec![
            chunk(&src, "one", vec![1.0, 0.0, 0.0]),
            chunk(&src, "two", vec![0.0, 1.0, 0.0]),
            chunk(&src, "three", vec![0.0, 0.0, 1.0]),
        ];
        let err = store.create_batch(Table::DocumentChunks, batch).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(err.to_string().contains("index_upsert"));
        assert_eq!(store.count(Query::table(Table::DocumentChunks)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cascade_delete_purges_index() {
        let (store, index) = store().await;
        let src = source(&store).await;
        store.create(Table::DocumentChunks, chunk(&src, "alpha", vec![1.0, 0.0, 0.0])).await.unwrap();
        store
            .create(
                Table::CodeExamples,
                VectorRecord::new("fn main() {}", vec![0.0, 0.0, 1.0])
                    .with("source_id", src.as_str())
                    .into_record(),
            )
            .await
            .unwrap();

        assert!(store.delete(Table::Sources, &src).await.unwrap());
        assert_eq!(index.count(Table::DocumentChunks).await.unwrap(), 0);
        assert_eq!(index.count(Table::CodeExamples).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rebuild_restores_index() {
        let (store, index) = store().await;
        let src = source(&store).await;
        store.create(Table::DocumentChunks, chunk(&src, "alpha", vec![1.0, 0.0, 0.0])).await.unwrap();
        index.clear(Table::DocumentChunks).await.unwrap();

        assert_eq!(store.rebuild_vector_index(Table::DocumentChunks).await.unwrap(), 1);
        assert_eq!(store.rebuild_vector_index(Table::Settings).await.unwrap(), 0);
        assert_eq!(index.count(Table::DocumentChunks).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unit_of_work_syncs_index() {
        let (store, index) = store().await;
        let src = source(&store).await;
        let unit = UnitOfWork::new()
            .create(Table::DocumentChunks, chunk(&src, "a", vec![1.0, 0.0, 0.0]).with("id", "c1"))
            .create(Table::DocumentChunks, chunk(&src, "b", vec![0.0, 1.0, 0.0]).with("id", "c2"))
            .delete(Table::DocumentChunks, "c1");
        store.apply(unit).await.unwrap();

        assert_eq!(index.count(Table::DocumentChunks).await.unwrap(), 1);
        let hits = index.search(Table::DocumentChunks, &[0.0, 1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits[0].0, "c2");
    }

    #[tokio::test]
    async fn test_keyword_degrade_needs_text() {
        let sqlite = SqliteAdapter::in_memory(3).unwrap();
        MigrationTracker::builtin(3).unwrap().run(&sqlite).await.unwrap();
        let store = VectorFallback::new(Arc::new(sqlite), FallbackStrategy::KeywordDegrade).unwrap();
        let src = source(&store).await;
        store.create(Table::DocumentChunks, chunk(&src, "tokio runtime", vec![1.0, 0.0, 0.0])).await.unwrap();

        let err = store
            .search_by_vector(VectorQuery::new(Table::DocumentChunks, vec![1.0, 0.0, 0.0], 5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.field(), Some("query_text"));

        let results = store
            .search_by_vector(
                VectorQuery::new(Table::DocumentChunks, vec![1.0, 0.0, 0.0], 5).with_text("Tokio"),
            )
            .await
            .unwrap();
        assert_eq!(results.mode, SearchMode::KeywordDegraded);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_mismatched_index_dimensions_rejected() {
        let sqlite = SqliteAdapter::in_memory(3).unwrap();
        let err = VectorFallback::new(
            Arc::new(sqlite),
            FallbackStrategy::ExternalIndex(Arc::new(InMemoryVectorIndex::new(4))),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_reaches_vectors() {
        assert!(reaches_vectors(Table::Sources));
        assert!(reaches_vectors(Table::Pages));
        assert!(!reaches_vectors(Table::Projects));
        assert!(!reaches_vectors(Table::Tasks));
    }
}
