//! The facade application code talks to.
//!
//! A [`Repository`] is built once per process from a [`StoreConfig`]. It
//! owns the [`ConnectionManager`] and a [`MigrationTracker`], and hands out
//! per-table handles:
//!
//! ```rust,ignore
//! let repo = Repository::new(StoreConfig::sqlite("kb.db", 1536))?;
//! repo.migrate().await?;
//!
//! let project = repo.projects().create(Record::new().with("title", "Docs")).await?;
//! let open = repo.tasks().list_for_project(project.id().unwrap_or_default(), false).await?;
//! repo.settings().upsert("theme", "dark", Some("ui")).await?;
//! ```
//!
//! Reads go through [`ConnectionManager::run_read`] (replicas when
//! configured), writes through [`ConnectionManager::run_write`].

use crate::config::StoreConfig;
use crate::manager::{ConnectionManager, EndpointHealth};
use crate::models::{
    Filter, HybridQuery, HybridResults, KeywordQuery, MigrationRecord, MigrationStatus, Record,
    ScoredRecord, SearchResults, Table, UnitOfWork, VectorQuery, VectorRecord, WriteOutcome,
};
use crate::storage::migrations::{Migration, MigrationTracker, builtin_migrations};
use crate::storage::query::{Direction, Join, Predicate, Query};
use crate::storage::traits::Capabilities;
use crate::storage::vector::hybrid_search;
use crate::{Error, Result};
use serde_json::Value;
use std::ops::Deref;

/// Backend label for errors raised by the facade itself.
const FACADE: &str = "repository";

/// Data access facade for one store.
#[derive(Debug)]
pub struct Repository {
    manager: ConnectionManager,
    tracker: MigrationTracker,
}

impl Repository {
    /// Creates a repository with the built-in migrations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid.
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_migrations(config, builtin_migrations())
    }

    /// Creates a repository with an explicit migration list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid or
    /// migration versions are out of order.
    pub fn with_migrations(config: StoreConfig, migrations: Vec<Migration>) -> Result<Self> {
        let tracker = MigrationTracker::new(migrations, config.embedding_dimensions)?;
        let manager = ConnectionManager::new(config)?;
        Ok(Self { manager, tracker })
    }

    /// The connection manager.
    #[must_use]
    pub const fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// The migration tracker.
    #[must_use]
    pub const fn tracker(&self) -> &MigrationTracker {
        &self.tracker
    }

    /// Capabilities of the primary backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the primary cannot be reached.
    pub async fn capabilities(&self) -> Result<Capabilities> {
        Ok(self.manager.get_primary().await?.capabilities())
    }

    const fn table(&self, table: Table) -> TableHandle<'_> {
        TableHandle { repo: self, table }
    }

    /// Knowledge sources.
    #[must_use]
    pub const fn sources(&self) -> TableHandle<'_> {
        self.table(Table::Sources)
    }

    /// Page and document metadata.
    #[must_use]
    pub const fn pages(&self) -> TableHandle<'_> {
        self.table(Table::Pages)
    }

    /// Crawled-page records.
    #[must_use]
    pub const fn crawled_pages(&self) -> TableHandle<'_> {
        self.table(Table::CrawledPages)
    }

    /// Document chunks with embeddings.
    #[must_use]
    pub const fn document_chunks(&self) -> VectorHandle<'_> {
        VectorHandle(self.table(Table::DocumentChunks))
    }

    /// Code examples with embeddings.
    #[must_use]
    pub const fn code_examples(&self) -> VectorHandle<'_> {
        VectorHandle(self.table(Table::CodeExamples))
    }

    /// Key/value settings.
    #[must_use]
    pub const fn settings(&self) -> SettingsHandle<'_> {
        SettingsHandle(self.table(Table::Settings))
    }

    /// Projects.
    #[must_use]
    pub const fn projects(&self) -> TableHandle<'_> {
        self.table(Table::Projects)
    }

    /// Tasks.
    #[must_use]
    pub const fn tasks(&self) -> TaskHandle<'_> {
        TaskHandle(self.table(Table::Tasks))
    }

    /// Document version history.
    #[must_use]
    pub const fn document_versions(&self) -> TableHandle<'_> {
        self.table(Table::DocumentVersions)
    }

    /// Project to source links.
    #[must_use]
    pub const fn project_sources(&self) -> ProjectSourceHandle<'_> {
        ProjectSourceHandle(self.table(Table::ProjectSources))
    }

    /// Deletes a source and everything crawled or linked from it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails. A miss is `Ok(false)`.
    pub async fn delete_source(&self, id: &str) -> Result<bool> {
        self.sources().delete(id).await
    }

    /// Similarity search in a vector collection.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a non-vector table or a wrong
    /// embedding length.
    pub async fn search_by_vector(&self, query: VectorQuery) -> Result<SearchResults> {
        self.manager
            .run_read("search_by_vector", |adapter| {
                let query = query.clone();
                async move { adapter.search_by_vector(query).await }
            })
            .await
    }

    /// Term-match search over a table's text column.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the table has no text column.
    pub async fn keyword_search(&self, query: KeywordQuery) -> Result<Vec<ScoredRecord>> {
        self.manager
            .run_read("keyword_search", |adapter| {
                let query = query.clone();
                async move { adapter.keyword_search(query).await }
            })
            .await
    }

    /// Keyword and vector search merged by the query's policy.
    ///
    /// # Errors
    ///
    /// Returns a validation error for empty text, or any search error.
    pub async fn hybrid_search(&self, query: HybridQuery) -> Result<HybridResults> {
        self.manager
            .run_read("hybrid_search", |adapter| {
                let query = query.clone();
                async move { hybrid_search(adapter.as_ref(), query).await }
            })
            .await
    }

    /// Runs a stored procedure on the primary.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown procedure.
    pub async fn call_procedure(&self, name: &str, params: Value) -> Result<Vec<Record>> {
        self.manager
            .run_write("call_procedure", |adapter| {
                let params = params.clone();
                async move { adapter.call_procedure(name, params).await }
            })
            .await
    }

    /// Applies a unit of work on the primary.
    ///
    /// # Errors
    ///
    /// Returns the first failing write's error.
    pub async fn apply(&self, unit: UnitOfWork) -> Result<Vec<WriteOutcome>> {
        self.manager
            .run_write("apply", |adapter| {
                let unit = unit.clone();
                async move { adapter.apply(unit).await }
            })
            .await
    }

    /// Applies pending migrations on the primary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Migration`] for a failed or previously failed
    /// migration, or a checksum mismatch.
    pub async fn migrate(&self) -> Result<Vec<MigrationRecord>> {
        let adapter = self.manager.get_primary().await?;
        self.tracker.run(adapter.as_ref()).await
    }

    /// Checks ledger checksums against the known migrations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Migration`] on a mismatch.
    pub async fn verify_migrations(&self) -> Result<Vec<MigrationRecord>> {
        let adapter = self.manager.get_primary().await?;
        self.tracker.verify(adapter.as_ref()).await
    }

    /// Status of every known migration.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub async fn migration_status(&self) -> Result<Vec<MigrationStatus>> {
        let adapter = self.manager.get_primary().await?;
        self.tracker.status(adapter.as_ref()).await
    }

    /// Clears a failed migration so the next [`migrate`](Self::migrate)
    /// retries it. Returns `false` if the version had not failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend's failure record cannot be cleared.
    pub async fn acknowledge_failure(&self, version: &str) -> Result<bool> {
        let adapter = self.manager.get_primary().await?;
        self.tracker.acknowledge_failure(adapter.as_ref(), version).await
    }

    /// Health of the primary and every replica.
    pub async fn health(&self) -> Vec<EndpointHealth> {
        self.manager.health().await
    }

    /// Drops cached adapters.
    pub fn reset(&self) {
        self.manager.reset();
    }
}

/// Operations shared by every table.
#[derive(Debug, Clone, Copy)]
pub struct TableHandle<'a> {
    repo: &'a Repository,
    table: Table,
}

impl TableHandle<'_> {
    /// The table this handle serves.
    #[must_use]
    pub const fn table(&self) -> Table {
        self.table
    }

    /// Fetches one row. A miss is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn get(&self, id: &str) -> Result<Option<Record>> {
        let table = self.table;
        self.repo
            .manager
            .run_read("get", |adapter| async move { adapter.get(table, id).await })
            .await
    }

    /// Every row, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn list(&self) -> Result<Vec<Record>> {
        self.query(Query::table(self.table)).await
    }

    /// Rows matching every non-null filter entry.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields.
    pub async fn list_where(&self, filter: &Filter) -> Result<Vec<Record>> {
        self.query(Query::table(self.table).filter_by(filter)).await
    }

    /// Runs a query against this table.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the query targets another table or
    /// names unknown fields.
    pub async fn query(&self, query: Query) -> Result<Vec<Record>> {
        self.check_table(&query)?;
        self.repo
            .manager
            .run_read("list", |adapter| {
                let query = query.clone();
                async move { adapter.list(query).await }
            })
            .await
    }

    /// Number of rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn count(&self) -> Result<u64> {
        self.count_where(&Filter::new()).await
    }

    /// Number of rows matching a filter.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields.
    pub async fn count_where(&self, filter: &Filter) -> Result<u64> {
        let query = Query::table(self.table).filter_by(filter);
        self.repo
            .manager
            .run_read("count", |adapter| {
                let query = query.clone();
                async move { adapter.count(query).await }
            })
            .await
    }

    /// Inserts a row with every default written explicitly.
    ///
    /// # Errors
    ///
    /// Returns a validation or constraint error.
    pub async fn create(&self, record: Record) -> Result<Record> {
        let table = self.table;
        self.repo
            .manager
            .run_write("create", |adapter| {
                let record = record.clone();
                async move { adapter.create(table, record).await }
            })
            .await
    }

    /// Inserts rows, all or nothing where the backend allows.
    ///
    /// # Errors
    ///
    /// Returns a validation or constraint error. No row is written if any
    /// row fails validation.
    pub async fn create_batch(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        let table = self.table;
        self.repo
            .manager
            .run_write("create_batch", |adapter| {
                let records = records.clone();
                async move { adapter.create_batch(table, records).await }
            })
            .await
    }

    /// Merges a patch into a row. A miss is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields.
    pub async fn update(&self, id: &str, patch: Record) -> Result<Option<Record>> {
        let table = self.table;
        self.repo
            .manager
            .run_write("update", |adapter| {
                let patch = patch.clone();
                async move { adapter.update(table, id, patch).await }
            })
            .await
    }

    /// Inserts or updates by the table's conflict key.
    ///
    /// # Errors
    ///
    /// Returns a validation or constraint error.
    pub async fn upsert(&self, record: Record) -> Result<Record> {
        let table = self.table;
        self.repo
            .manager
            .run_write("upsert", |adapter| {
                let record = record.clone();
                async move { adapter.upsert(table, record).await }
            })
            .await
    }

    /// Deletes a row and its dependents. A miss is `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let table = self.table;
        self.repo
            .manager
            .run_write("delete", |adapter| async move { adapter.delete(table, id).await })
            .await
    }

    /// Deletes rows matching a filter.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a filter that constrains nothing.
    pub async fn delete_where(&self, filter: &Filter) -> Result<u64> {
        if filter.is_unconstrained() {
            return Err(Error::validation(
                "delete_where",
                FACADE,
                "filter",
                "refusing to delete every row; pass at least one non-null field",
            ));
        }
        let query = Query::table(self.table).filter_by(filter);
        self.repo
            .manager
            .run_write("delete_matching", |adapter| {
                let query = query.clone();
                async move { adapter.delete_matching(query).await }
            })
            .await
    }

    fn check_table(&self, query: &Query) -> Result<()> {
        if query.table == self.table {
            Ok(())
        } else {
            Err(Error::validation(
                "query",
                FACADE,
                "table",
                format!("query targets '{}', handle serves '{}'", query.table, self.table),
            ))
        }
    }
}

/// A vector collection.
#[derive(Debug, Clone, Copy)]
pub struct VectorHandle<'a>(TableHandle<'a>);

impl<'a> Deref for VectorHandle<'a> {
    type Target = TableHandle<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl VectorHandle<'_> {
    /// Inserts embedded records in one batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] on `embedding` if any vector has the
    /// wrong length. Nothing is written in that case.
    pub async fn insert_vectors(&self, records: Vec<VectorRecord>) -> Result<Vec<Record>> {
        let rows = records.into_iter().map(VectorRecord::into_record).collect();
        self.create_batch(rows).await
    }

    /// Nearest neighbours of `embedding`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a wrong embedding length.
    pub async fn search(&self, embedding: Vec<f32>, top_k: usize, filters: Filter) -> Result<SearchResults> {
        let query = VectorQuery::new(self.table, embedding, top_k).with_filters(filters);
        self.repo.search_by_vector(query).await
    }
}

/// Tasks, with project-scoped listing.
#[derive(Debug, Clone, Copy)]
pub struct TaskHandle<'a>(TableHandle<'a>);

impl<'a> Deref for TaskHandle<'a> {
    type Target = TableHandle<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TaskHandle<'_> {
    /// Tasks of a project in board order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn list_for_project(&self, project_id: &str, include_archived: bool) -> Result<Vec<Record>> {
        let mut query = Query::table(Table::Tasks)
            .filter(Predicate::equals("project_id", project_id))
            .order_by("task_order", Direction::Asc);
        if !include_archived {
            query = query.filter(Predicate::equals("archived", false));
        }
        self.query(query).await
    }

    /// Tasks of a project in one status.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn list_by_status(&self, project_id: &str, status: &str) -> Result<Vec<Record>> {
        let query = Query::table(Table::Tasks)
            .filter(Predicate::equals("project_id", project_id))
            .filter(Predicate::equals("status", status))
            .filter(Predicate::equals("archived", false))
            .order_by("task_order", Direction::Asc);
        self.query(query).await
    }
}

/// Project to source links.
#[derive(Debug, Clone, Copy)]
pub struct ProjectSourceHandle<'a>(TableHandle<'a>);

impl<'a> Deref for ProjectSourceHandle<'a> {
    type Target = TableHandle<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ProjectSourceHandle<'_> {
    /// Link rows of a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn list_for_project(&self, project_id: &str) -> Result<Vec<Record>> {
        let query =
            Query::table(Table::ProjectSources).filter(Predicate::equals("project_id", project_id));
        self.query(query).await
    }

    /// Sources linked to a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn sources_for_project(&self, project_id: &str) -> Result<Vec<Record>> {
        let query = Query::table(Table::Sources).join(
            Join::new(Table::ProjectSources, "id", "source_id")
                .filter(Predicate::equals("project_id", project_id)),
        );
        self.repo.sources().query(query).await
    }

    /// Links a source to a project.
    ///
    /// # Errors
    ///
    /// Returns a constraint error if either side does not exist.
    pub async fn link(&self, project_id: &str, source_id: &str, notes: Option<&str>) -> Result<Record> {
        let mut record = Record::new()
            .with("project_id", project_id)
            .with("source_id", source_id);
        if let Some(notes) = notes {
            record.insert("notes", notes);
        }
        self.create(record).await
    }
}

/// Key/value settings.
#[derive(Debug, Clone, Copy)]
pub struct SettingsHandle<'a>(TableHandle<'a>);

impl<'a> Deref for SettingsHandle<'a> {
    type Target = TableHandle<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SettingsHandle<'_> {
    /// The setting row for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn get_by_key(&self, key: &str) -> Result<Option<Record>> {
        let query = Query::table(Table::Settings)
            .filter(Predicate::equals("key", key))
            .limit(1);
        Ok(self.query(query).await?.into_iter().next())
    }

    /// The value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get_by_key(key)
            .await?
            .and_then(|row| row.get_str("value").map(ToString::to_string)))
    }

    /// Writes `value` under `key`. A repeated identical call changes
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty key.
    pub async fn upsert(&self, key: &str, value: impl Into<String>, category: Option<&str>) -> Result<Record> {
        if key.trim().is_empty() {
            return Err(Error::validation("upsert", FACADE, "key", "setting key must not be empty"));
        }
        let mut record = Record::new().with("key", key).with("value", value.into());
        if let Some(category) = category {
            record.insert("category", category);
        }
        self.0.upsert(record).await
    }

    /// Settings in a category, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn list_by_category(&self, category: &str) -> Result<Vec<Record>> {
        let query =
            Query::table(Table::Settings).filter(Predicate::equals("category", category));
        self.query(query).await
    }
}
