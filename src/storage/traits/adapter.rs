//! The repository contract every backend implements.
//!
//! # Available Implementations
//!
//! | Adapter | Native vectors | Transactions | Feature |
//! |---------|----------------|--------------|---------|
//! | `ManagedAdapter` | Yes (RPC) | Row-level only | `managed` |
//! | `PostgresAdapter` (pgvector) | Yes | Full, savepoints | `postgres` |
//! | `PostgresAdapter` (plain) | No, fallback | Full, savepoints | `postgres` |
//! | `SqliteAdapter` | No, fallback | Full, single writer | default |
//! | `InMemoryAdapter` | Yes (brute force) | Snapshot/restore | default |

use crate::models::{
    ApplyOutcome, KeywordQuery, MigrationFailure, MigrationRecord, Record, ScoredRecord, SearchResults, Table,
    UnitOfWork, VectorQuery, WriteOutcome,
};
use crate::storage::migrations::Migration;
use crate::storage::query::Query;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// What a backend can do natively.
///
/// Callers branch on capabilities, never on backend identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    /// Cosine similarity search runs inside the backend.
    pub native_vectors: bool,
    /// A multi-table unit of work commits atomically.
    pub transactional_batches: bool,
    /// Schema changes roll back with their transaction.
    pub transactional_ddl: bool,
    /// Nested savepoints inside a unit of work.
    pub savepoints: bool,
}

/// Trait for storage backends.
///
/// Every method is async and takes `&self`; adapters are shared as
/// `Arc<dyn StorageAdapter>` and use interior mutability or pools.
///
/// # Absent values
///
/// `get` returns `Ok(None)` on a miss and list-style methods return an
/// empty `Vec`. No method reports "not found" as an error.
///
/// # Invariants
///
/// Each implementation enforces on its own:
///
/// - embedding length equals [`dimensions()`](StorageAdapter::dimensions);
/// - deleting a row cascades through the declared foreign keys;
/// - `update` merges through [`merge_record`](crate::models::merge_record)
///   semantics and never clears omitted fields;
/// - `upsert` is idempotent under repeated identical calls;
/// - `create` writes every column default explicitly.
#[async_trait]
pub trait StorageAdapter: Send + Sync + std::fmt::Debug {
    /// Backend name used in errors, logs and metrics.
    fn backend(&self) -> &'static str;

    /// Native capabilities.
    fn capabilities(&self) -> Capabilities;

    /// Configured embedding dimensionality.
    fn dimensions(&self) -> usize;

    /// Fetches one row by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails. A miss is `Ok(None)`.
    async fn get(&self, table: Table, id: &str) -> Result<Option<Record>>;

    /// Runs a query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`](crate::Error::Validation) for unknown
    /// fields, or a backend error.
    async fn list(&self, query: Query) -> Result<Vec<Record>>;

    /// Counts rows matching a query. Limit and offset are ignored.
    ///
    /// # Errors
    ///
    /// Same as [`list`](StorageAdapter::list).
    async fn count(&self, query: Query) -> Result<u64>;

    /// Inserts one row and returns it as stored.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad input, or a constraint violation
    /// for duplicate keys and missing parents.
    async fn create(&self, table: Table, record: Record) -> Result<Record>;

    /// Inserts rows atomically where the backend supports it.
    ///
    /// Every row is validated before any row is written.
    ///
    /// # Errors
    ///
    /// Same as [`create`](StorageAdapter::create).
    async fn create_batch(&self, table: Table, records: Vec<Record>) -> Result<Vec<Record>>;

    /// Merges a patch into one row. Returns `None` if the id does not exist.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields or a changed id.
    async fn update(&self, table: Table, id: &str, patch: Record) -> Result<Option<Record>>;

    /// Deletes one row and everything that depends on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails. A miss is `Ok(false)`.
    async fn delete(&self, table: Table, id: &str) -> Result<bool>;

    /// Deletes every row matching a query. Returns the number deleted,
    /// not counting cascaded dependents.
    ///
    /// # Errors
    ///
    /// Same as [`list`](StorageAdapter::list).
    async fn delete_matching(&self, query: Query) -> Result<u64>;

    /// Inserts or updates by the table's conflict key.
    ///
    /// On conflict only the supplied fields are overwritten, and a repeated
    /// identical call changes nothing.
    ///
    /// # Errors
    ///
    /// Same as [`create`](StorageAdapter::create).
    async fn upsert(&self, table: Table, record: Record) -> Result<Record>;

    /// Applies a unit of work in statement order.
    ///
    /// # Errors
    ///
    /// Returns the first failing write's error. On transactional backends
    /// nothing is committed in that case.
    async fn apply(&self, unit: UnitOfWork) -> Result<Vec<WriteOutcome>>;

    /// Nearest-neighbour search within a vector collection.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a non-vector table or a wrong query
    /// length.
    async fn search_by_vector(&self, query: VectorQuery) -> Result<SearchResults>;

    /// Term-match search over a table's text column.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the table has no text column.
    async fn keyword_search(&self, query: KeywordQuery) -> Result<Vec<ScoredRecord>>;

    /// Runs a named stored procedure with JSON parameters.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown procedure name.
    async fn call_procedure(&self, name: &str, params: Value) -> Result<Vec<Record>>;

    /// Creates the migration ledger if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be created.
    async fn ensure_ledger(&self) -> Result<()>;

    /// Ledger rows ordered by version.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>>;

    /// Applies one migration and records it, or reports it already applied.
    ///
    /// # Errors
    ///
    /// Returns an error if a schema change fails. No ledger row is written
    /// in that case.
    async fn apply_migration(&self, migration: &Migration, checksum: &str) -> Result<ApplyOutcome>;

    /// Records that a migration failed, replacing any earlier record for
    /// the same version.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    async fn record_migration_failure(&self, failure: &MigrationFailure) -> Result<()>;

    /// Unacknowledged failure records ordered by version.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    async fn migration_failures(&self) -> Result<Vec<MigrationFailure>>;

    /// Removes the failure record for `version`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be removed.
    async fn clear_migration_failure(&self, version: &str) -> Result<bool>;

    /// Round-trips to the backend.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if the backend is unreachable.
    async fn health_check(&self) -> Result<()>;

    /// Rebuilds any external vector index for a collection from stored rows.
    /// Returns the number of indexed rows.
    ///
    /// # Errors
    ///
    /// Returns an error if rows cannot be read or indexed.
    async fn rebuild_vector_index(&self, _table: Table) -> Result<usize> {
        Ok(0)
    }
}
