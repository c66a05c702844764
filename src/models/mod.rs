//! Backend-agnostic value types.
//!
//! Everything that crosses the [`StorageAdapter`](crate::StorageAdapter)
//! boundary lives here: records, filters, table descriptors, search requests
//! and results, units of work and migration ledger rows.

pub mod merge;
mod migration;
mod record;
pub mod schema;
mod search;
mod unit;

pub use merge::merge_record;
pub use migration::{ApplyOutcome, MigrationFailure, MigrationRecord, MigrationState, MigrationStatus};
pub use record::{
    CONTENT_FIELD, EMBEDDING_FIELD, Filter, ID_FIELD, Record, VectorRecord, embedding_from_value,
    embedding_to_value,
};
pub use schema::{Column, ColumnDefault, ColumnType, Table, TableSchema, WriteContext};
pub use search::{
    HybridHit, HybridPolicy, HybridQuery, HybridResults, KeywordQuery, MAX_KEYWORD_TERMS,
    ScoredRecord, SearchMode, SearchResults, VectorQuery,
};
pub use unit::{UnitOfWork, WriteOp, WriteOutcome};
