//! External vector index trait.
//!
//! Used by the fallback layer on backends without native vector search.
//! Indexes are keyed by `(collection, record id)` and hold only embeddings;
//! the database stays the source of truth for everything else.
//!
//! # Available Implementations
//!
//! | Index | Use Case | Feature |
//! |-------|----------|---------|
//! | `InMemoryVectorIndex` | Tests, small local stores | default |
//! | `RedisVectorIndex` | Redis Stack KNN | `redis` |

use crate::Result;
use crate::models::Table;
use async_trait::async_trait;

/// Trait for external vector indexes.
///
/// # Implementor Notes
///
/// - Methods use `&self` so indexes can be shared via `Arc<dyn VectorIndex>`
/// - `search` returns ids with cosine similarity in `[0, 1]`, best first,
///   ties in insertion order
#[async_trait]
pub trait VectorIndex: Send + Sync + std::fmt::Debug {
    /// Index name for logs and metrics.
    fn name(&self) -> &'static str;

    /// The dimensionality of indexed embeddings.
    fn dimensions(&self) -> usize;

    /// Inserts or replaces the embedding for a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the index rejects the write.
    async fn upsert(&self, collection: Table, id: &str, embedding: &[f32]) -> Result<()>;

    /// Removes a record's embedding. Returns whether it was indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is unreachable.
    async fn remove(&self, collection: Table, id: &str) -> Result<bool>;

    /// Returns up to `limit` ids with similarity scores.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is unreachable.
    async fn search(
        &self,
        collection: Table,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f32)>>;

    /// Number of embeddings indexed for a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is unreachable.
    async fn count(&self, collection: Table) -> Result<usize>;

    /// Removes every embedding for a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is unreachable.
    async fn clear(&self, collection: Table) -> Result<()>;
}
