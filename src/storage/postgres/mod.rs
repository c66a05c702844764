//! PostgreSQL backends.
//!
//! One adapter serves two backends:
//!
//! | Backend | Embeddings | Similarity search |
//! |---------|------------|-------------------|
//! | `standalone-relational` | `vector(N)` | pgvector `<=>`, HNSW index |
//! | `relational-no-vector` | `JSONB` array | none, wrap in a fallback |
//!
//! Requires the `postgres` feature. Without it, [`connect`] returns a
//! configuration error.

#[cfg(feature = "postgres")]
mod adapter;
#[cfg(feature = "postgres")]
mod row;

#[cfg(feature = "postgres")]
pub use adapter::PostgresAdapter;

use crate::storage::pool::PoolConfig;
use crate::storage::traits::StorageAdapter;
use crate::Result;
use std::sync::Arc;

/// Backend name with pgvector.
pub const NATIVE_BACKEND: &str = "standalone-relational";
/// Backend name without a vector extension.
pub const PLAIN_BACKEND: &str = "relational-no-vector";

/// How embeddings are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorSupport {
    /// pgvector columns, indexes and match functions.
    Native,
    /// JSONB arrays, searched through a fallback.
    Fallback,
}

impl VectorSupport {
    /// Backend name for this mode.
    #[must_use]
    pub const fn backend(self) -> &'static str {
        match self {
            Self::Native => NATIVE_BACKEND,
            Self::Fallback => PLAIN_BACKEND,
        }
    }
}

/// Connects a PostgreSQL adapter.
///
/// # Errors
///
/// Returns a configuration error for a bad connection string, a missing
/// vector extension, or a build without the `postgres` feature.
#[cfg(feature = "postgres")]
pub async fn connect(
    url: &str,
    dimensions: usize,
    pool: PoolConfig,
    vectors: VectorSupport,
) -> Result<Arc<dyn StorageAdapter>> {
    let adapter = PostgresAdapter::connect(url, dimensions, pool, vectors).await?;
    Ok(Arc::new(adapter))
}

/// Connects a PostgreSQL adapter (stub).
///
/// # Errors
///
/// Always returns a configuration error: the crate was built without the
/// `postgres` feature.
#[cfg(not(feature = "postgres"))]
pub async fn connect(
    _url: &str,
    _dimensions: usize,
    _pool: PoolConfig,
    vectors: VectorSupport,
) -> Result<Arc<dyn StorageAdapter>> {
    Err(crate::Error::Configuration(format!(
        "backend '{}' requires the 'postgres' feature",
        vectors.backend()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names() {
        assert_eq!(VectorSupport::Native.backend(), "standalone-relational");
        assert_eq!(VectorSupport::Fallback.backend(), "relational-no-vector");
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_stub_reports_missing_feature() {
        let err = connect("postgres://localhost/db", 3, PoolConfig::default(), VectorSupport::Native)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
