//! # knowledge-store
//!
//! Backend-agnostic async data access layer for a crawled-knowledge and
//! project-management store.
//!
//! One [`StorageAdapter`] contract is implemented against five storage
//! technologies:
//!
//! - a managed PostgREST-style service over Postgres + pgvector (`managed` feature)
//! - standalone PostgreSQL with pgvector (`postgres` feature)
//! - PostgreSQL without a vector extension (`postgres` feature)
//! - an embedded single-file `SQLite` database
//! - an in-memory fake for tests
//!
//! Application code depends only on the [`Repository`] facade, which owns a
//! [`ConnectionManager`] that lazily builds, pools, retries and resets the
//! configured adapter.
//!
//! ## Example
//!
//! ```rust,ignore
//! use knowledge_store::{Record, Repository, StoreConfig};
//!
//! let repo = Repository::new(StoreConfig::in_memory(4))?;
//! repo.migrate().await?;
//!
//! let source = repo
//!     .sources()
//!     .create(Record::new().with("source_url", "https://docs.rs"))
//!     .await?;
//! let fetched = repo.sources().get(source.id().unwrap_or_default()).await?;
//! assert!(fetched.is_some());
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod config;
pub mod manager;
pub mod models;
pub mod repository;
pub mod storage;

pub use config::{BackendKind, PoolSettings, RetrySettings, StoreConfig, VectorFallbackStrategy};
pub use manager::{ConnectionManager, EndpointHealth};
pub use models::{
    Filter, HybridPolicy, HybridQuery, MigrationRecord, Record, ScoredRecord, SearchMode,
    SearchResults, Table, UnitOfWork, VectorQuery, VectorRecord, WriteOp, WriteOutcome,
};
pub use repository::Repository;
pub use storage::{Capabilities, StorageAdapter};

/// Error type for data access operations.
///
/// A single-row miss is never an error: `get`-style methods return `Ok(None)`
/// and list-style methods return an empty `Vec`.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Validation` | Wrong embedding length, unknown or missing field, bad identifier |
/// | `Connectivity` | Transport failure, refused connection, broken pool connection |
/// | `ConstraintViolation` | Unique key or foreign key breach |
/// | `Configuration` | Unknown backend, missing connection string, feature not compiled |
/// | `PoolExhausted` | Waiter queue full or acquire timeout elapsed |
/// | `Migration` | Checksum mismatch or a failed apply |
/// | `Backend` | Driver failure outside the categories above (malformed row, SQL error) |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Input was structurally invalid for the storage layer.
    #[error("validation failed in '{operation}' on {backend}: field '{field}': {message}")]
    Validation {
        /// The operation that rejected the input.
        operation: String,
        /// The backend name.
        backend: &'static str,
        /// The offending field.
        field: String,
        /// What was wrong with it.
        message: String,
    },

    /// The backend could not be reached, possibly transiently.
    #[error("connectivity failure in '{operation}' on {backend}: {cause}")]
    Connectivity {
        /// The operation that failed.
        operation: String,
        /// The backend name.
        backend: &'static str,
        /// The underlying cause.
        cause: String,
    },

    /// A uniqueness or foreign-key constraint was breached.
    #[error("constraint violation in '{operation}' on {backend} (field: {}): {cause}", .field.as_deref().unwrap_or("unknown"))]
    ConstraintViolation {
        /// The operation that failed.
        operation: String,
        /// The backend name.
        backend: &'static str,
        /// The offending field, when the backend reports it.
        field: Option<String>,
        /// The underlying cause.
        cause: String,
    },

    /// Configuration was invalid. Raised at construction, never deferred.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The connection pool could not hand out a connection in time.
    #[error("connection pool exhausted on {backend} after {waited_ms}ms (max size {max_size})")]
    PoolExhausted {
        /// The backend name.
        backend: &'static str,
        /// Configured maximum pool size.
        max_size: usize,
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    /// A schema migration failed or its checksum no longer matches.
    #[error("migration '{version}' failed: {cause}")]
    Migration {
        /// The migration version.
        version: String,
        /// The underlying cause.
        cause: String,
    },

    /// The backend failed in a way none of the other variants describe.
    #[error("backend failure in '{operation}' on {backend}: {cause}")]
    Backend {
        /// The operation that failed.
        operation: String,
        /// The backend name.
        backend: &'static str,
        /// The underlying cause.
        cause: String,
    },
}

/// Flat error classification for branching without matching on fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Validation`].
    Validation,
    /// See [`Error::Connectivity`].
    Connectivity,
    /// See [`Error::ConstraintViolation`].
    ConstraintViolation,
    /// See [`Error::Configuration`].
    Configuration,
    /// See [`Error::PoolExhausted`].
    PoolExhausted,
    /// See [`Error::Migration`].
    Migration,
    /// See [`Error::Backend`].
    Backend,
}

impl Error {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Connectivity { .. } => ErrorKind::Connectivity,
            Self::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::Migration { .. } => ErrorKind::Migration,
            Self::Backend { .. } => ErrorKind::Backend,
        }
    }

    /// Only connectivity failures are retried by the connection manager.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    /// Returns the offending field for validation and constraint errors.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            Self::ConstraintViolation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    /// Builds a validation error.
    pub fn validation(
        operation: impl Into<String>,
        backend: &'static str,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            operation: operation.into(),
            backend,
            field: field.into(),
            message: message.into(),
        }
    }

    /// Builds a connectivity error.
    pub fn connectivity(
        operation: impl Into<String>,
        backend: &'static str,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self::Connectivity {
            operation: operation.into(),
            backend,
            cause: cause.to_string(),
        }
    }

    /// Builds a backend error.
    pub fn backend(
        operation: impl Into<String>,
        backend: &'static str,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self::Backend {
            operation: operation.into(),
            backend,
            cause: cause.to_string(),
        }
    }

    /// Builds a constraint violation.
    pub fn constraint(
        operation: impl Into<String>,
        backend: &'static str,
        field: Option<String>,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self::ConstraintViolation {
            operation: operation.into(),
            backend,
            field,
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for data access operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::validation("create", "sqlite", "embedding", "expected 4 values, got 3");
        assert_eq!(
            err.to_string(),
            "validation failed in 'create' on sqlite: field 'embedding': expected 4 values, got 3"
        );

        let err = Error::constraint("create", "postgres", None, "duplicate key");
        assert_eq!(
            err.to_string(),
            "constraint violation in 'create' on postgres (field: unknown): duplicate key"
        );

        let err = Error::PoolExhausted {
            backend: "in-memory-fake",
            max_size: 1,
            waited_ms: 50,
        };
        assert_eq!(
            err.to_string(),
            "connection pool exhausted on in-memory-fake after 50ms (max size 1)"
        );
    }

    #[test]
    fn test_only_connectivity_is_retryable() {
        assert!(Error::connectivity("get", "postgres", "reset by peer").is_retryable());
        assert!(!Error::backend("get", "postgres", "syntax error").is_retryable());
        assert!(!Error::Configuration("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_field_accessor() {
        let err = Error::constraint("upsert", "sqlite", Some("key".to_string()), "unique");
        assert_eq!(err.field(), Some("key"));
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(Error::Configuration("x".into()).field(), None);
    }
}
