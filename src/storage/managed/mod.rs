//! Managed PostgREST service backend.
//!
//! Rows travel as JSON over `/rest/v1/<table>`. Similarity search calls the
//! `match_<table>` functions over `/rest/v1/rpc/`, and schema changes go
//! through an `exec_sql` function the operator installs once:
//!
//! ```sql
//! CREATE FUNCTION exec_sql(sql text) RETURNS void
//! LANGUAGE plpgsql SECURITY DEFINER AS $$ BEGIN EXECUTE sql; END $$;
//! REVOKE ALL ON FUNCTION exec_sql(text) FROM anon, authenticated;
//! ```
//!
//! Each request commits on its own, so a multi-write unit of work is not
//! atomic here. Requires the `managed` feature.

#[cfg(feature = "managed")]
mod adapter;
#[cfg(feature = "managed")]
mod rest;

#[cfg(feature = "managed")]
pub use adapter::ManagedAdapter;

use crate::Result;
use crate::storage::pool::PoolConfig;
use crate::storage::traits::StorageAdapter;
use secrecy::SecretString;
use std::sync::Arc;

/// Backend name.
pub const BACKEND: &str = "managed-service";

/// Function that runs migration DDL.
#[cfg_attr(not(feature = "managed"), allow(dead_code))]
pub(crate) const EXEC_SQL_FUNCTION: &str = "exec_sql";

/// Creates a managed-service adapter.
///
/// # Errors
///
/// Returns a configuration error for a malformed URL, an empty key, or a
/// build without the `managed` feature.
#[cfg(feature = "managed")]
pub fn connect(
    url: &str,
    service_key: SecretString,
    dimensions: usize,
    pool: PoolConfig,
) -> Result<Arc<dyn StorageAdapter>> {
    let adapter = ManagedAdapter::new(url, service_key, dimensions, pool)?;
    tracing::info!(backend = BACKEND, "Managed service adapter ready");
    Ok(Arc::new(adapter))
}

/// Creates a managed-service adapter (stub).
///
/// # Errors
///
/// Always returns a configuration error: the crate was built without the
/// `managed` feature.
#[cfg(not(feature = "managed"))]
pub fn connect(
    _url: &str,
    _service_key: SecretString,
    _dimensions: usize,
    _pool: PoolConfig,
) -> Result<Arc<dyn StorageAdapter>> {
    Err(crate::Error::Configuration(format!(
        "backend '{BACKEND}' requires the 'managed' feature"
    )))
}

#[cfg(test)]
mod tests {
    #[cfg(not(feature = "managed"))]
    #[test]
    fn test_stub_reports_missing_feature() {
        let err = super::connect(
            "https://example.test",
            secrecy::SecretString::from("key".to_string()),
            3,
            super::PoolConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
