//! Connection manager: builds, caches, retries and resets adapters.
//!
//! The backend is resolved from [`StoreConfig`] once, in
//! [`ConnectionManager::new`]. Adapters are built on first use and cached
//! until [`reset`](ConnectionManager::reset).
//!
//! # Reads
//!
//! [`get_reader`](ConnectionManager::get_reader) round-robins across read
//! replicas. Each replica has a [`CircuitBreaker`]; a replica whose breaker
//! is open is skipped. With no replica available the primary serves reads.
//!
//! # Retries
//!
//! Connecting retries with the configured [`RetryPolicy`]. So do
//! [`run_read`](ConnectionManager::run_read) and
//! [`run_write`](ConnectionManager::run_write), for connectivity failures
//! only.

use crate::config::{BackendKind, StoreConfig, VectorFallbackStrategy};
use crate::models::Table;
use crate::storage::pool::acquire_lock;
use crate::storage::postgres::{self, VectorSupport};
use crate::storage::resilience::{BreakerConfig, CircuitBreaker, RetryPolicy, retry};
use crate::storage::traits::{StorageAdapter, VectorIndex};
use crate::storage::vector::{FallbackStrategy, InMemoryVectorIndex, RedisVectorIndex, VectorFallback};
use crate::storage::{InMemoryAdapter, SqliteAdapter, managed};
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::OnceCell;

/// Key prefix for Redis external indexes.
const INDEX_PREFIX: &str = "kstore";

type AdapterCell = Arc<OnceCell<Arc<dyn StorageAdapter>>>;

/// A lazily built adapter that can be dropped and rebuilt.
#[derive(Default)]
struct Slot {
    cell: Mutex<AdapterCell>,
}

impl Slot {
    fn current(&self) -> AdapterCell {
        Arc::clone(&acquire_lock(&self.cell))
    }

    /// Swaps in an empty cell. Returns `true` if an adapter was cached.
    fn reset(&self) -> bool {
        let old = std::mem::take(&mut *acquire_lock(&self.cell));
        old.initialized()
    }

    fn is_initialized(&self) -> bool {
        acquire_lock(&self.cell).initialized()
    }
}

struct Replica {
    url: SecretString,
    slot: Slot,
    breaker: Mutex<CircuitBreaker>,
}

/// Health of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    /// `primary` or `replica-<n>`.
    pub role: String,
    /// Whether the round trip succeeded.
    pub healthy: bool,
    /// Round-trip time in milliseconds.
    pub latency_ms: u64,
    /// The failure, if any.
    pub error: Option<String>,
}

/// Owns adapter construction for one store.
pub struct ConnectionManager {
    config: StoreConfig,
    retry: RetryPolicy,
    primary: Slot,
    replicas: Vec<Replica>,
    next_replica: AtomicUsize,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backend", &self.config.backend)
            .field("connected", &self.primary.is_initialized())
            .field("replicas", &self.replicas.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Validates the configuration. Nothing connects until first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid.
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_breaker(config, BreakerConfig::default())
    }

    /// Like [`new`](Self::new) with explicit replica breaker thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid.
    pub fn with_breaker(config: StoreConfig, breaker: BreakerConfig) -> Result<Self> {
        config.validate()?;
        let replicas = config
            .replica_connection_strings
            .iter()
            .enumerate()
            .map(|(i, url)| Replica {
                url: url.clone(),
                slot: Slot::default(),
                breaker: Mutex::new(CircuitBreaker::new(&breaker, format!("replica-{i}"))),
            })
            .collect();
        tracing::info!(config = %config.describe(), "Connection manager configured");
        Ok(Self {
            retry: config.retry_policy(),
            config,
            primary: Slot::default(),
            replicas,
            next_replica: AtomicUsize::new(0),
        })
    }

    /// The configured backend.
    #[must_use]
    pub const fn backend(&self) -> BackendKind {
        self.config.backend
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Configured read replicas.
    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Returns `true` once the primary adapter has been built.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.primary.is_initialized()
    }

    /// The read/write adapter, built on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] once connect retries are exhausted,
    /// or [`Error::Configuration`] if the backend is not compiled in.
    pub async fn get_primary(&self) -> Result<Arc<dyn StorageAdapter>> {
        let cell = self.primary.current();
        let adapter = cell
            .get_or_try_init(|| async {
                let url = self.config.connection_string.clone();
                retry(&self.retry, self.config.backend.as_str(), "connect", || {
                    self.build(url.as_ref())
                })
                .await
            })
            .await?;
        Ok(Arc::clone(adapter))
    }

    /// A read-only adapter: the next healthy replica, else the primary.
    ///
    /// # Errors
    ///
    /// Same as [`get_primary`](Self::get_primary).
    pub async fn get_reader(&self) -> Result<Arc<dyn StorageAdapter>> {
        match self.next_healthy_replica().await {
            Some((_, adapter)) => Ok(adapter),
            None => self.get_primary().await,
        }
    }

    async fn next_healthy_replica(&self) -> Option<(usize, Arc<dyn StorageAdapter>)> {
        let count = self.replicas.len();
        if count == 0 {
            return None;
        }
        let start = self.next_replica.fetch_add(1, Ordering::Relaxed);
        for offset in 0..count {
            let index = (start + offset) % count;
            let replica = &self.replicas[index];
            if !acquire_lock(&replica.breaker).allow() {
                continue;
            }
            let cell = replica.slot.current();
            match cell.get_or_try_init(|| self.build(Some(&replica.url))).await {
                Ok(adapter) => return Some((index, Arc::clone(adapter))),
                Err(e) => {
                    tracing::warn!(replica = index, error = %e, "Replica connect failed");
                    acquire_lock(&replica.breaker).on_failure();
                },
            }
        }
        tracing::warn!(
            backend = self.config.backend.as_str(),
            "No healthy replica, reading from primary"
        );
        None
    }

    fn record_replica(&self, index: usize, ok: bool) {
        let mut breaker = acquire_lock(&self.replicas[index].breaker);
        if ok {
            breaker.on_success();
        } else {
            breaker.on_failure();
        }
    }

    /// Runs a read on a replica or the primary, retrying connectivity
    /// failures. A replica that fails with a connectivity error is marked
    /// and the read is retried on the primary straight away.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or [`Error::Connectivity`] once
    /// retries are exhausted.
    pub async fn run_read<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn StorageAdapter>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let f = &f;
        retry(&self.retry, self.config.backend.as_str(), operation, move || async move {
            let Some((index, replica)) = self.next_healthy_replica().await else {
                return f(self.get_primary().await?).await;
            };
            match f(replica).await {
                Ok(value) => {
                    self.record_replica(index, true);
                    Ok(value)
                },
                Err(e) if e.is_retryable() => {
                    tracing::warn!(replica = index, operation, error = %e, "Replica read failed, using primary");
                    self.record_replica(index, false);
                    f(self.get_primary().await?).await
                },
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Runs a write on the primary, retrying connectivity failures.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or [`Error::Connectivity`] once
    /// retries are exhausted.
    pub async fn run_write<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn StorageAdapter>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let f = &f;
        retry(&self.retry, self.config.backend.as_str(), operation, move || async move {
            f(self.get_primary().await?).await
        })
        .await
    }

    /// Drops every cached adapter. The next call rebuilds them.
    pub fn reset(&self) {
        let mut dropped = usize::from(self.primary.reset());
        for replica in &self.replicas {
            dropped += usize::from(replica.slot.reset());
        }
        tracing::info!(
            backend = self.config.backend.as_str(),
            dropped,
            "Connection manager reset"
        );
    }

    /// Health checks the primary and every replica.
    pub async fn health(&self) -> Vec<EndpointHealth> {
        let mut report = Vec::with_capacity(self.replicas.len() + 1);
        let start = Instant::now();
        let primary = match self.get_primary().await {
            Ok(adapter) => adapter.health_check().await,
            Err(e) => Err(e),
        };
        report.push(EndpointHealth::new("primary".to_string(), start, primary));
        for (index, replica) in self.replicas.iter().enumerate() {
            let start = Instant::now();
            let cell = replica.slot.current();
            let result = match cell.get_or_try_init(|| self.build(Some(&replica.url))).await {
                Ok(adapter) => adapter.health_check().await,
                Err(e) => Err(e),
            };
            self.record_replica(index, result.is_ok());
            report.push(EndpointHealth::new(format!("replica-{index}"), start, result));
        }
        report
    }

    /// Builds one adapter for `url`, wrapped in a vector fallback when the
    /// backend cannot rank vectors.
    async fn build(&self, url: Option<&SecretString>) -> Result<Arc<dyn StorageAdapter>> {
        let config = &self.config;
        let kind = config.backend;
        let dimensions = config.embedding_dimensions;
        let pool = config.pool_config();
        let connection = || {
            url.map(|s| s.expose_secret()).ok_or_else(|| {
                Error::Configuration(format!("backend '{kind}' requires connection-string"))
            })
        };

        let adapter: Arc<dyn StorageAdapter> = match kind {
            BackendKind::InMemoryFake => Arc::new(InMemoryAdapter::with_pool(dimensions, pool)),
            BackendKind::EmbeddedFile => {
                let path = config.file_path.clone().ok_or_else(|| {
                    Error::Configuration("backend 'embedded-file' requires file-path".into())
                })?;
                let sqlite = SqliteAdapter::open(path, dimensions, pool)?;
                if let Err(e) = sqlite.warm_up().await {
                    tracing::warn!(error = %e, "Could not pre-open SQLite connections");
                }
                Arc::new(sqlite)
            },
            BackendKind::StandaloneRelational => {
                postgres::connect(connection()?, dimensions, pool, VectorSupport::Native).await?
            },
            BackendKind::RelationalNoVector => {
                postgres::connect(connection()?, dimensions, pool, VectorSupport::Fallback).await?
            },
            BackendKind::ManagedService => {
                let key = config.service_key.clone().ok_or_else(|| {
                    Error::Configuration("backend 'managed-service' requires service-key".into())
                })?;
                managed::connect(connection()?, key, dimensions, pool)?
            },
        };

        if kind.native_vectors() {
            return Ok(adapter);
        }
        self.with_fallback(adapter).await
    }

    async fn with_fallback(&self, adapter: Arc<dyn StorageAdapter>) -> Result<Arc<dyn StorageAdapter>> {
        let dimensions = self.config.embedding_dimensions;
        let (strategy, in_process) = match self.config.vector_fallback {
            VectorFallbackStrategy::KeywordDegrade => (FallbackStrategy::KeywordDegrade, false),
            VectorFallbackStrategy::ExternalIndex => match &self.config.external_index_url {
                Some(url) => {
                    let index: Arc<dyn VectorIndex> =
                        Arc::new(RedisVectorIndex::new(url.clone(), INDEX_PREFIX, dimensions)?);
                    (FallbackStrategy::ExternalIndex(index), false)
                },
                None => {
                    let index: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new(dimensions));
                    (FallbackStrategy::ExternalIndex(index), true)
                },
            },
        };
        let fallback = VectorFallback::new(adapter, strategy)?;
        if in_process {
            // A fresh in-process index starts empty; fill it from stored rows.
            for table in Table::VECTOR_COLLECTIONS {
                match fallback.rebuild_vector_index(table).await {
                    Ok(indexed) => tracing::debug!(table = %table, indexed, "Rebuilt in-process index"),
                    Err(e) => tracing::debug!(table = %table, error = %e, "Index rebuild skipped"),
                }
            }
        }
        Ok(Arc::new(fallback))
    }
}

impl EndpointHealth {
    fn new(role: String, start: Instant, result: Result<()>) -> Self {
        Self {
            role,
            healthy: result.is_ok(),
            latency_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;
    use crate::models::{Record, VectorQuery};
    use crate::ErrorKind;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = ConnectionManager::new(StoreConfig::in_memory(3).with_replica("postgres://r/kb"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_primary_is_cached_until_reset() {
        let manager = ConnectionManager::new(StoreConfig::in_memory(3)).unwrap();
        assert!(!manager.is_connected());
        let first = manager.get_primary().await.unwrap();
        let again = manager.get_primary().await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        manager.reset();
        assert!(!manager.is_connected());
        let rebuilt = manager.get_primary().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    }

    #[tokio::test]
    async fn test_reader_falls_back_to_primary_without_replicas() {
        let manager = ConnectionManager::new(StoreConfig::in_memory(3)).unwrap();
        let reader = manager.get_reader().await.unwrap();
        let primary = manager.get_primary().await.unwrap();
        assert!(Arc::ptr_eq(&reader, &primary));
    }

    #[tokio::test]
    async fn test_sqlite_is_wrapped_in_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ConnectionManager::new(StoreConfig::sqlite(dir.path().join("kb.db"), 3)).unwrap();
        let adapter = manager.get_primary().await.unwrap();
        assert_eq!(adapter.backend(), "embedded-file");
        assert!(!adapter.capabilities().native_vectors);
        let err = adapter
            .search_by_vector(VectorQuery::new(Table::DocumentChunks, vec![1.0, 0.0, 0.0], 3))
            .await
            .unwrap_err();
        assert_eq!(err.field(), Some("query_text"));
    }

    #[tokio::test]
    async fn test_run_write_retries_connectivity() {
        let config = StoreConfig::in_memory(3).with_retry(RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        });
        let manager = ConnectionManager::new(config).unwrap();
        let calls = AtomicU32::new(0);
        let value = manager
            .run_write("create", |adapter| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        return Err(Error::connectivity("create", "in-memory-fake", "reset"));
                    }
                    adapter.create(Table::Projects, Record::new().with("title", "p")).await
                }
            })
            .await
            .unwrap();
        assert_eq!(value.get_str("title"), Some("p"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_read_does_not_retry_validation() {
        let manager = ConnectionManager::new(StoreConfig::in_memory(3)).unwrap();
        let calls = AtomicU32::new(0);
        let err = manager
            .run_read("get", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::validation("get", "in-memory-fake", "id", "bad")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_reports_primary() {
        let manager = ConnectionManager::new(StoreConfig::in_memory(3)).unwrap();
        let report = manager.health().await;
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].role, "primary");
        assert!(report[0].healthy);
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_missing_feature_is_not_retried() {
        let manager =
            ConnectionManager::new(StoreConfig::postgres("postgres://db/kb", 3, true)).unwrap();
        let err = manager.get_primary().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
