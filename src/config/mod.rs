//! Store configuration.
//!
//! Configuration is layered, lowest precedence first:
//!
//! 1. defaults ([`StoreConfig::default`], an in-memory store);
//! 2. a TOML file with a `[store]` table;
//! 3. `KSTORE_*` environment variables.
//!
//! Every layer uses the same key names. Environment variables are the key
//! upper-cased with `-` replaced by `_`, prefixed with `KSTORE_`:
//!
//! | Key | Environment | Meaning |
//! |-----|-------------|---------|
//! | `backend` | `KSTORE_BACKEND` | One of [`BackendKind::ALL`] |
//! | `connection-string` | `KSTORE_CONNECTION_STRING` | Database URL or service URL |
//! | `replica-connection-strings` | `KSTORE_REPLICA_CONNECTION_STRINGS` | Comma separated read replicas |
//! | `file-path` | `KSTORE_FILE_PATH` | `SQLite` database file |
//! | `service-key` | `KSTORE_SERVICE_KEY` | Managed service key |
//! | `embedding-dimensions` | `KSTORE_EMBEDDING_DIMENSIONS` | Vector length |
//! | `pool-min-size` | `KSTORE_POOL_MIN_SIZE` | Connections opened eagerly |
//! | `pool-max-size` | `KSTORE_POOL_MAX_SIZE` | Connections checked out at once |
//! | `pool-acquire-timeout` | `KSTORE_POOL_ACQUIRE_TIMEOUT` | Milliseconds |
//! | `pool-max-waiters` | `KSTORE_POOL_MAX_WAITERS` | Callers waiting at once |
//! | `vector-fallback-strategy` | `KSTORE_VECTOR_FALLBACK_STRATEGY` | `external-index` or `keyword-degrade` |
//! | `external-index-url` | `KSTORE_EXTERNAL_INDEX_URL` | Redis URL; unset means in-process |
//! | `retry-max-attempts` | `KSTORE_RETRY_MAX_ATTEMPTS` | Attempts including the first |
//! | `retry-base-delay` | `KSTORE_RETRY_BASE_DELAY` | Milliseconds |
//! | `retry-max-delay` | `KSTORE_RETRY_MAX_DELAY` | Milliseconds |
//!
//! Secrets are held as [`SecretString`] and print as `[REDACTED]`.

use crate::storage::pool::PoolConfig;
use crate::storage::resilience::RetryPolicy;
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "KSTORE_";

/// Embedding length used when none is configured.
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;

/// Every recognized configuration key.
pub const KEYS: [&str; 15] = [
    "backend",
    "connection-string",
    "replica-connection-strings",
    "file-path",
    "service-key",
    "embedding-dimensions",
    "pool-min-size",
    "pool-max-size",
    "pool-acquire-timeout",
    "pool-max-waiters",
    "vector-fallback-strategy",
    "external-index-url",
    "retry-max-attempts",
    "retry-base-delay",
    "retry-max-delay",
];

/// Storage technology behind the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Managed PostgREST service over PostgreSQL with pgvector.
    ManagedService,
    /// PostgreSQL with pgvector.
    StandaloneRelational,
    /// PostgreSQL without a vector extension.
    RelationalNoVector,
    /// Single-file `SQLite` database.
    EmbeddedFile,
    /// In-process store for tests.
    InMemoryFake,
}

impl BackendKind {
    /// Every backend.
    pub const ALL: [Self; 5] = [
        Self::ManagedService,
        Self::StandaloneRelational,
        Self::RelationalNoVector,
        Self::EmbeddedFile,
        Self::InMemoryFake,
    ];

    /// Configuration name, also used as the backend label in errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ManagedService => "managed-service",
            Self::StandaloneRelational => "standalone-relational",
            Self::RelationalNoVector => "relational-no-vector",
            Self::EmbeddedFile => "embedded-file",
            Self::InMemoryFake => "in-memory-fake",
        }
    }

    /// Parses a configuration name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unknown name.
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
                Error::Configuration(format!(
                    "unknown backend '{name}' (expected one of: {})",
                    known.join(", ")
                ))
            })
    }

    /// Backends reached through a connection string.
    #[must_use]
    pub const fn needs_connection_string(self) -> bool {
        matches!(
            self,
            Self::ManagedService | Self::StandaloneRelational | Self::RelationalNoVector
        )
    }

    /// Backends that rank vectors themselves.
    #[must_use]
    pub const fn native_vectors(self) -> bool {
        matches!(
            self,
            Self::ManagedService | Self::StandaloneRelational | Self::InMemoryFake
        )
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// How backends without native vectors serve similarity search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VectorFallbackStrategy {
    /// Rank in an external vector index keyed by record id.
    ExternalIndex,
    /// Match query text against `content`, flagged as degraded.
    #[default]
    KeywordDegrade,
}

impl VectorFallbackStrategy {
    /// Configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExternalIndex => "external-index",
            Self::KeywordDegrade => "keyword-degrade",
        }
    }

    /// Parses a configuration name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unknown name.
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "external-index" => Ok(Self::ExternalIndex),
            "keyword-degrade" => Ok(Self::KeywordDegrade),
            other => Err(Error::Configuration(format!(
                "unknown vector-fallback-strategy '{other}' (expected external-index or keyword-degrade)"
            ))),
        }
    }
}

impl fmt::Display for VectorFallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSettings {
    /// Connections opened eagerly.
    pub min_size: usize,
    /// Connections checked out at once.
    pub max_size: usize,
    /// Longest a caller waits for a connection, in milliseconds.
    pub acquire_timeout_ms: u64,
    /// Callers allowed to wait at once.
    pub max_waiters: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout_ms: 5_000,
            max_waiters: 64,
        }
    }
}

/// Connect and operation retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetrySettings {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on the exponential delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

/// Configuration for one store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Storage technology.
    pub backend: BackendKind,
    /// Primary database URL, or the service URL for `managed-service`.
    pub connection_string: Option<SecretString>,
    /// Read replica URLs.
    pub replica_connection_strings: Vec<SecretString>,
    /// `SQLite` database file.
    pub file_path: Option<PathBuf>,
    /// Managed service key.
    pub service_key: Option<SecretString>,
    /// Embedding length for every vector collection.
    pub embedding_dimensions: usize,
    /// Pool sizing.
    pub pool: PoolSettings,
    /// Retry policy for connects and connectivity failures.
    pub retry: RetrySettings,
    /// Fallback for backends without native vectors.
    pub vector_fallback: VectorFallbackStrategy,
    /// Redis URL for the external index. Unset means an in-process index.
    pub external_index_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::InMemoryFake,
            connection_string: None,
            replica_connection_strings: Vec::new(),
            file_path: None,
            service_key: None,
            embedding_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            pool: PoolSettings::default(),
            retry: RetrySettings::default(),
            vector_fallback: VectorFallbackStrategy::default(),
            external_index_url: None,
        }
    }
}

/// `[store]` table of a configuration file.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StoreSection {
    /// Backend name.
    pub backend: Option<String>,
    /// Primary URL.
    pub connection_string: Option<String>,
    /// Replica URLs.
    pub replica_connection_strings: Option<Vec<String>>,
    /// `SQLite` file.
    pub file_path: Option<PathBuf>,
    /// Service key.
    pub service_key: Option<String>,
    /// Embedding length.
    pub embedding_dimensions: Option<usize>,
    /// Minimum pool size.
    pub pool_min_size: Option<usize>,
    /// Maximum pool size.
    pub pool_max_size: Option<usize>,
    /// Acquire timeout in milliseconds.
    pub pool_acquire_timeout: Option<u64>,
    /// Waiter bound.
    pub pool_max_waiters: Option<usize>,
    /// Fallback strategy name.
    pub vector_fallback_strategy: Option<String>,
    /// External index URL.
    pub external_index_url: Option<String>,
    /// Retry attempts.
    pub retry_max_attempts: Option<u32>,
    /// Retry base delay in milliseconds.
    pub retry_base_delay: Option<u64>,
    /// Retry delay cap in milliseconds.
    pub retry_max_delay: Option<u64>,
}

/// Configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// The store section.
    pub store: Option<StoreSection>,
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid value '{value}' for '{key}': {e}")))
}

fn secret(value: &str) -> Option<SecretString> {
    let value = value.trim();
    (!value.is_empty()).then(|| SecretString::from(value.to_string()))
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl StoreConfig {
    /// An in-memory store.
    #[must_use]
    pub fn in_memory(dimensions: usize) -> Self {
        Self {
            embedding_dimensions: dimensions,
            ..Self::default()
        }
    }

    /// A `SQLite` store at `path`.
    #[must_use]
    pub fn sqlite(path: impl Into<PathBuf>, dimensions: usize) -> Self {
        Self {
            backend: BackendKind::EmbeddedFile,
            file_path: Some(path.into()),
            embedding_dimensions: dimensions,
            ..Self::default()
        }
    }

    /// A PostgreSQL store, with or without pgvector.
    #[must_use]
    pub fn postgres(url: impl Into<String>, dimensions: usize, pgvector: bool) -> Self {
        Self {
            backend: if pgvector {
                BackendKind::StandaloneRelational
            } else {
                BackendKind::RelationalNoVector
            },
            connection_string: Some(SecretString::from(url.into())),
            embedding_dimensions: dimensions,
            ..Self::default()
        }
    }

    /// A managed service store.
    #[must_use]
    pub fn managed(url: impl Into<String>, service_key: impl Into<String>, dimensions: usize) -> Self {
        Self {
            backend: BackendKind::ManagedService,
            connection_string: Some(SecretString::from(url.into())),
            service_key: Some(SecretString::from(service_key.into())),
            embedding_dimensions: dimensions,
            ..Self::default()
        }
    }

    /// Sets the pool settings.
    #[must_use]
    pub const fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the retry settings.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the vector fallback strategy.
    #[must_use]
    pub const fn with_vector_fallback(mut self, strategy: VectorFallbackStrategy) -> Self {
        self.vector_fallback = strategy;
        self
    }

    /// Adds a read replica.
    #[must_use]
    pub fn with_replica(mut self, url: impl Into<String>) -> Self {
        self.replica_connection_strings
            .push(SecretString::from(url.into()));
        self
    }

    /// Builds a configuration from key/value pairs over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for unknown keys, unparsable values,
    /// or a configuration that fails [`validate`](Self::validate).
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Sets one key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unknown key or bad value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "backend" => self.backend = BackendKind::parse(value)?,
            "connection-string" => self.connection_string = secret(value),
            "replica-connection-strings" => {
                self.replica_connection_strings = value.split(',').filter_map(secret).collect();
            },
            "file-path" => self.file_path = non_empty(value).map(PathBuf::from),
            "service-key" => self.service_key = secret(value),
            "embedding-dimensions" => {
                self.embedding_dimensions = parse_number(key, value)?;
            },
            "pool-min-size" => self.pool.min_size = parse_number(key, value)?,
            "pool-max-size" => self.pool.max_size = parse_number(key, value)?,
            "pool-acquire-timeout" => self.pool.acquire_timeout_ms = parse_number(key, value)?,
            "pool-max-waiters" => self.pool.max_waiters = parse_number(key, value)?,
            "vector-fallback-strategy" => {
                self.vector_fallback = VectorFallbackStrategy::parse(value)?;
            },
            "external-index-url" => self.external_index_url = non_empty(value),
            "retry-max-attempts" => self.retry.max_attempts = parse_number(key, value)?,
            "retry-base-delay" => self.retry.base_delay_ms = parse_number(key, value)?,
            "retry-max-delay" => self.retry.max_delay_ms = parse_number(key, value)?,
            other => {
                return Err(Error::Configuration(format!(
                    "unknown configuration key '{other}'"
                )));
            },
        }
        Ok(())
    }

    /// Loads a TOML file over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the file cannot be read or
    /// parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let file: ConfigFile = toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("cannot parse config file {}: {e}", path.display()))
        })?;
        Self::from_config_file(file)
    }

    /// Defaults, then the optional file, then `KSTORE_*` variables, then
    /// validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if any layer is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut config = Self::default();
        let Some(store) = file.store else {
            return Ok(config);
        };

        if let Some(backend) = store.backend {
            config.backend = BackendKind::parse(&backend)?;
        }
        if let Some(url) = store.connection_string {
            config.connection_string = secret(&url);
        }
        if let Some(replicas) = store.replica_connection_strings {
            config.replica_connection_strings =
                replicas.iter().filter_map(|r| secret(r)).collect();
        }
        if let Some(path) = store.file_path {
            config.file_path = Some(path);
        }
        if let Some(key) = store.service_key {
            config.service_key = secret(&key);
        }
        if let Some(dimensions) = store.embedding_dimensions {
            config.embedding_dimensions = dimensions;
        }
        if let Some(v) = store.pool_min_size {
            config.pool.min_size = v;
        }
        if let Some(v) = store.pool_max_size {
            config.pool.max_size = v;
        }
        if let Some(v) = store.pool_acquire_timeout {
            config.pool.acquire_timeout_ms = v;
        }
        if let Some(v) = store.pool_max_waiters {
            config.pool.max_waiters = v;
        }
        if let Some(strategy) = store.vector_fallback_strategy {
            config.vector_fallback = VectorFallbackStrategy::parse(&strategy)?;
        }
        if let Some(url) = store.external_index_url {
            config.external_index_url = non_empty(&url);
        }
        if let Some(v) = store.retry_max_attempts {
            config.retry.max_attempts = v;
        }
        if let Some(v) = store.retry_base_delay {
            config.retry.base_delay_ms = v;
        }
        if let Some(v) = store.retry_max_delay {
            config.retry.max_delay_ms = v;
        }

        Ok(config)
    }

    /// Environment variable for a configuration key.
    #[must_use]
    pub fn env_var(key: &str) -> String {
        format!("{ENV_PREFIX}{}", key.to_ascii_uppercase().replace('-', "_"))
    }

    /// Applies `KSTORE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unparsable value.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides from any variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unparsable value.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in KEYS {
            if let Some(value) = lookup(&Self::env_var(key)) {
                self.set(key, &value)?;
            }
        }
        Ok(self)
    }

    /// Checks the configuration is complete and consistent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(Error::Configuration(message));
        if self.embedding_dimensions == 0 {
            return fail("embedding-dimensions must be at least 1".into());
        }
        if self.pool.max_size == 0 {
            return fail("pool-max-size must be at least 1".into());
        }
        if self.pool.min_size > self.pool.max_size {
            return fail(format!(
                "pool-min-size ({}) exceeds pool-max-size ({})",
                self.pool.min_size, self.pool.max_size
            ));
        }
        if self.retry.max_attempts == 0 {
            return fail("retry-max-attempts must be at least 1".into());
        }
        if self.backend.needs_connection_string() && self.connection_string.is_none() {
            return fail(format!(
                "backend '{}' requires connection-string",
                self.backend
            ));
        }
        if self.backend == BackendKind::ManagedService && self.service_key.is_none() {
            return fail("backend 'managed-service' requires service-key".into());
        }
        if self.backend == BackendKind::EmbeddedFile && self.file_path.is_none() {
            return fail("backend 'embedded-file' requires file-path".into());
        }
        if !self.replica_connection_strings.is_empty()
            && !matches!(
                self.backend,
                BackendKind::StandaloneRelational | BackendKind::RelationalNoVector
            )
        {
            return fail(format!(
                "backend '{}' does not support read replicas",
                self.backend
            ));
        }
        Ok(())
    }

    /// Pool settings as a [`PoolConfig`].
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::from(&self.pool)
    }

    /// Retry settings as a [`RetryPolicy`].
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    /// The primary connection string.
    pub(crate) fn expose_connection_string(&self) -> Result<&str> {
        self.connection_string
            .as_ref()
            .map(ExposeSecret::expose_secret)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "backend '{}' requires connection-string",
                    self.backend
                ))
            })
    }

    /// A redacted summary safe for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        let target = match self.backend {
            BackendKind::EmbeddedFile => self
                .file_path
                .as_ref()
                .map_or_else(|| "<no file>".to_string(), |p| p.display().to_string()),
            BackendKind::InMemoryFake => "memory".to_string(),
            _ => self
                .connection_string
                .as_ref()
                .map_or_else(|| "<unset>".to_string(), |s| redact_url(s.expose_secret())),
        };
        format!(
            "{} ({target}, {} dims, pool {}..{}, {} replicas)",
            self.backend,
            self.embedding_dimensions,
            self.pool.min_size,
            self.pool.max_size,
            self.replica_connection_strings.len()
        )
    }
}

/// Strips user info from a URL.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        },
        _ => url.to_string(),
    }
}
