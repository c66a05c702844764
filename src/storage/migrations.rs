//! Schema migrations and the ledger-backed tracker.
//!
//! Migrations are declared as backend-neutral [`SchemaChange`] lists. Each
//! adapter renders them in its own dialect and applies one migration per
//! transaction, writing the ledger row inside the same transaction where the
//! backend allows it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use knowledge_store::storage::migrations::MigrationTracker;
//!
//! let tracker = MigrationTracker::builtin(384)?;
//! tracker.run(adapter.as_ref()).await?;
//! ```
//!
//! # Lifecycle
//!
//! | State | Next | Trigger |
//! |-------|------|---------|
//! | `Pending` | `Applying` | `run()` reaches the version |
//! | `Applying` | `Applied` | Ledger row committed |
//! | `Applying` | `Failed` | Any error. No ledger row is written |
//! | `Failed` | `Pending` | `acknowledge_failure()` |
//!
//! A failure is also recorded in the backend's failure table, so a fresh
//! process refuses to migrate until it has been acknowledged.

use crate::models::{
    ApplyOutcome, MigrationFailure, MigrationRecord, MigrationState, MigrationStatus, Table,
};
use crate::storage::StorageAdapter;
use crate::storage::pool::acquire_lock;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// One backend-neutral schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "spec", rename_all = "snake_case")]
pub enum SchemaChange {
    /// Enables the vector extension where the backend has one.
    EnableVectorExtension,
    /// Creates a table from its static schema.
    CreateTable(Table),
    /// Creates a secondary index.
    CreateIndex {
        /// Indexed table.
        table: Table,
        /// Indexed columns, in order.
        columns: Vec<String>,
    },
    /// Creates an approximate nearest-neighbour index on `embedding`.
    CreateVectorIndex(Table),
    /// Creates the `match_<table>` similarity function.
    CreateMatchFunction(Table),
    /// Dialect-specific SQL. An empty string skips the dialect.
    RawSql {
        /// SQL for the embedded backend.
        sqlite: String,
        /// SQL for PostgreSQL backends.
        postgres: String,
    },
}

impl SchemaChange {
    fn fingerprint(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self).map_err(|e| Error::Migration {
            version: String::new(),
            cause: format!("cannot serialize schema change: {e}"),
        })?;
        if let (Self::CreateTable(table), Value::Object(map)) = (self, &mut value) {
            let schema = serde_json::to_value(table.schema()).map_err(|e| Error::Migration {
                version: String::new(),
                cause: format!("cannot serialize table schema: {e}"),
            })?;
            map.insert("schema".to_string(), schema);
        }
        Ok(value)
    }
}

/// A versioned list of schema changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Version. Versions sort lexicographically and are applied in order.
    pub version: String,
    /// Human-readable description.
    pub description: String,
    /// Changes applied in order.
    pub changes: Vec<SchemaChange>,
}

impl Migration {
    /// Creates a migration.
    pub fn new(
        version: impl Into<String>,
        description: impl Into<String>,
        changes: Vec<SchemaChange>,
    ) -> Self {
        Self {
            version: version.into(),
            description: description.into(),
            changes,
        }
    }

    /// Hex SHA-256 of the canonical JSON definition.
    ///
    /// `CreateTable` entries include the full table schema, so editing a
    /// column definition changes the checksum.
    pub fn checksum(&self, dimensions: usize) -> Result<String> {
        let changes = self
            .changes
            .iter()
            .map(SchemaChange::fingerprint)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| match e {
                Error::Migration { cause, .. } => Error::Migration {
                    version: self.version.clone(),
                    cause,
                },
                other => other,
            })?;
        let canonical = json!({
            "version": self.version,
            "description": self.description,
            "changes": changes,
            "dimensions": dimensions,
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        Ok(hex::encode(digest))
    }

    /// Builds the ledger row written when this migration is applied.
    pub fn ledger_record(&self, checksum: &str) -> MigrationRecord {
        MigrationRecord {
            version: self.version.clone(),
            description: self.description.clone(),
            checksum: checksum.to_string(),
            applied_at: chrono::Utc::now(),
        }
    }
}

fn create_with_indexes(table: Table) -> Vec<SchemaChange> {
    let schema = table.schema();
    let mut changes = vec![SchemaChange::CreateTable(table)];
    changes.extend(schema.indexes.iter().map(|columns| SchemaChange::CreateIndex {
        table,
        columns: columns.iter().map(ToString::to_string).collect(),
    }));
    changes
}

/// The migrations that create the full schema.
#[must_use]
pub fn builtin_migrations() -> Vec<Migration> {
    let knowledge = [
        Table::Sources,
        Table::Pages,
        Table::CrawledPages,
        Table::DocumentChunks,
        Table::CodeExamples,
    ];
    let projects = [
        Table::Projects,
        Table::Tasks,
        Table::DocumentVersions,
        Table::ProjectSources,
    ];
    let vector_search = Table::VECTOR_COLLECTIONS
        .into_iter()
        .flat_map(|t| [SchemaChange::CreateVectorIndex(t), SchemaChange::CreateMatchFunction(t)])
        .collect();

    vec![
        Migration::new(
            "0001",
            "Enable vector extension",
            vec![SchemaChange::EnableVectorExtension],
        ),
        Migration::new(
            "0002",
            "Knowledge base tables",
            knowledge.into_iter().flat_map(create_with_indexes).collect(),
        ),
        Migration::new("0003", "Settings", create_with_indexes(Table::Settings)),
        Migration::new(
            "0004",
            "Projects, tasks and versions",
            projects.into_iter().flat_map(create_with_indexes).collect(),
        ),
        Migration::new("0005", "Vector search indexes", vector_search),
    ]
}

/// Applies migrations through a [`StorageAdapter`] and tracks their state.
#[derive(Debug)]
pub struct MigrationTracker {
    migrations: Vec<Migration>,
    dimensions: usize,
    states: Mutex<HashMap<String, MigrationState>>,
}

impl MigrationTracker {
    /// Creates a tracker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if versions are not strictly
    /// increasing.
    pub fn new(migrations: Vec<Migration>, dimensions: usize) -> Result<Self> {
        for pair in migrations.windows(2) {
            if pair[0].version >= pair[1].version {
                return Err(Error::Configuration(format!(
                    "migration versions must be unique and sorted: '{}' then '{}'",
                    pair[0].version, pair[1].version
                )));
            }
        }
        let states = migrations
            .iter()
            .map(|m| (m.version.clone(), MigrationState::Pending))
            .collect();
        Ok(Self {
            migrations,
            dimensions,
            states: Mutex::new(states),
        })
    }

    /// Tracker over [`builtin_migrations`].
    ///
    /// # Errors
    ///
    /// Never fails in practice; the built-in versions are sorted.
    pub fn builtin(dimensions: usize) -> Result<Self> {
        Self::new(builtin_migrations(), dimensions)
    }

    /// Known migrations, in order.
    #[must_use]
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Current state of a version, if it is known.
    #[must_use]
    pub fn state(&self, version: &str) -> Option<MigrationState> {
        acquire_lock(&self.states).get(version).cloned()
    }

    fn set_state(&self, version: &str, state: MigrationState) {
        acquire_lock(&self.states).insert(version.to_string(), state);
    }

    fn first_failure(&self) -> Option<(String, String)> {
        let states = acquire_lock(&self.states);
        self.migrations.iter().find_map(|m| match states.get(&m.version) {
            Some(MigrationState::Failed(cause)) => Some((m.version.clone(), cause.clone())),
            _ => None,
        })
    }

    /// Clears a `Failed` state, in this process and in the backend's
    /// failure table, so the next `run` retries the version.
    ///
    /// Returns `false` if the version was not in the failed state.
    ///
    /// # Errors
    ///
    /// Returns an error if the failure table cannot be updated.
    pub async fn acknowledge_failure(
        &self,
        adapter: &dyn StorageAdapter,
        version: &str,
    ) -> Result<bool> {
        let durable = adapter.clear_migration_failure(version).await?;
        let local = {
            let mut states = acquire_lock(&self.states);
            match states.get_mut(version) {
                Some(state @ MigrationState::Failed(_)) => {
                    *state = MigrationState::Pending;
                    true
                },
                _ => false,
            }
        };
        if durable || local {
            tracing::info!(version, backend = adapter.backend(), "Migration failure acknowledged");
        }
        Ok(durable || local)
    }

    /// First failure recorded by the backend, adopted into local state.
    async fn recorded_failure(&self, adapter: &dyn StorageAdapter) -> Result<Option<MigrationFailure>> {
        let failure = adapter.migration_failures().await?.into_iter().next();
        if let Some(failure) = &failure {
            self.set_state(&failure.version, MigrationState::Failed(failure.cause.clone()));
        }
        Ok(failure)
    }

    /// Compares ledger checksums with the known definitions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Migration`] if an applied version's checksum no
    /// longer matches. Unknown ledger versions are logged and ignored.
    pub async fn verify(&self, adapter: &dyn StorageAdapter) -> Result<Vec<MigrationRecord>> {
        adapter.ensure_ledger().await?;
        let applied = adapter.applied_migrations().await?;
        for record in &applied {
            let Some(migration) = self.migrations.iter().find(|m| m.version == record.version)
            else {
                tracing::warn!(
                    version = %record.version,
                    backend = adapter.backend(),
                    "Ledger contains an unknown migration version"
                );
                continue;
            };
            let expected = migration.checksum(self.dimensions)?;
            if expected != record.checksum {
                tracing::error!(
                    version = %record.version,
                    expected = %expected,
                    found = %record.checksum,
                    "Applied migration was modified"
                );
                return Err(Error::Migration {
                    version: record.version.clone(),
                    cause: format!(
                        "checksum mismatch: ledger has {}, definition hashes to {expected}",
                        record.checksum
                    ),
                });
            }
            self.set_state(&record.version, MigrationState::Applied);
        }
        Ok(applied)
    }

    /// Applies every pending migration in order.
    ///
    /// Returns the ledger rows written by this call. Already-applied
    /// versions are skipped without running anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Migration`] if an earlier failure has not been
    /// acknowledged, if verification fails, or if a migration fails. A
    /// failed migration halts the run.
    pub async fn run(&self, adapter: &dyn StorageAdapter) -> Result<Vec<MigrationRecord>> {
        if let Some((version, cause)) = self.first_failure() {
            return Err(Error::Migration {
                version,
                cause: format!("previous failure requires acknowledgement: {cause}"),
            });
        }

        let applied = self.verify(adapter).await?;
        if let Some(failure) = self.recorded_failure(adapter).await? {
            return Err(Error::Migration {
                version: failure.version,
                cause: format!(
                    "previous failure requires acknowledgement: {} (recorded {})",
                    failure.cause, failure.failed_at
                ),
            });
        }
        let mut written = Vec::new();
        for migration in &self.migrations {
            if applied.iter().any(|r| r.version == migration.version) {
                continue;
            }
            let checksum = migration.checksum(self.dimensions)?;
            self.set_state(&migration.version, MigrationState::Applying);
            tracing::info!(
                version = %migration.version,
                description = %migration.description,
                backend = adapter.backend(),
                "Applying migration"
            );

            match adapter.apply_migration(migration, &checksum).await {
                Ok(ApplyOutcome::Applied(record)) => {
                    self.set_state(&migration.version, MigrationState::Applied);
                    metrics::counter!(
                        "storage_migrations_applied_total",
                        "backend" => adapter.backend()
                    )
                    .increment(1);
                    written.push(record);
                },
                Ok(ApplyOutcome::AlreadyApplied) => {
                    tracing::debug!(version = %migration.version, "Migration applied concurrently");
                    self.set_state(&migration.version, MigrationState::Applied);
                },
                Err(e) => {
                    tracing::error!(
                        version = %migration.version,
                        backend = adapter.backend(),
                        error = %e,
                        "Migration failed"
                    );
                    self.set_state(&migration.version, MigrationState::Failed(e.to_string()));
                    let failure = MigrationFailure::now(&migration.version, e.to_string());
                    if let Err(record_err) = adapter.record_migration_failure(&failure).await {
                        tracing::warn!(
                            version = %migration.version,
                            error = %record_err,
                            "Could not record migration failure"
                        );
                    }
                    return Err(match e {
                        Error::Migration { .. } => e,
                        other => Error::Migration {
                            version: migration.version.clone(),
                            cause: other.to_string(),
                        },
                    });
                },
            }
        }
        Ok(written)
    }

    /// Status of every known migration.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub async fn status(&self, adapter: &dyn StorageAdapter) -> Result<Vec<MigrationStatus>> {
        adapter.ensure_ledger().await?;
        let applied = adapter.applied_migrations().await?;
        let failures = adapter.migration_failures().await?;
        let states = acquire_lock(&self.states);
        Ok(self
            .migrations
            .iter()
            .map(|m| {
                let record = applied.iter().find(|r| r.version == m.version);
                let failure = failures.iter().find(|f| f.version == m.version);
                let state = match (record, failure, states.get(&m.version)) {
                    (Some(_), _, _) => MigrationState::Applied,
                    (None, Some(f), _) => MigrationState::Failed(f.cause.clone()),
                    (None, None, Some(state)) if *state != MigrationState::Applied => state.clone(),
                    (None, None, _) => MigrationState::Pending,
                };
                MigrationStatus {
                    version: m.version.clone(),
                    description: m.description.clone(),
                    state,
                    applied_at: record.map(|r| r.applied_at),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::storage::memory::InMemoryAdapter;

    #[test]
    fn test_checksum_is_stable_and_sensitive() {
        let migration = Migration::new("0001", "x", vec![SchemaChange::CreateTable(Table::Settings)]);
        let a = migration.checksum(384).unwrap();
        assert_eq!(a, migration.checksum(384).unwrap());
        assert_eq!(a.len(), 64);
        assert_ne!(a, migration.checksum(768).unwrap());

        let mut edited = migration.clone();
        edited.description = "y".to_string();
        assert_ne!(a, edited.checksum(384).unwrap());
    }

    #[test]
    fn test_builtin_creates_every_table() {
        let created: Vec<Table> = builtin_migrations()
            .iter()
            .flat_map(|m| m.changes.iter())
            .filter_map(|c| match c {
                SchemaChange::CreateTable(t) => Some(*t),
                _ => None,
            })
            .collect();
        for table in Table::ALL {
            assert!(created.contains(&table), "{table} missing");
        }
    }

    #[test]
    fn test_versions_must_be_sorted() {
        let migrations = vec![Migration::new("0002", "b", vec![]), Migration::new("0001", "a", vec![])];
        let err = MigrationTracker::new(migrations, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_run_applies_once() {
        let adapter = InMemoryAdapter::new(3);
        let tracker = MigrationTracker::builtin(3).unwrap();
        let first = tracker.run(&adapter).await.unwrap();
        assert_eq!(first.len(), builtin_migrations().len());
        let second = tracker.run(&adapter).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(adapter.applied_migrations().await.unwrap().len(), first.len());
    }

    #[tokio::test]
    async fn test_failure_blocks_until_acknowledged() {
        let adapter = InMemoryAdapter::new(3);
        let broken = Migration::new(
            "0002",
            "bad index",
            vec![SchemaChange::CreateIndex {
                table: Table::Settings,
                columns: vec!["missing".to_string()],
            }],
        );
        let tracker = MigrationTracker::new(
            vec![Migration::new("0001", "settings", vec![SchemaChange::CreateTable(Table::Settings)]), broken],
            3,
        )
        .unwrap();

        let err = tracker.run(&adapter).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Migration);
        assert!(matches!(tracker.state("0002"), Some(MigrationState::Failed(_))));
        assert_eq!(adapter.applied_migrations().await.unwrap().len(), 1);

        let blocked = tracker.run(&adapter).await.unwrap_err();
        assert!(blocked.to_string().contains("acknowledgement"));

        assert!(tracker.acknowledge_failure(&adapter, "0002").await.unwrap());
        assert!(!tracker.acknowledge_failure(&adapter, "0002").await.unwrap());
        assert_eq!(tracker.state("0002"), Some(MigrationState::Pending));
    }

    #[tokio::test]
    async fn test_recorded_failure_blocks_a_new_tracker() {
        let adapter = InMemoryAdapter::new(3);
        let migrations = || {
            vec![
                Migration::new("0001", "settings", vec![SchemaChange::CreateTable(Table::Settings)]),
                Migration::new(
                    "0002",
                    "bad index",
                    vec![SchemaChange::CreateIndex {
                        table: Table::Settings,
                        columns: vec!["missing".to_string()],
                    }],
                ),
            ]
        };
        let first = MigrationTracker::new(migrations(), 3).unwrap();
        first.run(&adapter).await.unwrap_err();
        let recorded = adapter.migration_failures().await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].version, "0002");

        let restarted = MigrationTracker::new(migrations(), 3).unwrap();
        let status = restarted.status(&adapter).await.unwrap();
        assert!(matches!(status[1].state, MigrationState::Failed(_)));
        let blocked = restarted.run(&adapter).await.unwrap_err();
        assert!(blocked.to_string().contains("acknowledgement"));
        assert!(matches!(restarted.state("0002"), Some(MigrationState::Failed(_))));

        assert!(restarted.acknowledge_failure(&adapter, "0002").await.unwrap());
        assert!(adapter.migration_failures().await.unwrap().is_empty());
        assert_eq!(restarted.state("0002"), Some(MigrationState::Pending));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_fatal() {
        let adapter = InMemoryAdapter::new(3);
        let original = vec![Migration::new("0001", "settings", vec![SchemaChange::CreateTable(Table::Settings)])];
        MigrationTracker::new(original, 3).unwrap().run(&adapter).await.unwrap();

        let edited = vec![Migration::new("0001", "settings v2", vec![SchemaChange::CreateTable(Table::Settings)])];
        let err = MigrationTracker::new(edited, 3).unwrap().verify(&adapter).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Migration);
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_status_reports_pending_and_applied() {
        let adapter = InMemoryAdapter::new(3);
        let tracker = MigrationTracker::new(
            vec![Migration::new("0001", "settings", vec![SchemaChange::CreateTable(Table::Settings)])],
            3,
        )
        .unwrap();
        let before = tracker.status(&adapter).await.unwrap();
        assert_eq!(before[0].state, MigrationState::Pending);
        tracker.run(&adapter).await.unwrap();
        let after = tracker.status(&adapter).await.unwrap();
        assert_eq!(after[0].state, MigrationState::Applied);
        assert!(after[0].applied_at.is_some());
    }
}
