//! Migration tracker scenarios against a file-backed SQLite store.
//!
//! Covers exactly-once application across processes, checksum drift
//! detection and the operator acknowledgement path for failed migrations.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use knowledge_store::models::{MigrationState, Table};
use knowledge_store::storage::migrations::builtin_migrations;
use knowledge_store::storage::{Migration, MigrationTracker, PoolConfig, SchemaChange, SqliteAdapter, StorageAdapter};
use knowledge_store::{ErrorKind, Repository, StoreConfig};
use std::path::Path;

/// Built-in migrations plus one that inserts a row, so a second apply
/// would be visible.
fn with_seed() -> Vec<Migration> {
    let mut migrations = builtin_migrations();
    migrations.push(Migration::new(
        "0100",
        "Seed default theme",
        vec![SchemaChange::RawSql {
            sqlite: "INSERT INTO settings (id, key, value, is_encrypted, category, created_at, updated_at) \
                     VALUES ('seed-theme', 'theme', 'light', 0, 'ui', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z')"
                .into(),
            postgres: String::new(),
        }],
    ));
    migrations
}

fn open(path: &Path) -> SqliteAdapter {
    SqliteAdapter::open(path, 3, PoolConfig::default()).unwrap()
}

#[tokio::test]
async fn test_migration_runs_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");

    let adapter = open(&path);
    let tracker = MigrationTracker::new(with_seed(), 3).unwrap();
    let first = tracker.run(&adapter).await.unwrap();
    assert_eq!(first.len(), 6);
    assert!(tracker.run(&adapter).await.unwrap().is_empty());
    drop(adapter);

    // A fresh process sees the ledger and applies nothing.
    let reopened = open(&path);
    let tracker = MigrationTracker::new(with_seed(), 3).unwrap();
    assert!(tracker.run(&reopened).await.unwrap().is_empty());

    let ledger = reopened.applied_migrations().await.unwrap();
    let versions: Vec<_> = ledger.iter().map(|r| r.version.as_str()).collect();
    assert_eq!(versions, vec!["0001", "0002", "0003", "0004", "0005", "0100"]);
    let seeded = reopened
        .count(knowledge_store::storage::Query::table(Table::Settings))
        .await
        .unwrap();
    assert_eq!(seeded, 1);
}

#[tokio::test]
async fn test_changed_dimensions_fail_verification() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drift.db");
    let adapter = open(&path);
    MigrationTracker::builtin(3).unwrap().run(&adapter).await.unwrap();

    let drifted = MigrationTracker::builtin(768).unwrap();
    let err = drifted.verify(&adapter).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Migration);
    let err = drifted.run(&adapter).await.unwrap_err();
    assert!(err.to_string().contains("checksum mismatch"));
}

#[tokio::test]
async fn test_failed_migration_needs_acknowledgement() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("failed.db");
    let mut migrations = builtin_migrations();
    migrations.push(Migration::new(
        "0100",
        "Broken",
        vec![SchemaChange::RawSql {
            sqlite: "ALTER TABLE no_such_table ADD COLUMN x INTEGER".into(),
            postgres: String::new(),
        }],
    ));
    let repo = Repository::with_migrations(StoreConfig::sqlite(&path, 3), migrations).unwrap();

    let err = repo.migrate().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Migration);

    let status = repo.migration_status().await.unwrap();
    let broken = status.iter().find(|s| s.version == "0100").unwrap();
    assert!(matches!(broken.state, MigrationState::Failed(_)));
    assert!(status
        .iter()
        .filter(|s| s.version != "0100")
        .all(|s| s.state == MigrationState::Applied && s.applied_at.is_some()));

    // Blocked until an operator acknowledges the failure.
    let err = repo.migrate().await.unwrap_err();
    assert!(err.to_string().contains("acknowledgement"));
    assert!(repo.acknowledge_failure("0100").await.unwrap());
    assert!(!repo.acknowledge_failure("0100").await.unwrap());
    let status = repo.migration_status().await.unwrap();
    assert_eq!(
        status.iter().find(|s| s.version == "0100").unwrap().state,
        MigrationState::Pending
    );

    // The retry fails the same way and still leaves no ledger row.
    assert!(repo.migrate().await.is_err());
    let ledger = repo.verify_migrations().await.unwrap();
    assert_eq!(ledger.len(), 5);
}

fn with_broken() -> Vec<Migration> {
    let mut migrations = builtin_migrations();
    migrations.push(Migration::new(
        "0100",
        "Broken",
        vec![SchemaChange::RawSql {
            sqlite: "ALTER TABLE no_such_table ADD COLUMN x INTEGER".into(),
            postgres: String::new(),
        }],
    ));
    migrations
}

#[tokio::test]
async fn test_failure_survives_restart_until_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("restart.db");

    let repo = Repository::with_migrations(StoreConfig::sqlite(&path, 3), with_broken()).unwrap();
    assert!(repo.migrate().await.is_err());
    drop(repo);

    // A new process still sees the failure and refuses to retry.
    let restarted = Repository::with_migrations(StoreConfig::sqlite(&path, 3), with_broken()).unwrap();
    let status = restarted.migration_status().await.unwrap();
    let broken = status.iter().find(|s| s.version == "0100").unwrap();
    assert!(matches!(&broken.state, MigrationState::Failed(cause) if cause.contains("no_such_table")));
    let err = restarted.migrate().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Migration);
    assert!(err.to_string().contains("acknowledgement"));

    let adapter = open(&path);
    let recorded = adapter.migration_failures().await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].version, "0100");

    assert!(restarted.acknowledge_failure("0100").await.unwrap());
    assert!(adapter.migration_failures().await.unwrap().is_empty());
    drop(restarted);

    // Acknowledged in one process, retried in the next.
    let retried = Repository::with_migrations(StoreConfig::sqlite(&path, 3), with_broken()).unwrap();
    let err = retried.migrate().await.unwrap_err();
    assert!(!err.to_string().contains("acknowledgement"));
    assert_eq!(adapter.migration_failures().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_tables_are_usable_only_after_migrate() {
    let repo = Repository::new(StoreConfig::in_memory(3)).unwrap();
    assert!(repo.projects().list().await.is_err());
    repo.migrate().await.unwrap();
    assert!(repo.projects().list().await.unwrap().is_empty());
    let status = repo.migration_status().await.unwrap();
    assert!(status.iter().all(|s| s.state == MigrationState::Applied));
}
