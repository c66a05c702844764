//! Connection handling for the embedded backend.
//!
//! Connections are `Arc<Mutex<Connection>>` so a checked-out connection can
//! move into `spawn_blocking` while the deadpool guard stays on the async
//! side. An in-memory database has exactly one connection, shared by the
//! pool.

use super::BACKEND;
use crate::storage::pool::acquire_lock;
use crate::{Error, Result};
use deadpool::managed::{Manager, Metrics, RecycleError, RecycleResult};
use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A connection that can cross into blocking tasks.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Applies the pragmas every connection needs.
///
/// # Configuration Applied
///
/// - **WAL mode**: concurrent readers with a single writer
/// - **NORMAL synchronous**: balances durability with performance
/// - **`busy_timeout`**: waits up to 5 seconds for the write lock
/// - **`foreign_keys`**: enforces references and `ON DELETE CASCADE`
///
/// # Errors
///
/// Returns an error if foreign key enforcement cannot be enabled.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode answers with a row, so these results are ignored
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", "5000");
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| map_error("configure", e))
}

/// Maps a driver error onto the crate's error taxonomy.
pub fn map_error(operation: &str, err: rusqlite::Error) -> Error {
    let rusqlite::Error::SqliteFailure(failure, message) = &err else {
        return Error::backend(operation, BACKEND, err);
    };
    match failure.code {
        ErrorCode::ConstraintViolation => {
            let detail = message.clone().unwrap_or_else(|| err.to_string());
            Error::constraint(operation, BACKEND, constraint_field(&detail), detail)
        },
        ErrorCode::DatabaseBusy
        | ErrorCode::DatabaseLocked
        | ErrorCode::CannotOpen
        | ErrorCode::SystemIoFailure => Error::connectivity(operation, BACKEND, err),
        _ => Error::backend(operation, BACKEND, err),
    }
}

/// Column named by a constraint message such as
/// `UNIQUE constraint failed: settings.key`.
///
/// Foreign key failures name no column.
fn constraint_field(message: &str) -> Option<String> {
    let (_, columns) = message.split_once("constraint failed: ")?;
    let first = columns.split(',').next()?.trim();
    first.rsplit_once('.').map(|(_, column)| column.to_string())
}

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    Memory(SharedConnection),
}

/// deadpool [`Manager`] for connections to one database.
#[derive(Debug, Clone)]
pub struct SqliteManager {
    target: Target,
}

impl SqliteManager {
    /// Connections to a database file. Parent directories are created on
    /// first connect.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Target::File(path.into()),
        }
    }

    /// A private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` cannot open the database.
    pub fn memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| map_error("connect", e))?;
        configure_connection(&conn)?;
        Ok(Self {
            target: Target::Memory(Arc::new(Mutex::new(conn))),
        })
    }

    /// Whether every checkout shares one in-memory connection.
    #[must_use]
    pub const fn is_memory(&self) -> bool {
        matches!(self.target, Target::Memory(_))
    }

    /// Database location for logs and status output.
    #[must_use]
    pub fn location(&self) -> String {
        match &self.target {
            Target::File(path) => path.display().to_string(),
            Target::Memory(_) => ":memory:".to_string(),
        }
    }
}

fn open_file(path: &Path) -> Result<SharedConnection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| Error::connectivity("connect", BACKEND, e))?;
    }
    let conn = Connection::open(path).map_err(|e| Error::connectivity("connect", BACKEND, e))?;
    configure_connection(&conn)?;
    tracing::debug!(path = %path.display(), "Opened SQLite connection");
    Ok(Arc::new(Mutex::new(conn)))
}

impl Manager for SqliteManager {
    type Type = SharedConnection;
    type Error = Error;

    async fn create(&self) -> Result<SharedConnection> {
        match &self.target {
            Target::Memory(conn) => Ok(Arc::clone(conn)),
            Target::File(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || open_file(&path))
                    .await
                    .map_err(|e| Error::connectivity("connect", BACKEND, e))?
            },
        }
    }

    /// Rejects a connection left inside an open transaction.
    async fn recycle(&self, conn: &mut SharedConnection, _: &Metrics) -> RecycleResult<Error> {
        if acquire_lock(conn).is_autocommit() {
            Ok(())
        } else {
            Err(RecycleError::Message("connection left inside a transaction".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use test_case::test_case;

    #[test]
    fn test_configure_connection() {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn).unwrap();

        let foreign_keys: i32 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .unwrap();
        assert_eq!(foreign_keys, 1);
        let busy_timeout: i32 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .unwrap();
        assert_eq!(busy_timeout, 5000);
    }

    #[test_case("UNIQUE constraint failed: settings.key", Some("key") ; "unique")]
    #[test_case("NOT NULL constraint failed: tasks.title", Some("title") ; "not null")]
    #[test_case("UNIQUE constraint failed: t.a, t.b", Some("a") ; "composite")]
    #[test_case("FOREIGN KEY constraint failed", None ; "foreign key")]
    fn test_constraint_field(message: &str, expected: Option<&str>) {
        assert_eq!(constraint_field(message).as_deref(), expected);
    }

    #[test]
    fn test_map_error_kinds() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE s (k TEXT UNIQUE); INSERT INTO s VALUES ('a');")
            .unwrap();
        let err = conn.execute("INSERT INTO s VALUES ('a')", []).unwrap_err();
        let mapped = map_error("create", err);
        assert_eq!(mapped.kind(), ErrorKind::ConstraintViolation);
        assert_eq!(mapped.field(), Some("k"));

        let err = conn.execute("SELECT * FROM missing", []).unwrap_err();
        assert_eq!(map_error("list", err).kind(), ErrorKind::Backend);
    }

    #[tokio::test]
    async fn test_memory_manager_shares_one_connection() {
        let manager = SqliteManager::memory().unwrap();
        assert!(manager.is_memory());
        let a = manager.create().await.unwrap();
        let b = manager.create().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_pool_discards_connection_left_in_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let pool = deadpool::managed::Pool::builder(SqliteManager::file(dir.path().join("tx.db")))
            .max_size(1)
            .build()
            .unwrap();

        let first = pool.get().await.unwrap();
        let first_ptr = Arc::clone(&first);
        drop(first);
        let second = pool.get().await.unwrap();
        assert!(Arc::ptr_eq(&first_ptr, &second));

        acquire_lock(&second).execute_batch("BEGIN").unwrap();
        drop(second);
        let third = pool.get().await.unwrap();
        assert!(!Arc::ptr_eq(&first_ptr, &third));
        assert!(acquire_lock(&third).is_autocommit());
    }

    #[tokio::test]
    async fn test_file_manager_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        let manager = SqliteManager::file(&path);
        let conn = manager.create().await.unwrap();
        acquire_lock(&conn).execute_batch("SELECT 1").unwrap();
        assert!(path.exists());
        assert_eq!(manager.location(), path.display().to_string());
    }
}
