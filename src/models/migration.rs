//! Migration ledger types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the `schema_migrations` ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration version. Versions sort lexicographically.
    pub version: String,
    /// Human-readable description.
    pub description: String,
    /// Hex SHA-256 of the migration definition.
    pub checksum: String,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
}

/// One row of the `schema_migration_failures` table.
///
/// A row blocks every later migration run until an operator clears it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFailure {
    /// Migration version.
    pub version: String,
    /// Error reported by the failed apply.
    pub cause: String,
    /// When the apply failed.
    pub failed_at: DateTime<Utc>,
}

impl MigrationFailure {
    /// A failure observed now.
    pub fn now(version: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            cause: cause.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Lifecycle of one migration within a tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum MigrationState {
    /// Not yet in the ledger.
    Pending,
    /// Currently being applied.
    Applying,
    /// Recorded in the ledger. Terminal.
    Applied,
    /// Apply failed. Terminal until an operator acknowledges it.
    Failed(String),
}

impl MigrationState {
    /// Returns `true` for `Applied` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Failed(_))
    }
}

/// Result of applying one migration through an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The schema change ran and the ledger row was written.
    Applied(MigrationRecord),
    /// The version was already in the ledger. Nothing ran.
    AlreadyApplied,
}

/// Status line for one known migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// Migration version.
    pub version: String,
    /// Human-readable description.
    pub description: String,
    /// Current state.
    pub state: MigrationState,
    /// When it was applied, if it was.
    pub applied_at: Option<DateTime<Utc>>,
}
