//! Static table descriptors.
//!
//! Every adapter derives its DDL, row decoding, default filling and cascade
//! behavior from these descriptors, so the tables look the same on every
//! backend.

use super::record::{EMBEDDING_FIELD, ID_FIELD, Record, embedding_from_value, embedding_to_value};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Creation timestamp column.
pub const CREATED_AT_FIELD: &str = "created_at";
/// Last-modification timestamp column.
pub const UPDATED_AT_FIELD: &str = "updated_at";
/// Hidden insertion sequence used for tie-breaking.
pub const SEQ_FIELD: &str = "_seq";
/// Name of the migration ledger table.
pub const LEDGER_TABLE: &str = "schema_migrations";

/// Failed migrations awaiting operator acknowledgement.
pub const MIGRATION_FAILURES_TABLE: &str = "schema_migration_failures";

/// The closed set of tables the store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Crawled or uploaded knowledge sources (aggregate root).
    Sources,
    /// Page and document metadata.
    Pages,
    /// Crawl bookkeeping per fetched URL.
    CrawledPages,
    /// Document chunks with embeddings.
    DocumentChunks,
    /// Code snippets with embeddings.
    CodeExamples,
    /// Key/value settings.
    Settings,
    /// Projects.
    Projects,
    /// Tasks within projects.
    Tasks,
    /// Version history of project documents.
    DocumentVersions,
    /// Links between projects and sources.
    ProjectSources,
}

impl Table {
    /// All tables, parents before children.
    pub const ALL: [Self; 10] = [
        Self::Sources,
        Self::Pages,
        Self::CrawledPages,
        Self::DocumentChunks,
        Self::CodeExamples,
        Self::Settings,
        Self::Projects,
        Self::Tasks,
        Self::DocumentVersions,
        Self::ProjectSources,
    ];

    /// Tables that hold embeddings.
    pub const VECTOR_COLLECTIONS: [Self; 2] = [Self::DocumentChunks, Self::CodeExamples];

    /// Returns the table name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sources => "sources",
            Self::Pages => "pages",
            Self::CrawledPages => "crawled_pages",
            Self::DocumentChunks => "document_chunks",
            Self::CodeExamples => "code_examples",
            Self::Settings => "settings",
            Self::Projects => "projects",
            Self::Tasks => "tasks",
            Self::DocumentVersions => "document_versions",
            Self::ProjectSources => "project_sources",
        }
    }

    /// Parses a table name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Returns the static schema for this table.
    #[must_use]
    pub const fn schema(self) -> &'static TableSchema {
        match self {
            Self::Sources => &SOURCES,
            Self::Pages => &PAGES,
            Self::CrawledPages => &CRAWLED_PAGES,
            Self::DocumentChunks => &DOCUMENT_CHUNKS,
            Self::CodeExamples => &CODE_EXAMPLES,
            Self::Settings => &SETTINGS,
            Self::Projects => &PROJECTS,
            Self::Tasks => &TASKS,
            Self::DocumentVersions => &DOCUMENT_VERSIONS,
            Self::ProjectSources => &PROJECT_SOURCES,
        }
    }

    /// Returns `true` if rows carry an embedding.
    #[must_use]
    pub fn is_vector_collection(self) -> bool {
        self.schema().column(EMBEDDING_FIELD).is_some()
    }

    /// Tables with a foreign key to this one, with the referencing column.
    #[must_use]
    pub fn children(self) -> Vec<(Self, &'static str)> {
        Self::ALL
            .into_iter()
            .flat_map(|child| {
                child
                    .schema()
                    .foreign_keys
                    .iter()
                    .filter(move |fk| fk.parent == self)
                    .map(move |fk| (child, fk.column))
            })
            .collect()
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// UTF-8 text.
    Text,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit float.
    Real,
    /// Boolean.
    Boolean,
    /// Arbitrary JSON document.
    Json,
    /// RFC 3339 UTC timestamp.
    Timestamp,
    /// Fixed-length `f32` embedding.
    Vector,
}

/// Value written when a create omits the column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDefault {
    /// Must be supplied by the caller.
    Required,
    /// Explicit `null`.
    Null,
    /// Text literal.
    Text(&'static str),
    /// Integer literal.
    Integer(i64),
    /// Boolean literal.
    Boolean(bool),
    /// `{}`.
    EmptyObject,
    /// `[]`.
    EmptyArray,
    /// Current time.
    Now,
    /// Fresh UUID v7.
    Uuid,
}

/// A column descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Column {
    /// Column name.
    pub name: &'static str,
    /// Storage type.
    pub ty: ColumnType,
    /// Default applied on create.
    pub default: ColumnDefault,
}

/// A foreign key with `ON DELETE CASCADE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    /// Referencing column.
    pub column: &'static str,
    /// Referenced table (its `id` column).
    pub parent: Table,
}

/// Static description of one table.
#[derive(Debug, Serialize)]
pub struct TableSchema {
    /// The table.
    pub table: Table,
    /// Columns in storage order. Always starts with `id`.
    pub columns: &'static [Column],
    /// Cascading foreign keys.
    pub foreign_keys: &'static [ForeignKey],
    /// Unique business key, used as the upsert conflict target.
    pub unique_key: Option<&'static str>,
    /// Secondary indexes.
    pub indexes: &'static [&'static [&'static str]],
    /// Column searched by keyword matching.
    pub text_column: Option<&'static str>,
}

/// Context for validating a write.
#[derive(Debug, Clone, Copy)]
pub struct WriteContext {
    /// Operation name, for error context.
    pub operation: &'static str,
    /// Backend name, for error context.
    pub backend: &'static str,
    /// Configured embedding dimensionality.
    pub dimensions: usize,
}

impl WriteContext {
    /// Creates a write context.
    #[must_use]
    pub const fn new(operation: &'static str, backend: &'static str, dimensions: usize) -> Self {
        Self {
            operation,
            backend,
            dimensions,
        }
    }

    fn invalid(&self, field: &str, message: impl Into<String>) -> Error {
        Error::validation(self.operation, self.backend, field, message)
    }
}

impl TableSchema {
    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the column or a validation error naming the field.
    pub fn require_column(
        &self,
        name: &str,
        operation: &str,
        backend: &'static str,
    ) -> Result<&'static Column> {
        self.column(name).ok_or_else(|| {
            Error::validation(
                operation,
                backend,
                name,
                format!("unknown field for table '{}'", self.table.name()),
            )
        })
    }

    /// Column names in storage order.
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> {
        self.columns.iter().map(|c| c.name)
    }

    /// Returns the upsert conflict target.
    #[must_use]
    pub fn conflict_key(&self) -> &'static str {
        self.unique_key.unwrap_or(ID_FIELD)
    }

    /// Validates a new row and fills every default explicitly.
    ///
    /// The returned record has every column, in storage order.
    pub fn prepare_insert(&self, record: Record, ctx: &WriteContext) -> Result<Record> {
        let mut supplied = record.into_inner();
        for field in supplied.keys() {
            if self.column(field).is_none() {
                return Err(ctx.invalid(
                    field,
                    format!("unknown field for table '{}'", self.table.name()),
                ));
            }
        }

        let mut out = Map::with_capacity(self.columns.len());
        for column in self.columns {
            let value = match supplied.remove(column.name) {
                Some(value) => normalize_value(column, value, ctx)?,
                None => default_value(column, ctx)?,
            };
            out.insert(column.name.to_string(), value);
        }
        Ok(Record::from(out))
    }

    /// Validates a partial update.
    ///
    /// Only supplied fields are returned, normalized. `updated_at` is set to
    /// now unless supplied. The id is immutable.
    pub fn prepare_patch(&self, patch: Record, ctx: &WriteContext) -> Result<Record> {
        let mut out = Map::new();
        for (field, value) in patch {
            let column = self.column(&field).ok_or_else(|| {
                ctx.invalid(
                    &field,
                    format!("unknown field for table '{}'", self.table.name()),
                )
            })?;
            if field == ID_FIELD {
                return Err(ctx.invalid(ID_FIELD, "id cannot be changed"));
            }
            out.insert(field, normalize_value(column, value, ctx)?);
        }
        if !out.contains_key(UPDATED_AT_FIELD) {
            out.insert(UPDATED_AT_FIELD.to_string(), Value::String(now_timestamp()));
        }
        Ok(Record::from(out))
    }
}

fn default_value(column: &Column, ctx: &WriteContext) -> Result<Value> {
    Ok(match column.default {
        ColumnDefault::Required => {
            return Err(ctx.invalid(column.name, "required field is missing"));
        },
        ColumnDefault::Null => Value::Null,
        ColumnDefault::Text(s) => Value::String(s.to_string()),
        ColumnDefault::Integer(i) => Value::from(i),
        ColumnDefault::Boolean(b) => Value::Bool(b),
        ColumnDefault::EmptyObject => Value::Object(Map::new()),
        ColumnDefault::EmptyArray => Value::Array(Vec::new()),
        ColumnDefault::Now => Value::String(now_timestamp()),
        ColumnDefault::Uuid => Value::String(uuid::Uuid::now_v7().to_string()),
    })
}

/// Checks a value against its column type and normalizes it.
///
/// Timestamps are rewritten to UTC with microsecond precision, embeddings to
/// `f32` precision, so every backend stores the same representation.
pub fn normalize_value(column: &Column, value: Value, ctx: &WriteContext) -> Result<Value> {
    if value.is_null() {
        return match column.default {
            ColumnDefault::Required | ColumnDefault::Uuid | ColumnDefault::Now => {
                Err(ctx.invalid(column.name, "field cannot be null"))
            },
            _ => Ok(Value::Null),
        };
    }

    let ok = match column.ty {
        ColumnType::Text => value.is_string(),
        ColumnType::Integer => value.is_i64(),
        ColumnType::Real => value.is_number(),
        ColumnType::Boolean => value.is_boolean(),
        ColumnType::Json => true,
        ColumnType::Timestamp => {
            let normalized = value.as_str().and_then(normalize_timestamp);
            return normalized
                .map(Value::String)
                .ok_or_else(|| ctx.invalid(column.name, "expected an RFC 3339 timestamp"));
        },
        ColumnType::Vector => {
            let embedding = embedding_from_value(&value)
                .ok_or_else(|| ctx.invalid(column.name, "expected an array of numbers"))?;
            if embedding.len() != ctx.dimensions {
                return Err(ctx.invalid(
                    column.name,
                    format!(
                        "expected {} dimensions, got {}",
                        ctx.dimensions,
                        embedding.len()
                    ),
                ));
            }
            return Ok(embedding_to_value(&embedding));
        },
    };
    if ok {
        Ok(value)
    } else {
        Err(ctx.invalid(column.name, format!("expected a {:?} value", column.ty)))
    }
}

/// Current time in the stored timestamp format.
#[must_use]
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Formats a timestamp the way every adapter stores it.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses any RFC 3339 timestamp and reformats it in UTC.
#[must_use]
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| format_timestamp(ts.with_timezone(&Utc)))
}

// ============================================================================
// Table definitions
// ============================================================================

const fn col(name: &'static str, ty: ColumnType, default: ColumnDefault) -> Column {
    Column { name, ty, default }
}

const fn fk(column: &'static str, parent: Table) -> ForeignKey {
    ForeignKey { column, parent }
}

use ColumnDefault as D;
use ColumnType as T;

const ID: Column = col(ID_FIELD, T::Text, D::Uuid);
const CREATED_AT: Column = col(CREATED_AT_FIELD, T::Timestamp, D::Now);
const UPDATED_AT: Column = col(UPDATED_AT_FIELD, T::Timestamp, D::Now);

static SOURCES: TableSchema = TableSchema {
    table: Table::Sources,
    columns: &[
        ID,
        col("source_url", T::Text, D::Null),
        col("display_name", T::Text, D::Null),
        col("summary", T::Text, D::Null),
        col("total_word_count", T::Integer, D::Integer(0)),
        col("metadata", T::Json, D::EmptyObject),
        CREATED_AT,
        UPDATED_AT,
    ],
    foreign_keys: &[],
    unique_key: None,
    indexes: &[&["source_url"]],
    text_column: None,
};

static PAGES: TableSchema = TableSchema {
    table: Table::Pages,
    columns: &[
        ID,
        col("source_id", T::Text, D::Required),
        col("url", T::Text, D::Required),
        col("section_title", T::Text, D::Null),
        col("full_content", T::Text, D::Null),
        col("word_count", T::Integer, D::Integer(0)),
        col("chunk_count", T::Integer, D::Integer(0)),
        col("metadata", T::Json, D::EmptyObject),
        CREATED_AT,
        UPDATED_AT,
    ],
    foreign_keys: &[fk("source_id", Table::Sources)],
    unique_key: None,
    indexes: &[&["source_id"], &["url"]],
    text_column: Some("full_content"),
};

static CRAWLED_PAGES: TableSchema = TableSchema {
    table: Table::CrawledPages,
    columns: &[
        ID,
        col("source_id", T::Text, D::Required),
        col("url", T::Text, D::Required),
        col("status", T::Text, D::Text("pending")),
        col("http_status", T::Integer, D::Null),
        col("content_hash", T::Text, D::Null),
        col("crawled_at", T::Timestamp, D::Null),
        col("metadata", T::Json, D::EmptyObject),
        CREATED_AT,
        UPDATED_AT,
    ],
    foreign_keys: &[fk("source_id", Table::Sources)],
    unique_key: None,
    indexes: &[&["source_id"], &["status"]],
    text_column: None,
};

static DOCUMENT_CHUNKS: TableSchema = TableSchema {
    table: Table::DocumentChunks,
    columns: &[
        ID,
        col("source_id", T::Text, D::Required),
        col("page_id", T::Text, D::Null),
        col("url", T::Text, D::Null),
        col("chunk_number", T::Integer, D::Integer(0)),
        col("content", T::Text, D::Required),
        col("metadata", T::Json, D::EmptyObject),
        col(EMBEDDING_FIELD, T::Vector, D::Null),
        CREATED_AT,
        UPDATED_AT,
    ],
    foreign_keys: &[fk("source_id", Table::Sources), fk("page_id", Table::Pages)],
    unique_key: None,
    indexes: &[&["source_id"], &["page_id"]],
    text_column: Some("content"),
};

static CODE_EXAMPLES: TableSchema = TableSchema {
    table: Table::CodeExamples,
    columns: &[
        ID,
        col("source_id", T::Text, D::Required),
        col("url", T::Text, D::Null),
        col("chunk_number", T::Integer, D::Integer(0)),
        col("content", T::Text, D::Required),
        col("summary", T::Text, D::Null),
        col("language", T::Text, D::Null),
        col("metadata", T::Json, D::EmptyObject),
        col(EMBEDDING_FIELD, T::Vector, D::Null),
        CREATED_AT,
        UPDATED_AT,
    ],
    foreign_keys: &[fk("source_id", Table::Sources)],
    unique_key: None,
    indexes: &[&["source_id"]],
    text_column: Some("content"),
};

static SETTINGS: TableSchema = TableSchema {
    table: Table::Settings,
    columns: &[
        ID,
        col("key", T::Text, D::Required),
        col("value", T::Text, D::Null),
        col("is_encrypted", T::Boolean, D::Boolean(false)),
        col("category", T::Text, D::Null),
        col("description", T::Text, D::Null),
        CREATED_AT,
        UPDATED_AT,
    ],
    foreign_keys: &[],
    unique_key: Some("key"),
    indexes: &[&["category"]],
    text_column: None,
};

static PROJECTS: TableSchema = TableSchema {
    table: Table::Projects,
    columns: &[
        ID,
        col("title", T::Text, D::Required),
        col("description", T::Text, D::Text("")),
        col("docs", T::Json, D::EmptyArray),
        col("features", T::Json, D::EmptyArray),
        col("data", T::Json, D::EmptyArray),
        col("pinned", T::Boolean, D::Boolean(false)),
        col("github_repo", T::Text, D::Null),
        CREATED_AT,
        UPDATED_AT,
    ],
    foreign_keys: &[],
    unique_key: None,
    indexes: &[],
    text_column: None,
};

static TASKS: TableSchema = TableSchema {
    table: Table::Tasks,
    columns: &[
        ID,
        col("project_id", T::Text, D::Required),
        col("parent_task_id", T::Text, D::Null),
        col("title", T::Text, D::Required),
        col("description", T::Text, D::Text("")),
        col("status", T::Text, D::Text("todo")),
        col("assignee", T::Text, D::Text("User")),
        col("task_order", T::Integer, D::Integer(0)),
        col("feature", T::Text, D::Null),
        col("sources", T::Json, D::EmptyArray),
        col("code_examples", T::Json, D::EmptyArray),
        col("archived", T::Boolean, D::Boolean(false)),
        CREATED_AT,
        UPDATED_AT,
    ],
    foreign_keys: &[fk("project_id", Table::Projects), fk("parent_task_id", Table::Tasks)],
    unique_key: None,
    indexes: &[&["project_id", "status"], &["parent_task_id"]],
    text_column: None,
};

static DOCUMENT_VERSIONS: TableSchema = TableSchema {
    table: Table::DocumentVersions,
    columns: &[
        ID,
        col("project_id", T::Text, D::Null),
        col("source_id", T::Text, D::Null),
        col("field_name", T::Text, D::Required),
        col("version_number", T::Integer, D::Required),
        col("content", T::Json, D::Required),
        col("change_summary", T::Text, D::Null),
        col("change_type", T::Text, D::Text("update")),
        col("created_by", T::Text, D::Text("system")),
        CREATED_AT,
        UPDATED_AT,
    ],
    foreign_keys: &[fk("project_id", Table::Projects), fk("source_id", Table::Sources)],
    unique_key: None,
    indexes: &[&["project_id", "field_name"], &["source_id"]],
    text_column: None,
};

static PROJECT_SOURCES: TableSchema = TableSchema {
    table: Table::ProjectSources,
    columns: &[
        ID,
        col("project_id", T::Text, D::Required),
        col("source_id", T::Text, D::Required),
        col("notes", T::Text, D::Null),
        CREATED_AT,
        UPDATED_AT,
    ],
    foreign_keys: &[fk("project_id", Table::Projects), fk("source_id", Table::Sources)],
    unique_key: None,
    indexes: &[&["project_id"], &["source_id"]],
    text_column: None,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    const CTX: WriteContext = WriteContext::new("create", "test", 3);

    #[test]
    fn test_prepare_insert_writes_every_default() {
        let record = Record::new().with("project_id", "p1").with("title", "Write docs");
        let prepared = Table::Tasks.schema().prepare_insert(record, &CTX).unwrap();

        assert!(prepared.id().is_some());
        assert_eq!(prepared.get_str("status"), Some("todo"));
        assert_eq!(prepared.get_str("assignee"), Some("User"));
        assert_eq!(prepared.get_i64("task_order"), Some(0));
        assert_eq!(prepared.get_bool("archived"), Some(false));
        assert_eq!(prepared.get("parent_task_id"), Some(&Value::Null));
        assert_eq!(prepared.get("sources"), Some(&json!([])));
        assert_eq!(prepared.len(), Table::Tasks.schema().columns.len());
        let order: Vec<_> = prepared.fields().collect();
        let expected: Vec<_> = Table::Tasks.schema().column_names().collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_prepare_insert_rejects_unknown_field() {
        let record = Record::new().with("title", "x").with("colour", "red");
        let err = Table::Projects.schema().prepare_insert(record, &CTX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.field(), Some("colour"));
    }

    #[test]
    fn test_prepare_insert_rejects_missing_required() {
        let err = Table::Settings
            .schema()
            .prepare_insert(Record::new().with("value", "v"), &CTX)
            .unwrap_err();
        assert_eq!(err.field(), Some("key"));
    }

    #[test]
    fn test_embedding_dimension_guard() {
        let record = Record::new()
            .with("source_id", "s")
            .with("content", "c")
            .with("embedding", json!([0.1, 0.2]));
        let err = Table::DocumentChunks
            .schema()
            .prepare_insert(record, &CTX)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.field(), Some("embedding"));
    }

    #[test]
    fn test_timestamps_are_normalized_to_utc() {
        assert_eq!(
            normalize_timestamp("2024-03-01T10:00:00+02:00").as_deref(),
            Some("2024-03-01T08:00:00.000000Z")
        );
        assert_eq!(normalize_timestamp("yesterday"), None);
    }

    #[test]
    fn test_prepare_patch_sets_updated_at_and_protects_id() {
        let schema = Table::Projects.schema();
        let patch = schema
            .prepare_patch(Record::new().with("pinned", true), &CTX)
            .unwrap();
        assert!(patch.contains(UPDATED_AT_FIELD));
        assert!(!patch.contains("title"));

        let err = schema
            .prepare_patch(Record::new().with("id", "other"), &CTX)
            .unwrap_err();
        assert_eq!(err.field(), Some("id"));
    }

    #[test]
    fn test_children_follow_foreign_keys() {
        let children = Table::Sources.children();
        for expected in [
            Table::Pages,
            Table::CrawledPages,
            Table::DocumentChunks,
            Table::CodeExamples,
            Table::DocumentVersions,
            Table::ProjectSources,
        ] {
            assert!(children.iter().any(|(t, _)| *t == expected), "{expected}");
        }
        assert!(Table::Tasks.children().contains(&(Table::Tasks, "parent_task_id")));
    }

    #[test]
    fn test_parse_round_trips_names() {
        for table in Table::ALL {
            assert_eq!(Table::parse(table.name()), Some(table));
        }
        assert_eq!(Table::parse("memories"), None);
    }
}
