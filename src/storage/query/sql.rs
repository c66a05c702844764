//! Parameterized SQL rendering for the relational adapters.
//!
//! Identifiers always come from the static schema and are quoted. Values are
//! always bound parameters.

use super::{Direction, Predicate, Query};
use crate::models::schema::{
    CREATED_AT_FIELD, ColumnDefault, LEDGER_TABLE, MIGRATION_FAILURES_TABLE, SEQ_FIELD, UPDATED_AT_FIELD,
};
use crate::models::{Column, ColumnType, EMBEDDING_FIELD, ID_FIELD, Record, Table, embedding_from_value};
use crate::storage::migrations::SchemaChange;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt::Write as _;
use std::ops::Bound;

/// Alias of the queried table in rendered statements.
const ALIAS: &str = "t";

/// Name of the computed score column in search statements.
pub const SCORE_COLUMN: &str = "_score";

/// SQL flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// `SQLite` (`?N` placeholders, rowid ordering).
    Sqlite,
    /// PostgreSQL (`$N` placeholders, `_seq` ordering).
    Postgres,
}

impl SqlDialect {
    fn placeholder(self, n: usize) -> String {
        match self {
            Self::Sqlite => format!("?{n}"),
            Self::Postgres => format!("${n}"),
        }
    }

    fn seq(self, alias: &str) -> String {
        match self {
            Self::Sqlite => format!("{}.rowid", quote(alias)),
            Self::Postgres => format!("{}.{}", quote(alias), quote(SEQ_FIELD)),
        }
    }

    const fn distinct_from(self) -> &'static str {
        match self {
            Self::Sqlite => "IS NOT",
            Self::Postgres => "IS DISTINCT FROM",
        }
    }
}

/// Quotes an identifier.
#[must_use]
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified(alias: &str, column: &str) -> String {
    format!("{}.{}", quote(alias), quote(column))
}

/// A bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// Typed null.
    Null(ColumnType),
    /// Text.
    Text(String),
    /// Integer.
    Integer(i64),
    /// Float.
    Real(f64),
    /// Boolean.
    Bool(bool),
    /// JSON document.
    Json(Value),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
    /// pgvector literal, bound as text and cast.
    Vector(Vec<f32>),
    /// Text array (JSON paths).
    TextArray(Vec<String>),
}

/// Formats an embedding as a pgvector literal: `[1,2,3]`.
#[must_use]
pub fn format_vector(embedding: &[f32]) -> String {
    let values: Vec<String> = embedding.iter().map(ToString::to_string).collect();
    format!("[{}]", values.join(","))
}

/// Parses a pgvector literal.
#[must_use]
pub fn parse_vector(text: &str) -> Option<Vec<f32>> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner.split(',').map(|v| v.trim().parse::<f32>().ok()).collect()
}

/// A rendered statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    /// SQL text.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<SqlParam>,
    /// Returned columns, in select order.
    pub columns: Vec<&'static Column>,
    /// Whether a trailing `_score` column follows `columns`.
    pub scored: bool,
}

struct Binder {
    dialect: SqlDialect,
    params: Vec<SqlParam>,
}

impl Binder {
    const fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        self.dialect.placeholder(self.params.len())
    }

    fn finish(self, sql: String, columns: Vec<&'static Column>, scored: bool) -> SqlStatement {
        SqlStatement {
            sql,
            params: self.params,
            columns,
            scored,
        }
    }
}

/// Renders [`Query`] values and writes for one dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlBuilder {
    dialect: SqlDialect,
    native_vectors: bool,
    backend: &'static str,
}

impl SqlBuilder {
    /// Builder for the embedded `SQLite` backend.
    #[must_use]
    pub const fn sqlite() -> Self {
        Self {
            dialect: SqlDialect::Sqlite,
            native_vectors: false,
            backend: "embedded-file",
        }
    }

    /// Builder for PostgreSQL, with or without pgvector.
    #[must_use]
    pub const fn postgres(native_vectors: bool, backend: &'static str) -> Self {
        Self {
            dialect: SqlDialect::Postgres,
            native_vectors,
            backend,
        }
    }

    /// The dialect rendered.
    #[must_use]
    pub const fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    fn invalid(&self, column: &Column, message: &str) -> Error {
        Error::validation("render", self.backend, column.name, message)
    }

    /// Converts a normalized value into a parameter for a column.
    pub fn param(&self, column: &Column, value: &Value) -> Result<SqlParam> {
        if value.is_null() {
            return Ok(SqlParam::Null(column.ty));
        }
        let wrong = || self.invalid(column, "value does not match the column type");
        Ok(match column.ty {
            ColumnType::Text => SqlParam::Text(value.as_str().ok_or_else(wrong)?.to_string()),
            ColumnType::Integer => SqlParam::Integer(value.as_i64().ok_or_else(wrong)?),
            ColumnType::Real => SqlParam::Real(value.as_f64().ok_or_else(wrong)?),
            ColumnType::Boolean => SqlParam::Bool(value.as_bool().ok_or_else(wrong)?),
            ColumnType::Json => match self.dialect {
                SqlDialect::Postgres => SqlParam::Json(value.clone()),
                SqlDialect::Sqlite => SqlParam::Text(value.to_string()),
            },
            ColumnType::Timestamp => {
                let raw = value.as_str().ok_or_else(wrong)?;
                match self.dialect {
                    SqlDialect::Sqlite => SqlParam::Text(raw.to_string()),
                    SqlDialect::Postgres => SqlParam::Timestamp(
                        DateTime::parse_from_rfc3339(raw)
                            .map_err(|_| wrong())?
                            .with_timezone(&Utc),
                    ),
                }
            },
            ColumnType::Vector => {
                let embedding = embedding_from_value(value).ok_or_else(wrong)?;
                match (self.dialect, self.native_vectors) {
                    (SqlDialect::Postgres, true) => SqlParam::Vector(embedding),
                    (SqlDialect::Postgres, false) => SqlParam::Json(value.clone()),
                    (SqlDialect::Sqlite, _) => SqlParam::Text(value.to_string()),
                }
            },
        })
    }

    fn value_expr(&self, column: &Column, placeholder: &str) -> String {
        if self.dialect == SqlDialect::Postgres
            && self.native_vectors
            && column.ty == ColumnType::Vector
        {
            format!("{placeholder}::text::vector")
        } else {
            placeholder.to_string()
        }
    }

    fn select_expr(&self, alias: &str, column: &Column) -> String {
        let col = qualified(alias, column.name);
        if self.dialect == SqlDialect::Postgres
            && self.native_vectors
            && column.ty == ColumnType::Vector
        {
            format!("{col}::text AS {}", quote(column.name))
        } else {
            col
        }
    }

    fn text_order(&self, column: &Column, expr: String) -> String {
        if self.dialect == SqlDialect::Postgres && column.ty == ColumnType::Text {
            format!("{expr} COLLATE \"C\"")
        } else {
            expr
        }
    }

    fn projection(query: &Query) -> Vec<&'static Column> {
        let schema = query.table.schema();
        match &query.columns {
            None => schema.columns.iter().collect(),
            Some(names) => {
                let mut cols: Vec<&'static Column> = schema.column(ID_FIELD).into_iter().collect();
                for name in names {
                    if let Some(col) = schema.column(name)
                        && !cols.iter().any(|c| c.name == col.name)
                    {
                        cols.push(col);
                    }
                }
                cols
            },
        }
    }

    fn select_list(&self, alias: &str, columns: &[&'static Column]) -> String {
        columns
            .iter()
            .map(|c| self.select_expr(alias, c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn predicate(
        &self,
        alias: &str,
        table: Table,
        predicate: &Predicate,
        binder: &mut Binder,
    ) -> Result<Option<String>> {
        if !predicate.is_constraint() {
            return Ok(None);
        }
        let column = table
            .schema()
            .require_column(predicate.field(), "render", self.backend)?;
        let col = qualified(alias, column.name);
        let rendered = match predicate {
            Predicate::Equals { value, .. } => {
                let ph = binder.bind(self.param(column, value)?);
                format!("{col} = {ph}")
            },
            Predicate::IsNull { .. } => format!("{col} IS NULL"),
            Predicate::InSet { values, .. } => {
                if values.is_empty() {
                    "1 = 0".to_string()
                } else {
                    let phs = values
                        .iter()
                        .map(|v| self.param(column, v).map(|p| binder.bind(p)))
                        .collect::<Result<Vec<_>>>()?;
                    format!("{col} IN ({})", phs.join(", "))
                }
            },
            Predicate::JsonPathEquals { path, value, .. } => match self.dialect {
                SqlDialect::Postgres => {
                    let path_ph = binder.bind(SqlParam::TextArray(path.clone()));
                    let value_ph = binder.bind(SqlParam::Json(value.clone()));
                    format!("({col} #> {path_ph}::text[]) = {value_ph}::jsonb")
                },
                SqlDialect::Sqlite => {
                    let mut json_path = String::from("$");
                    for key in path {
                        let _ = write!(json_path, ".\"{}\"", key.replace('"', "\\\""));
                    }
                    let path_ph = binder.bind(SqlParam::Text(json_path));
                    let value_ph = binder.bind(json_scalar_param(value));
                    format!("json_extract({col}, {path_ph}) = {value_ph}")
                },
            },
            Predicate::Range { lower, upper, .. } => {
                let mut parts = Vec::new();
                let target = self.text_order(column, col.clone());
                for (bound, inclusive, exclusive) in [(lower, ">=", ">"), (upper, "<=", "<")] {
                    let (op, value) = match bound {
                        Bound::Included(v) => (inclusive, v),
                        Bound::Excluded(v) => (exclusive, v),
                        Bound::Unbounded => continue,
                    };
                    let ph = binder.bind(self.param(column, value)?);
                    parts.push(format!("{target} {op} {ph}"));
                }
                parts.join(" AND ")
            },
        };
        Ok(Some(rendered))
    }

    fn where_clause(&self, query: &Query, binder: &mut Binder) -> Result<Vec<String>> {
        let mut clauses = Vec::new();
        for predicate in &query.predicates {
            if let Some(rendered) = self.predicate(ALIAS, query.table, predicate, binder)? {
                clauses.push(rendered);
            }
        }
        for (i, join) in query.joins.iter().enumerate() {
            let alias = format!("j{i}");
            let mut inner = vec![format!(
                "{} = {}",
                qualified(&alias, &join.foreign_field),
                qualified(ALIAS, &join.local_field)
            )];
            for predicate in &join.predicates {
                if let Some(rendered) = self.predicate(&alias, join.table, predicate, binder)? {
                    inner.push(rendered);
                }
            }
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM {} AS {} WHERE {})",
                quote(join.table.name()),
                quote(&alias),
                inner.join(" AND ")
            ));
        }
        Ok(clauses)
    }

    fn push_where(sql: &mut String, clauses: &[String]) {
        if !clauses.is_empty() {
            let _ = write!(sql, " WHERE {}", clauses.join(" AND "));
        }
    }

    fn order_clause(&self, query: &Query) -> String {
        let schema = query.table.schema();
        let mut terms = Vec::new();
        for order in &query.order {
            if let Some(column) = schema.column(&order.field) {
                let expr = self.text_order(column, qualified(ALIAS, column.name));
                let dir = match order.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                terms.push(format!("{expr} {dir} NULLS LAST"));
            }
        }
        terms.push(format!("{} ASC", self.dialect.seq(ALIAS)));
        format!(" ORDER BY {}", terms.join(", "))
    }

    fn limit_clause(&self, limit: Option<usize>, offset: Option<usize>) -> String {
        match (limit, offset, self.dialect) {
            (None, None, _) => String::new(),
            (Some(l), None, _) => format!(" LIMIT {l}"),
            (Some(l), Some(o), _) => format!(" LIMIT {l} OFFSET {o}"),
            (None, Some(o), SqlDialect::Sqlite) => format!(" LIMIT -1 OFFSET {o}"),
            (None, Some(o), SqlDialect::Postgres) => format!(" OFFSET {o}"),
        }
    }

    fn from(table: Table) -> String {
        format!("{} AS {}", quote(table.name()), quote(ALIAS))
    }

    /// `SELECT` for a checked query.
    pub fn select(&self, query: &Query) -> Result<SqlStatement> {
        let mut binder = Binder::new(self.dialect);
        let columns = Self::projection(query);
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.select_list(ALIAS, &columns),
            Self::from(query.table)
        );
        let clauses = self.where_clause(query, &mut binder)?;
        Self::push_where(&mut sql, &clauses);
        sql.push_str(&self.order_clause(query));
        sql.push_str(&self.limit_clause(query.limit, query.offset));
        Ok(binder.finish(sql, columns, false))
    }

    /// `SELECT "id"` for a checked query, in query order.
    pub fn select_ids(&self, query: &Query) -> Result<SqlStatement> {
        let mut ids_only = query.clone();
        ids_only.columns = Some(Vec::new());
        self.select(&ids_only)
    }

    /// `SELECT COUNT(*)` for a checked query. Limit and offset are ignored.
    pub fn count(&self, query: &Query) -> Result<SqlStatement> {
        let mut binder = Binder::new(self.dialect);
        let mut sql = format!("SELECT COUNT(*) FROM {}", Self::from(query.table));
        let clauses = self.where_clause(query, &mut binder)?;
        Self::push_where(&mut sql, &clauses);
        Ok(binder.finish(sql, Vec::new(), false))
    }

    /// `SELECT` of one row by id.
    pub fn get_by_id(&self, table: Table, id: &str) -> Result<SqlStatement> {
        self.select(&Query::table(table).filter(Predicate::equals(ID_FIELD, id)))
    }

    /// Multi-row `INSERT` of prepared rows (every column present).
    pub fn insert(&self, table: Table, rows: &[Record]) -> Result<SqlStatement> {
        let schema = table.schema();
        let mut binder = Binder::new(self.dialect);
        let names: Vec<String> = schema.column_names().map(quote).collect();
        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(schema.columns.len());
            for column in schema.columns {
                let value = row.get(column.name).unwrap_or(&Value::Null);
                let ph = binder.bind(self.param(column, value)?);
                values.push(self.value_expr(column, &ph));
            }
            tuples.push(format!("({})", values.join(", ")));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote(table.name()),
            names.join(", "),
            tuples.join(", ")
        );
        Ok(binder.finish(sql, Vec::new(), false))
    }

    /// `UPDATE ... RETURNING` for a prepared patch.
    ///
    /// On PostgreSQL, JSON object columns merge their top-level keys in SQL.
    /// `SQLite` callers merge before rendering and get a plain `SET`.
    pub fn update(&self, table: Table, id: &str, patch: &Record) -> Result<SqlStatement> {
        let schema = table.schema();
        let mut binder = Binder::new(self.dialect);
        let mut sets = Vec::with_capacity(patch.len());
        for (field, value) in patch.iter() {
            let column = schema.require_column(field, "update", self.backend)?;
            let ph = binder.bind(self.param(column, value)?);
            let target = quote(column.name);
            let set = if self.dialect == SqlDialect::Postgres && column.ty == ColumnType::Json {
                format!(
                    "{target} = CASE WHEN jsonb_typeof({target}) = 'object' \
                     AND jsonb_typeof({ph}::jsonb) = 'object' \
                     THEN {target} || {ph}::jsonb ELSE {ph}::jsonb END"
                )
            } else {
                format!("{target} = {}", self.value_expr(column, &ph))
            };
            sets.push(set);
        }
        let id_ph = binder.bind(SqlParam::Text(id.to_string()));
        let columns: Vec<&'static Column> = schema.columns.iter().collect();
        let returning: Vec<String> = columns
            .iter()
            .map(|c| {
                if self.dialect == SqlDialect::Postgres
                    && self.native_vectors
                    && c.ty == ColumnType::Vector
                {
                    format!("{}::text AS {}", quote(c.name), quote(c.name))
                } else {
                    quote(c.name)
                }
            })
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {id_ph} RETURNING {}",
            quote(table.name()),
            sets.join(", "),
            quote(ID_FIELD),
            returning.join(", ")
        );
        Ok(binder.finish(sql, columns, false))
    }

    /// `DELETE` by ids.
    #[must_use]
    pub fn delete_by_ids(&self, table: Table, ids: &[String]) -> SqlStatement {
        let mut binder = Binder::new(self.dialect);
        let phs: Vec<String> = ids
            .iter()
            .map(|id| binder.bind(SqlParam::Text(id.clone())))
            .collect();
        let sql = if phs.is_empty() {
            format!("DELETE FROM {} WHERE 1 = 0", quote(table.name()))
        } else {
            format!(
                "DELETE FROM {} WHERE {} IN ({})",
                quote(table.name()),
                quote(ID_FIELD),
                phs.join(", ")
            )
        };
        binder.finish(sql, Vec::new(), false)
    }

    /// `INSERT ... ON CONFLICT` on the table's conflict key.
    ///
    /// Only `supplied` fields are overwritten on conflict, and only when one
    /// of them actually differs, so repeating an identical upsert changes
    /// nothing.
    pub fn upsert(&self, table: Table, row: &Record, supplied: &[String]) -> Result<SqlStatement> {
        let schema = table.schema();
        let key = schema.conflict_key();
        let insert = self.insert(table, std::slice::from_ref(row))?;
        let mut sql = insert.sql.replacen(
            &format!("INSERT INTO {}", quote(table.name())),
            &format!("INSERT INTO {}", Self::from(table)),
            1,
        );
        let updatable: Vec<&str> = supplied
            .iter()
            .map(String::as_str)
            .filter(|f| ![ID_FIELD, key, CREATED_AT_FIELD, UPDATED_AT_FIELD].contains(f))
            .filter(|f| schema.column(f).is_some())
            .collect();
        let _ = write!(sql, " ON CONFLICT ({})", quote(key));
        if updatable.is_empty() {
            sql.push_str(" DO NOTHING");
        } else {
            let mut sets: Vec<String> = updatable
                .iter()
                .map(|f| format!("{} = excluded.{}", quote(f), quote(f)))
                .collect();
            sets.push(format!(
                "{} = excluded.{}",
                quote(UPDATED_AT_FIELD),
                quote(UPDATED_AT_FIELD)
            ));
            let changed: Vec<String> = updatable
                .iter()
                .map(|f| {
                    format!(
                        "{} {} excluded.{}",
                        qualified(ALIAS, f),
                        self.dialect.distinct_from(),
                        quote(f)
                    )
                })
                .collect();
            let _ = write!(
                sql,
                " DO UPDATE SET {} WHERE {}",
                sets.join(", "),
                changed.join(" OR ")
            );
        }
        Ok(SqlStatement {
            sql,
            params: insert.params,
            columns: Vec::new(),
            scored: false,
        })
    }

    /// Rows whose id is in `ids` and that satisfy `query`'s predicates.
    pub fn select_by_ids(&self, query: &Query, ids: &[String]) -> Result<SqlStatement> {
        let scoped = query.clone().filter(Predicate::in_set(ID_FIELD, ids.iter().cloned()));
        self.select(&scoped)
    }

    fn search_columns(table: Table) -> Vec<&'static Column> {
        table
            .schema()
            .columns
            .iter()
            .filter(|c| c.name != EMBEDDING_FIELD)
            .collect()
    }

    /// Native pgvector nearest-neighbour search.
    ///
    /// Similarity is `1 - cosine distance`; ties break on insertion order.
    pub fn vector_search(
        &self,
        query: &Query,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<SqlStatement> {
        let mut binder = Binder::new(self.dialect);
        let columns = Self::search_columns(query.table);
        let vector_ph = binder.bind(SqlParam::Vector(embedding.to_vec()));
        let embedding_col = qualified(ALIAS, EMBEDDING_FIELD);
        let distance = format!("{embedding_col} <=> {vector_ph}::text::vector");
        let mut sql = format!(
            "SELECT {}, 1 - ({distance}) AS {} FROM {}",
            self.select_list(ALIAS, &columns),
            quote(SCORE_COLUMN),
            Self::from(query.table)
        );
        let mut clauses = vec![format!("{embedding_col} IS NOT NULL")];
        clauses.extend(self.where_clause(query, &mut binder)?);
        Self::push_where(&mut sql, &clauses);
        let _ = write!(
            sql,
            " ORDER BY {distance}, {} ASC LIMIT {top_k}",
            self.dialect.seq(ALIAS)
        );
        Ok(binder.finish(sql, columns, true))
    }

    /// Term-match search over the table's text column.
    ///
    /// The score is the fraction of terms found; rows matching no term are
    /// excluded. Ties break on insertion order.
    pub fn keyword_search(
        &self,
        query: &Query,
        terms: &[String],
        top_k: usize,
    ) -> Result<SqlStatement> {
        let schema = query.table.schema();
        let text_column = schema.text_column.ok_or_else(|| {
            Error::validation(
                "keyword_search",
                self.backend,
                "content",
                format!("table '{}' has no text column", query.table.name()),
            )
        })?;
        let mut binder = Binder::new(self.dialect);
        let columns = Self::search_columns(query.table);
        let text = qualified(ALIAS, text_column);
        let cases: Vec<String> = terms
            .iter()
            .map(|term| {
                let ph = binder.bind(SqlParam::Text(format!("%{}%", escape_like(term))));
                format!("CASE WHEN lower({text}) LIKE {ph} ESCAPE '\\' THEN 1 ELSE 0 END")
            })
            .collect();
        let hits = if cases.is_empty() {
            "0".to_string()
        } else {
            cases.join(" + ")
        };
        let term_count = terms.len().max(1);
        let mut inner = format!(
            "SELECT {}, CAST(({hits}) AS DOUBLE PRECISION) / {term_count} AS {}, {} AS {} FROM {}",
            self.select_list(ALIAS, &columns),
            quote(SCORE_COLUMN),
            self.dialect.seq(ALIAS),
            quote("_order"),
            Self::from(query.table)
        );
        let clauses = self.where_clause(query, &mut binder)?;
        Self::push_where(&mut inner, &clauses);
        let outer_cols: Vec<String> = columns
            .iter()
            .map(|c| qualified("k", c.name))
            .chain(std::iter::once(qualified("k", SCORE_COLUMN)))
            .collect();
        let sql = format!(
            "SELECT {} FROM ({inner}) AS \"k\" WHERE {} > 0 ORDER BY {} DESC, {} ASC LIMIT {top_k}",
            outer_cols.join(", "),
            qualified("k", SCORE_COLUMN),
            qualified("k", SCORE_COLUMN),
            qualified("k", "_order"),
        );
        Ok(binder.finish(sql, columns, true))
    }

    fn column_type(&self, column: &Column, dimensions: usize) -> String {
        match (self.dialect, column.ty) {
            (SqlDialect::Sqlite, ColumnType::Integer | ColumnType::Boolean) => "INTEGER".into(),
            (SqlDialect::Sqlite, ColumnType::Real) => "REAL".into(),
            (SqlDialect::Sqlite, _) => "TEXT".into(),
            (SqlDialect::Postgres, ColumnType::Text) => "TEXT".into(),
            (SqlDialect::Postgres, ColumnType::Integer) => "BIGINT".into(),
            (SqlDialect::Postgres, ColumnType::Real) => "DOUBLE PRECISION".into(),
            (SqlDialect::Postgres, ColumnType::Boolean) => "BOOLEAN".into(),
            (SqlDialect::Postgres, ColumnType::Json) => "JSONB".into(),
            (SqlDialect::Postgres, ColumnType::Timestamp) => "TIMESTAMPTZ".into(),
            (SqlDialect::Postgres, ColumnType::Vector) if self.native_vectors => {
                format!("vector({dimensions})")
            },
            (SqlDialect::Postgres, ColumnType::Vector) => "JSONB".into(),
        }
    }

    fn create_table(&self, table: Table, dimensions: usize) -> String {
        let schema = table.schema();
        let mut defs: Vec<String> = schema
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", quote(c.name), self.column_type(c, dimensions));
                if c.name == ID_FIELD {
                    def.push_str(" PRIMARY KEY");
                } else if matches!(
                    c.default,
                    ColumnDefault::Required | ColumnDefault::Now | ColumnDefault::Uuid
                ) {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();
        if self.dialect == SqlDialect::Postgres {
            defs.push(format!("{} BIGSERIAL", quote(SEQ_FIELD)));
        }
        if let Some(key) = schema.unique_key {
            defs.push(format!("UNIQUE ({})", quote(key)));
        }
        for fk in schema.foreign_keys {
            defs.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE CASCADE",
                quote(fk.column),
                quote(fk.parent.name()),
                quote(ID_FIELD)
            ));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(table.name()),
            defs.join(", ")
        )
    }

    /// `match_<table>(jsonb)`: one unnamed JSON argument carrying
    /// `query_embedding`, `match_count` and `filter`, so the same call works
    /// through SQL and through a PostgREST RPC body.
    fn match_function(table: Table, dimensions: usize) -> String {
        let name = table.name();
        let query = format!("($1->>'query_embedding')::vector({dimensions})");
        format!(
            "CREATE OR REPLACE FUNCTION {func}(jsonb) \
             RETURNS TABLE (record jsonb, similarity double precision) \
             LANGUAGE sql STABLE AS $$ \
             SELECT to_jsonb(m) - '{seq}' - '{embedding}', 1 - (m.{embedding} <=> {query}) \
             FROM {table} AS m \
             WHERE m.{embedding} IS NOT NULL \
             AND to_jsonb(m) @> COALESCE($1->'filter', '{{}}'::jsonb) \
             ORDER BY m.{embedding} <=> {query}, m.{seq} \
             LIMIT COALESCE(($1->>'match_count')::integer, 10) $$",
            func = quote(&format!("match_{name}")),
            table = quote(name),
            seq = SEQ_FIELD,
            embedding = EMBEDDING_FIELD,
        )
    }

    /// Renders one schema change. Changes the backend cannot express render
    /// to nothing.
    #[must_use]
    pub fn ddl(&self, change: &SchemaChange, dimensions: usize) -> Vec<String> {
        let pg_native = self.dialect == SqlDialect::Postgres && self.native_vectors;
        match change {
            SchemaChange::EnableVectorExtension if pg_native => {
                vec!["CREATE EXTENSION IF NOT EXISTS vector".to_string()]
            },
            SchemaChange::CreateTable(table) => vec![self.create_table(*table, dimensions)],
            SchemaChange::CreateIndex { table, columns } => {
                let name = format!("idx_{}_{}", table.name(), columns.join("_"));
                let cols: Vec<String> = columns.iter().map(|c| quote(c)).collect();
                vec![format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote(&name),
                    quote(table.name()),
                    cols.join(", ")
                )]
            },
            SchemaChange::CreateVectorIndex(table) if pg_native => vec![format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} USING hnsw ({} vector_cosine_ops)",
                quote(&format!("idx_{}_embedding", table.name())),
                quote(table.name()),
                quote(EMBEDDING_FIELD)
            )],
            SchemaChange::CreateMatchFunction(table) if pg_native => {
                vec![Self::match_function(*table, dimensions)]
            },
            SchemaChange::RawSql { sqlite, postgres } => {
                let sql = match self.dialect {
                    SqlDialect::Sqlite => sqlite,
                    SqlDialect::Postgres => postgres,
                };
                if sql.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![sql.clone()]
                }
            },
            SchemaChange::EnableVectorExtension
            | SchemaChange::CreateVectorIndex(_)
            | SchemaChange::CreateMatchFunction(_) => Vec::new(),
        }
    }

    /// DDL for the migration ledger.
    #[must_use]
    pub fn ledger_ddl(&self) -> String {
        let applied_at = match self.dialect {
            SqlDialect::Sqlite => "TEXT",
            SqlDialect::Postgres => "TIMESTAMPTZ",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\"version\" TEXT PRIMARY KEY, \
             \"description\" TEXT NOT NULL, \"checksum\" TEXT NOT NULL, \
             \"applied_at\" {applied_at} NOT NULL)",
            quote(LEDGER_TABLE)
        )
    }

    /// Ledger rows ordered by version.
    #[must_use]
    pub fn ledger_select(&self) -> String {
        format!(
            "SELECT \"version\", \"description\", \"checksum\", \"applied_at\" FROM {} ORDER BY \"version\"",
            quote(LEDGER_TABLE)
        )
    }

    /// Existence check for one ledger version.
    #[must_use]
    pub fn ledger_exists(&self) -> String {
        format!(
            "SELECT COUNT(*) FROM {} WHERE \"version\" = {}",
            quote(LEDGER_TABLE),
            self.dialect.placeholder(1)
        )
    }

    /// Ledger insert with four placeholders.
    #[must_use]
    pub fn ledger_insert(&self) -> String {
        let ph: Vec<String> = (1..=4).map(|n| self.dialect.placeholder(n)).collect();
        format!(
            "INSERT INTO {} (\"version\", \"description\", \"checksum\", \"applied_at\") VALUES ({})",
            quote(LEDGER_TABLE),
            ph.join(", ")
        )
    }

    /// DDL for the failed-migration table.
    #[must_use]
    pub fn failures_ddl(&self) -> String {
        let failed_at = match self.dialect {
            SqlDialect::Sqlite => "TEXT",
            SqlDialect::Postgres => "TIMESTAMPTZ",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\"version\" TEXT PRIMARY KEY, \
             \"cause\" TEXT NOT NULL, \"failed_at\" {failed_at} NOT NULL)",
            quote(MIGRATION_FAILURES_TABLE)
        )
    }

    /// Failure rows ordered by version.
    #[must_use]
    pub fn failures_select(&self) -> String {
        format!(
            "SELECT \"version\", \"cause\", \"failed_at\" FROM {} ORDER BY \"version\"",
            quote(MIGRATION_FAILURES_TABLE)
        )
    }

    /// Records a failure, replacing any earlier one for the version.
    #[must_use]
    pub fn failures_upsert(&self) -> String {
        let ph: Vec<String> = (1..=3).map(|n| self.dialect.placeholder(n)).collect();
        format!(
            "INSERT INTO {} (\"version\", \"cause\", \"failed_at\") VALUES ({}) \
             ON CONFLICT (\"version\") DO UPDATE SET \"cause\" = excluded.\"cause\", \
             \"failed_at\" = excluded.\"failed_at\"",
            quote(MIGRATION_FAILURES_TABLE),
            ph.join(", ")
        )
    }

    /// Deletes the failure row for one version.
    #[must_use]
    pub fn failures_delete(&self) -> String {
        format!(
            "DELETE FROM {} WHERE \"version\" = {}",
            quote(MIGRATION_FAILURES_TABLE),
            self.dialect.placeholder(1)
        )
    }
}

fn json_scalar_param(value: &Value) -> SqlParam {
    match value {
        Value::String(s) => SqlParam::Text(s.clone()),
        Value::Bool(b) => SqlParam::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map_or_else(|| SqlParam::Real(n.as_f64().unwrap_or_default()), SqlParam::Integer),
        _ => SqlParam::Null(ColumnType::Json),
    }
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
