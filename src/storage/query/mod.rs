//! Portable query descriptions.
//!
//! A [`Query`] is built from a closed set of predicates and rendered either
//! to parameterized SQL ([`SqlBuilder`]) or evaluated directly over
//! in-memory records ([`eval`]). Callers never supply backend syntax.
//!
//! ```rust,ignore
//! let query = Query::table(Table::Tasks)
//!     .filter(Predicate::equals("project_id", "p1"))
//!     .filter(Predicate::in_set("status", ["todo", "doing"]))
//!     .order_by("task_order", Direction::Asc)
//!     .limit(50);
//! ```

pub mod eval;
mod sql;

pub use sql::{
    SCORE_COLUMN, SqlBuilder, SqlDialect, SqlParam, SqlStatement, format_vector, parse_vector, quote,
};

use crate::models::schema::normalize_timestamp;
use crate::models::{ColumnType, Filter, Table};
use crate::{Error, Result};
use serde_json::Value;
use std::ops::Bound;

/// A portable predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `field = value`. A `null` value means no constraint.
    Equals {
        /// Column name.
        field: String,
        /// Value to match.
        value: Value,
    },
    /// `field IS NULL`.
    IsNull {
        /// Column name.
        field: String,
    },
    /// `field IN (values)`. An empty set matches nothing.
    InSet {
        /// Column name.
        field: String,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// Equality on a value nested inside a JSON column.
    JsonPathEquals {
        /// JSON column name.
        field: String,
        /// Object keys from the root of the document.
        path: Vec<String>,
        /// Value to match.
        value: Value,
    },
    /// Bounded comparison.
    Range {
        /// Column name.
        field: String,
        /// Lower bound.
        lower: Bound<Value>,
        /// Upper bound.
        upper: Bound<Value>,
    },
}

impl Predicate {
    /// Builds an equality predicate.
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Builds an explicit null check.
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull {
            field: field.into(),
        }
    }

    /// Builds a set-membership predicate.
    pub fn in_set<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::InSet {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds a JSON path equality predicate.
    pub fn json_path_equals<S: Into<String>>(
        field: impl Into<String>,
        path: impl IntoIterator<Item = S>,
        value: impl Into<Value>,
    ) -> Self {
        Self::JsonPathEquals {
            field: field.into(),
            path: path.into_iter().map(Into::into).collect(),
            value: value.into(),
        }
    }

    /// Builds a range predicate.
    pub fn range(field: impl Into<String>, lower: Bound<Value>, upper: Bound<Value>) -> Self {
        Self::Range {
            field: field.into(),
            lower,
            upper,
        }
    }

    /// The column this predicate constrains.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Equals { field, .. }
            | Self::IsNull { field }
            | Self::InSet { field, .. }
            | Self::JsonPathEquals { field, .. }
            | Self::Range { field, .. } => field,
        }
    }

    /// Returns `false` for predicates that constrain nothing.
    #[must_use]
    pub fn is_constraint(&self) -> bool {
        match self {
            Self::Equals { value, .. } | Self::JsonPathEquals { value, .. } => !value.is_null(),
            Self::Range { lower, upper, .. } => {
                !matches!((lower, upper), (Bound::Unbounded, Bound::Unbounded))
            },
            Self::IsNull { .. } | Self::InSet { .. } => true,
        }
    }

    /// Validates the predicate against a table and normalizes its values.
    fn check(self, table: Table, backend: &'static str) -> Result<Self> {
        let column = table
            .schema()
            .require_column(self.field(), "query", backend)?;
        let fail = |message: &str| Error::validation("query", backend, column.name, message);
        let scalar = |value: Value| -> Result<Value> {
            if value.is_null() {
                return Ok(value);
            }
            let ok = match column.ty {
                ColumnType::Text => value.is_string(),
                ColumnType::Integer => value.is_i64(),
                ColumnType::Real => value.is_number(),
                ColumnType::Boolean => value.is_boolean(),
                ColumnType::Timestamp => {
                    return value
                        .as_str()
                        .and_then(normalize_timestamp)
                        .map(Value::String)
                        .ok_or_else(|| fail("expected an RFC 3339 timestamp"));
                },
                ColumnType::Json | ColumnType::Vector => {
                    return Err(fail("use a json path predicate to compare documents"));
                },
            };
            if ok {
                Ok(value)
            } else {
                Err(fail(&format!("expected a {:?} value", column.ty)))
            }
        };
        let bound = |b: Bound<Value>| -> Result<Bound<Value>> {
            Ok(match b {
                Bound::Included(v) => Bound::Included(scalar(v)?),
                Bound::Excluded(v) => Bound::Excluded(scalar(v)?),
                Bound::Unbounded => Bound::Unbounded,
            })
        };

        Ok(match self {
            Self::JsonPathEquals { field, path, value } => {
                if column.ty != ColumnType::Json {
                    return Err(fail("json path predicates need a JSON column"));
                }
                if path.is_empty() {
                    return Err(fail("json path must not be empty"));
                }
                if value.is_array() || value.is_object() {
                    return Err(fail("json path predicates compare scalar values"));
                }
                Self::JsonPathEquals { field, path, value }
            },
            Self::Equals { field, value } => Self::Equals {
                field,
                value: scalar(value)?,
            },
            Self::InSet { field, values } => Self::InSet {
                field,
                values: values
                    .into_iter()
                    .map(&scalar)
                    .collect::<Result<Vec<_>>>()?,
            },
            Self::Range {
                field,
                lower,
                upper,
            } => Self::Range {
                field,
                lower: bound(lower)?,
                upper: bound(upper)?,
            },
            Self::IsNull { field } => Self::IsNull { field },
        })
    }
}

/// Sort direction. Nulls always sort last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// One ordering term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Column name.
    pub field: String,
    /// Direction.
    pub direction: Direction,
}

/// A semi-join: keep rows for which a matching row exists in another table.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// The other table.
    pub table: Table,
    /// Column on the queried table.
    pub local_field: String,
    /// Column on the other table.
    pub foreign_field: String,
    /// Predicates on the other table.
    pub predicates: Vec<Predicate>,
}

impl Join {
    /// Creates a join with no predicates.
    pub fn new(
        table: Table,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
    ) -> Self {
        Self {
            table,
            local_field: local_field.into(),
            foreign_field: foreign_field.into(),
            predicates: Vec::new(),
        }
    }

    /// Adds a predicate on the joined table.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }
}

/// A backend-agnostic query over one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Queried table.
    pub table: Table,
    /// Projection. `None` selects every column.
    pub columns: Option<Vec<String>>,
    /// Conjunctive predicates.
    pub predicates: Vec<Predicate>,
    /// Semi-joins.
    pub joins: Vec<Join>,
    /// Explicit ordering, applied before insertion order.
    pub order: Vec<Order>,
    /// Maximum rows.
    pub limit: Option<usize>,
    /// Rows to skip.
    pub offset: Option<usize>,
}

impl Query {
    /// Starts a query over a table.
    #[must_use]
    pub const fn table(table: Table) -> Self {
        Self {
            table,
            columns: None,
            predicates: Vec::new(),
            joins: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Restricts the returned columns. `id` is always returned.
    #[must_use]
    pub fn select<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a predicate.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Adds an equality predicate per filter entry.
    #[must_use]
    pub fn filter_by(mut self, filter: &Filter) -> Self {
        self.predicates.extend(
            filter
                .iter()
                .map(|(field, value)| Predicate::equals(field.clone(), value.clone())),
        );
        self
    }

    /// Adds a semi-join.
    #[must_use]
    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// Adds an ordering term.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order.push(Order {
            field: field.into(),
            direction,
        });
        self
    }

    /// Sets the row limit.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the row offset.
    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Checks every referenced field against the schema and normalizes
    /// predicate values (timestamps to UTC).
    pub fn checked(mut self, backend: &'static str) -> Result<Self> {
        let schema = self.table.schema();
        if let Some(columns) = &self.columns {
            for column in columns {
                schema.require_column(column, "query", backend)?;
            }
        }
        self.predicates = std::mem::take(&mut self.predicates)
            .into_iter()
            .map(|p| p.check(self.table, backend))
            .collect::<Result<_>>()?;
        for order in &self.order {
            let column = schema.require_column(&order.field, "query", backend)?;
            if matches!(column.ty, ColumnType::Json | ColumnType::Vector) {
                return Err(Error::validation(
                    "query",
                    backend,
                    &order.field,
                    "cannot order by a JSON or embedding column",
                ));
            }
        }
        for join in &mut self.joins {
            schema.require_column(&join.local_field, "query", backend)?;
            join.table
                .schema()
                .require_column(&join.foreign_field, "query", backend)?;
            let table = join.table;
            join.predicates = std::mem::take(&mut join.predicates)
                .into_iter()
                .map(|p| p.check(table, backend))
                .collect::<Result<_>>()?;
        }
        Ok(self)
    }

    /// Predicates that actually constrain rows.
    pub fn constraints(&self) -> impl Iterator<Item = &Predicate> {
        self.predicates.iter().filter(|p| p.is_constraint())
    }

    /// Returns `true` if some predicate can never match (an empty `InSet`).
    #[must_use]
    pub fn is_unsatisfiable(&self) -> bool {
        self.predicates
            .iter()
            .any(|p| matches!(p, Predicate::InSet { values, .. } if values.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_null_equality_is_not_a_constraint() {
        let query = Query::table(Table::Tasks)
            .filter(Predicate::equals("status", Value::Null))
            .filter(Predicate::is_null("feature"));
        let constraints: Vec<_> = query.constraints().collect();
        assert_eq!(constraints, vec![&Predicate::is_null("feature")]);
    }

    #[test]
    fn test_validate_rejects_unknown_fields() {
        let err = Query::table(Table::Tasks)
            .filter(Predicate::equals("colour", "red"))
            .checked("test")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.field(), Some("colour"));

        let err = Query::table(Table::Tasks)
            .join(Join::new(Table::Projects, "project_id", "nope"))
            .checked("test")
            .unwrap_err();
        assert_eq!(err.field(), Some("nope"));
    }

    #[test]
    fn test_json_path_needs_json_column() {
        let err = Query::table(Table::Tasks)
            .filter(Predicate::json_path_equals("title", ["a"], json!(1)))
            .checked("test")
            .unwrap_err();
        assert_eq!(err.field(), Some("title"));

        Query::table(Table::Sources)
            .filter(Predicate::json_path_equals("metadata", ["knowledge_type"], "technical"))
            .checked("test")
            .unwrap();
    }

    #[test]
    fn test_checked_normalizes_timestamps_and_types() {
        let query = Query::table(Table::Tasks)
            .filter(Predicate::range(
                "created_at",
                Bound::Included(json!("2024-01-01T02:00:00+02:00")),
                Bound::Unbounded,
            ))
            .checked("test")
            .unwrap();
        assert_eq!(
            query.predicates[0],
            Predicate::range(
                "created_at",
                Bound::Included(json!("2024-01-01T00:00:00.000000Z")),
                Bound::Unbounded,
            )
        );

        let err = Query::table(Table::Tasks)
            .filter(Predicate::equals("task_order", "first"))
            .checked("test")
            .unwrap_err();
        assert_eq!(err.field(), Some("task_order"));
    }

    #[test]
    fn test_empty_in_set_is_unsatisfiable() {
        let query = Query::table(Table::Tasks).filter(Predicate::in_set::<&str>("status", []));
        assert!(query.is_unsatisfiable());
    }
}
