//! Units of work: ordered writes applied in one transaction.

use super::record::Record;
use super::schema::Table;
use crate::Error;

/// One write inside a [`UnitOfWork`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a row.
    Create {
        /// Target table.
        table: Table,
        /// Row to insert.
        record: Record,
    },
    /// Merge a patch into a row.
    Update {
        /// Target table.
        table: Table,
        /// Row id.
        id: String,
        /// Fields to overwrite.
        patch: Record,
    },
    /// Delete a row and its dependents.
    Delete {
        /// Target table.
        table: Table,
        /// Row id.
        id: String,
    },
    /// Insert or update by the table's conflict key.
    Upsert {
        /// Target table.
        table: Table,
        /// Row to write.
        record: Record,
    },
    /// A nested group under a savepoint.
    ///
    /// If any write in the group fails, the group is rolled back and the
    /// enclosing unit continues.
    Savepoint(Vec<WriteOp>),
}

/// Outcome of one [`WriteOp`], in the same position as the op.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The inserted row.
    Created(Record),
    /// The updated row, or `None` if the id did not exist.
    Updated(Option<Record>),
    /// Whether a row was deleted.
    Deleted(bool),
    /// The row after the upsert.
    Upserted(Record),
    /// Outcomes of a savepoint group that committed.
    Group(Vec<WriteOutcome>),
    /// A savepoint group that failed and was rolled back.
    RolledBack(Box<Error>),
}

/// An ordered list of writes.
///
/// Statement order is preserved exactly. On transactional backends the whole
/// unit commits or nothing does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOfWork {
    ops: Vec<WriteOp>,
}

impl UnitOfWork {
    /// Creates an empty unit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an insert.
    #[must_use]
    pub fn create(mut self, table: Table, record: Record) -> Self {
        self.ops.push(WriteOp::Create { table, record });
        self
    }

    /// Appends an update.
    #[must_use]
    pub fn update(mut self, table: Table, id: impl Into<String>, patch: Record) -> Self {
        self.ops.push(WriteOp::Update {
            table,
            id: id.into(),
            patch,
        });
        self
    }

    /// Appends a delete.
    #[must_use]
    pub fn delete(mut self, table: Table, id: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete {
            table,
            id: id.into(),
        });
        self
    }

    /// Appends an upsert.
    #[must_use]
    pub fn upsert(mut self, table: Table, record: Record) -> Self {
        self.ops.push(WriteOp::Upsert { table, record });
        self
    }

    /// Appends a savepoint group.
    #[must_use]
    pub fn savepoint(mut self, group: Self) -> Self {
        self.ops.push(WriteOp::Savepoint(group.ops));
        self
    }

    /// The writes, in order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consumes the unit, returning its writes.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Number of top-level writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if the unit has no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_preserves_order() {
        let unit = UnitOfWork::new()
            .create(Table::Projects, Record::new().with("title", "p"))
            .savepoint(UnitOfWork::new().delete(Table::Tasks, "t1"))
            .update(Table::Projects, "p1", Record::new().with("pinned", true));

        assert_eq!(unit.len(), 3);
        assert!(matches!(unit.ops()[0], WriteOp::Create { .. }));
        assert!(matches!(&unit.ops()[1], WriteOp::Savepoint(group) if group.len() == 1));
        assert!(matches!(unit.ops()[2], WriteOp::Update { .. }));
    }
}
