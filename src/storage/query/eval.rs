//! In-memory evaluation of [`Query`] values.
//!
//! Mirrors the SQL rendering: SQL null semantics for comparisons, nulls
//! sorted last, insertion order as the final tie-break.

use super::{Direction, Join, Predicate, Query};
use crate::models::{Record, Table};
use serde_json::Value;
use std::cmp::Ordering;
use std::ops::Bound;

/// Compares two scalar values the way both SQL dialects do.
///
/// Returns `None` for nulls and for values of different kinds.
#[must_use]
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL equality: null equals nothing, numbers compare numerically.
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(_), Value::Number(_)) => compare(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn field<'r>(record: &'r Record, name: &str) -> &'r Value {
    record.get(name).unwrap_or(&Value::Null)
}

fn within(value: &Value, lower: &Bound<Value>, upper: &Bound<Value>) -> bool {
    let above = match lower {
        Bound::Unbounded => true,
        Bound::Included(b) => matches!(compare(value, b), Some(Ordering::Greater | Ordering::Equal)),
        Bound::Excluded(b) => compare(value, b) == Some(Ordering::Greater),
    };
    let below = match upper {
        Bound::Unbounded => true,
        Bound::Included(b) => matches!(compare(value, b), Some(Ordering::Less | Ordering::Equal)),
        Bound::Excluded(b) => compare(value, b) == Some(Ordering::Less),
    };
    above && below && !value.is_null()
}

/// Evaluates one predicate against a record.
#[must_use]
pub fn matches(predicate: &Predicate, record: &Record) -> bool {
    if !predicate.is_constraint() {
        return true;
    }
    match predicate {
        Predicate::Equals { field: name, value } => values_equal(field(record, name), value),
        Predicate::IsNull { field: name } => field(record, name).is_null(),
        Predicate::InSet {
            field: name,
            values,
        } => {
            let stored = field(record, name);
            values.iter().any(|v| values_equal(stored, v))
        },
        Predicate::JsonPathEquals {
            field: name,
            path,
            value,
        } => {
            let mut current = field(record, name);
            for key in path {
                match current.get(key) {
                    Some(next) => current = next,
                    None => return false,
                }
            }
            values_equal(current, value)
        },
        Predicate::Range {
            field: name,
            lower,
            upper,
        } => within(field(record, name), lower, upper),
    }
}

/// Evaluates every predicate against a record.
#[must_use]
pub fn matches_all(predicates: &[Predicate], record: &Record) -> bool {
    predicates.iter().all(|p| matches(p, record))
}

fn join_matches<'a, J>(join: &Join, record: &Record, join_rows: &J) -> bool
where
    J: Fn(Table) -> Vec<&'a Record>,
{
    let local = field(record, &join.local_field);
    join_rows(join.table).into_iter().any(|other| {
        values_equal(local, field(other, &join.foreign_field))
            && matches_all(&join.predicates, other)
    })
}

fn order_rows(query: &Query, rows: &mut [(u64, &Record)]) {
    rows.sort_by(|(seq_a, a), (seq_b, b)| {
        for order in &query.order {
            let (x, y) = (field(a, &order.field), field(b, &order.field));
            let ord = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    let ord = compare(x, y).unwrap_or(Ordering::Equal);
                    match order.direction {
                        Direction::Asc => ord,
                        Direction::Desc => ord.reverse(),
                    }
                },
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        seq_a.cmp(seq_b)
    });
}

/// Runs a query over `(sequence, record)` rows.
///
/// `join_rows` returns the rows of another table for semi-joins.
pub fn select<'a, I, J>(query: &Query, rows: I, join_rows: J) -> Vec<Record>
where
    I: IntoIterator<Item = (u64, &'a Record)>,
    J: Fn(Table) -> Vec<&'a Record>,
{
    if query.is_unsatisfiable() {
        return Vec::new();
    }
    let mut matched: Vec<(u64, &Record)> = rows
        .into_iter()
        .filter(|(_, r)| matches_all(&query.predicates, r))
        .filter(|(_, r)| query.joins.iter().all(|j| join_matches(j, r, &join_rows)))
        .collect();
    order_rows(query, &mut matched);

    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(usize::MAX);
    matched
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|(_, r)| match &query.columns {
            Some(columns) => r.project(columns),
            None => r.clone(),
        })
        .collect()
}

/// Fraction of terms that occur in `text`, case-insensitively.
#[must_use]
pub fn keyword_score(text: &str, terms: &[String]) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = text.to_ascii_lowercase();
    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    #[allow(clippy::cast_precision_loss)]
    let score = hits as f32 / terms.len() as f32;
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn rows() -> Vec<(u64, Record)> {
        vec![
            (1, Record::new().with("id", "a").with("task_order", 2).with("status", "todo").with("feature", Value::Null)),
            (2, Record::new().with("id", "b").with("task_order", 1).with("status", "done").with("feature", "auth")),
            (3, Record::new().with("id", "c").with("task_order", 2).with("status", "todo").with("feature", "auth")),
        ]
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().filter_map(Record::id).collect()
    }

    fn run(query: &Query) -> Vec<Record> {
        let data = rows();
        select(query, data.iter().map(|(s, r)| (*s, r)), |_| Vec::new())
    }

    #[test_case(Predicate::equals("status", "todo"), &["a", "c"] ; "equals")]
    #[test_case(Predicate::equals("status", Value::Null), &["a", "b", "c"] ; "null equals is unconstrained")]
    #[test_case(Predicate::is_null("feature"), &["a"] ; "is null")]
    #[test_case(Predicate::in_set("status", ["done"]), &["b"] ; "in set")]
    #[test_case(Predicate::in_set::<&str>("status", []), &[] ; "empty in set")]
    #[test_case(Predicate::range("task_order", Bound::Excluded(json!(1)), Bound::Unbounded), &["a", "c"] ; "range")]
    fn test_predicates(predicate: Predicate, expected: &[&str]) {
        let result = run(&Query::table(Table::Tasks).filter(predicate));
        assert_eq!(ids(&result), expected);
    }

    #[test]
    fn test_order_ties_break_on_insertion() {
        let result = run(&Query::table(Table::Tasks).order_by("task_order", Direction::Desc));
        assert_eq!(ids(&result), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_nulls_sort_last_in_both_directions() {
        for direction in [Direction::Asc, Direction::Desc] {
            let result = run(&Query::table(Table::Tasks).order_by("feature", direction));
            assert_eq!(result.last().and_then(Record::id), Some("a"));
        }
    }

    #[test]
    fn test_limit_offset_and_projection() {
        let result = run(&Query::table(Table::Tasks).select(["status"]).offset(1).limit(1));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id(), Some("b"));
        assert!(!result[0].contains("task_order"));
    }

    #[test]
    fn test_json_path_equals() {
        let record = Record::new().with("metadata", json!({"a": {"b": 2}}));
        assert!(matches(&Predicate::json_path_equals("metadata", ["a", "b"], 2.0), &record));
        assert!(!matches(&Predicate::json_path_equals("metadata", ["a", "c"], 2), &record));
    }

    #[test]
    fn test_semi_join() {
        let projects = [
            Record::new().with("id", "p1").with("pinned", true),
            Record::new().with("id", "p2").with("pinned", false),
        ];
        let tasks = [
            (1, Record::new().with("id", "t1").with("project_id", "p1")),
            (2, Record::new().with("id", "t2").with("project_id", "p2")),
        ];
        let query = Query::table(Table::Tasks).join(
            Join::new(Table::Projects, "project_id", "id").filter(Predicate::equals("pinned", true)),
        );
        let result = select(&query, tasks.iter().map(|(s, r)| (*s, r)), |_| projects.iter().collect());
        assert_eq!(ids(&result), vec!["t1"]);
    }

    #[test]
    fn test_keyword_score() {
        let terms = vec!["rust".to_string(), "tokio".to_string()];
        assert!((keyword_score("Async Rust", &terms) - 0.5).abs() < f32::EPSILON);
        assert!((keyword_score("nothing", &terms)).abs() < f32::EPSILON);
    }
}
