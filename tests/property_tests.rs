//! Property-based tests for the data access layer.
//!
//! Uses proptest to check invariants across random inputs:
//! - Updates merge into stored rows and never drop omitted fields
//! - Settings upsert is idempotent
//! - Single-row misses are absent values and empty filters give empty lists
//! - Similarity and keyword scores stay in range
//! - Backend names parse case-insensitively

// Property tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use knowledge_store::models::{Filter, Record, Table, merge_record};
use knowledge_store::storage::query::eval::keyword_score;
use knowledge_store::storage::vector::cosine_similarity;
use knowledge_store::storage::{InMemoryAdapter, MigrationTracker, StorageAdapter};
use knowledge_store::BackendKind;
use proptest::prelude::*;
use serde_json::{Map, Value, json};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn migrated() -> InMemoryAdapter {
    let adapter = InMemoryAdapter::new(3);
    MigrationTracker::builtin(3).unwrap().run(&adapter).await.unwrap();
    adapter
}

fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,12}".prop_map(Value::from),
    ]
}

fn json_object() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-e]", json_scalar(), 0..5)
        .prop_map(|m| m.into_iter().collect())
}

proptest! {
    /// Property: fields absent from a patch keep their stored value.
    #[test]
    fn prop_merge_keeps_omitted_fields(stored in json_object(), patch in json_object()) {
        let stored = Record::from(stored);
        let patch = Record::from(patch);
        let merged = merge_record(&stored, &patch);
        for (field, value) in stored.iter() {
            if !patch.contains(field) {
                prop_assert_eq!(merged.get(field), Some(value));
            }
        }
        for (field, value) in patch.iter() {
            prop_assert_eq!(merged.get(field), Some(value));
        }
    }

    /// Property: a nested object patch merges top-level keys.
    #[test]
    fn prop_merge_nested_object(base in json_object(), delta in json_object()) {
        let stored = Record::new().with("metadata", Value::Object(base.clone()));
        let patch = Record::new().with("metadata", Value::Object(delta.clone()));
        let merged = merge_record(&stored, &patch);
        let metadata = merged.get("metadata").and_then(Value::as_object).unwrap();
        for (key, value) in &base {
            let expected = delta.get(key).unwrap_or(value);
            prop_assert_eq!(metadata.get(key), Some(expected));
        }
        prop_assert_eq!(metadata.len(), base.keys().chain(delta.keys()).collect::<std::collections::HashSet<_>>().len());
    }

    /// Property: merging a patch twice is the same as merging it once.
    #[test]
    fn prop_merge_is_idempotent(stored in json_object(), patch in json_object()) {
        let stored = Record::from(stored);
        let patch = Record::from(patch);
        let once = merge_record(&stored, &patch);
        prop_assert_eq!(merge_record(&once, &patch), once);
    }

    /// Property: cosine similarity is symmetric and clamped to [0, 1].
    #[test]
    fn prop_cosine_similarity_in_range(
        a in prop::collection::vec(-100.0f32..100.0, 1..16),
        b in prop::collection::vec(-100.0f32..100.0, 1..16),
    ) {
        let score = cosine_similarity(&a, &b);
        prop_assert!((0.0..=1.0).contains(&score));
        prop_assert!((score - cosine_similarity(&b, &a)).abs() < 1e-6);
    }

    /// Property: keyword scores are fractions of matched terms.
    #[test]
    fn prop_keyword_score_in_range(text in ".{0,64}", terms in prop::collection::vec("[a-z]{1,6}", 0..6)) {
        let score = keyword_score(&text, &terms);
        prop_assert!((0.0..=1.0).contains(&score));
        if terms.is_empty() {
            prop_assert_eq!(score, 0.0);
        }
    }

    /// Property: backend names parse regardless of case and padding.
    #[test]
    fn prop_backend_parse_ignores_case(index in 0..BackendKind::ALL.len(), upper in any::<bool>()) {
        let kind = BackendKind::ALL[index];
        let name = if upper { kind.as_str().to_ascii_uppercase() } else { kind.as_str().to_string() };
        prop_assert_eq!(BackendKind::parse(&format!("  {name} ")).unwrap(), kind);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: `upsert(k, v)` twice leaves the state `upsert(k, v)` once leaves.
    #[test]
    fn prop_settings_upsert_idempotent(key in "[a-z][a-z0-9_.]{0,20}", value in "[ -~]{0,40}") {
        runtime().block_on(async {
            let adapter = migrated().await;
            let record = Record::new().with("key", key.as_str()).with("value", value.as_str());
            let first = adapter.upsert(Table::Settings, record.clone()).await.unwrap();
            let after_once = adapter.list(knowledge_store::storage::Query::table(Table::Settings)).await.unwrap();
            let second = adapter.upsert(Table::Settings, record).await.unwrap();
            let after_twice = adapter.list(knowledge_store::storage::Query::table(Table::Settings)).await.unwrap();
            assert_eq!(first, second);
            assert_eq!(after_once, after_twice);
            assert_eq!(after_twice.len(), 1);
        });
    }

    /// Property: misses are absent values and unmatched filters are empty lists.
    #[test]
    fn prop_absent_vs_empty(id in "[a-zA-Z0-9-]{1,36}", status in "[a-z]{1,10}") {
        runtime().block_on(async {
            let adapter = migrated().await;
            for table in Table::ALL {
                assert_eq!(adapter.get(table, &id).await.unwrap(), None);
            }
            let query = knowledge_store::storage::Query::table(Table::Tasks)
                .filter_by(&Filter::new().eq("status", status.as_str()));
            assert!(adapter.list(query).await.unwrap().is_empty());
            assert_eq!(
                adapter.update(Table::Projects, &id, Record::new().with("title", json!("x"))).await.unwrap(),
                None
            );
            assert!(!adapter.delete(Table::Projects, &id).await.unwrap());
        });
    }
}
