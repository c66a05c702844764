//! Vector, keyword and hybrid search scenarios.
//!
//! A backend without native vectors tags its results with the fallback that
//! served them. The same query on a native backend is not degraded.
//!
//! The Redis-backed index runs only when `KSTORE_TEST_REDIS_URL` is set and
//! the crate is built with the `redis` feature.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::print_stderr)]

use knowledge_store::models::{
    EMBEDDING_FIELD, Filter, HybridPolicy, HybridQuery, KeywordQuery, Record, SearchMode, Table,
    VectorQuery, VectorRecord,
};
use knowledge_store::{ErrorKind, Repository, StoreConfig, VectorFallbackStrategy};
use std::path::Path;

const DIMS: usize = 3;

/// Seeds one source with three chunks and returns the source id.
async fn seed(repo: &Repository) -> String {
    repo.migrate().await.unwrap();
    let source = repo
        .sources()
        .create(Record::new().with("source_url", "https://docs.test"))
        .await
        .unwrap();
    let sid = source.id().unwrap().to_string();
    repo.document_chunks()
        .insert_vectors(vec![
            VectorRecord::new("rust ownership and borrowing", vec![1.0, 0.0, 0.0])
                .with("source_id", sid.as_str())
                .with("chunk_number", 0),
            VectorRecord::new("async runtimes in rust", vec![0.8, 0.6, 0.0])
                .with("source_id", sid.as_str())
                .with("chunk_number", 1),
            VectorRecord::new("gardening tips", vec![0.0, 0.0, 1.0])
                .with("source_id", sid.as_str())
                .with("chunk_number", 2),
        ])
        .await
        .unwrap();
    sid
}

fn contents(results: &[knowledge_store::models::ScoredRecord]) -> Vec<&str> {
    results.iter().filter_map(|h| h.record.get_str("content")).collect()
}

fn sqlite(path: &Path, strategy: VectorFallbackStrategy) -> Repository {
    Repository::new(StoreConfig::sqlite(path, DIMS).with_vector_fallback(strategy)).unwrap()
}

#[tokio::test]
async fn test_native_backend_is_not_degraded() {
    let repo = Repository::new(StoreConfig::in_memory(DIMS)).unwrap();
    seed(&repo).await;
    let results = repo
        .search_by_vector(VectorQuery::new(Table::DocumentChunks, vec![1.0, 0.1, 0.0], 2).with_text("rust"))
        .await
        .unwrap();
    assert_eq!(results.mode, SearchMode::Native);
    assert!(!results.is_degraded());
    assert_eq!(
        contents(&results.hits),
        vec!["rust ownership and borrowing", "async runtimes in rust"]
    );
    assert!(results.hits.iter().all(|h| !h.record.contains(EMBEDDING_FIELD)));
    assert!(results.hits[0].score >= results.hits[1].score);
}

#[tokio::test]
async fn test_keyword_degrade_is_tagged() {
    let dir = tempfile::tempdir().unwrap();
    let repo = sqlite(&dir.path().join("degrade.db"), VectorFallbackStrategy::KeywordDegrade);
    seed(&repo).await;

    let query = VectorQuery::new(Table::DocumentChunks, vec![1.0, 0.1, 0.0], 2);
    let err = repo.search_by_vector(query.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.field(), Some("query_text"));

    let results = repo.search_by_vector(query.with_text("rust")).await.unwrap();
    assert_eq!(results.mode, SearchMode::KeywordDegraded);
    assert!(results.is_degraded());
    assert_eq!(results.len(), 2);
    assert!(!contents(&results.hits).contains(&"gardening tips"));
}

#[tokio::test]
async fn test_external_index_ranks_by_similarity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("indexed.db");
    let repo = sqlite(&path, VectorFallbackStrategy::ExternalIndex);
    let sid = seed(&repo).await;

    let results = repo
        .document_chunks()
        .search(vec![0.0, 0.1, 1.0], 1, Filter::new())
        .await
        .unwrap();
    assert_eq!(results.mode, SearchMode::ExternalIndex);
    assert_eq!(contents(&results.hits), vec!["gardening tips"]);

    // Filters apply to the rows behind the index hits.
    let filtered = repo
        .document_chunks()
        .search(vec![0.0, 0.1, 1.0], 3, Filter::new().eq("chunk_number", 0))
        .await
        .unwrap();
    assert_eq!(contents(&filtered.hits), vec!["rust ownership and borrowing"]);

    // A new connection rebuilds the in-process index from stored rows.
    repo.reset();
    let rebuilt = repo
        .document_chunks()
        .search(vec![1.0, 0.0, 0.0], 1, Filter::new())
        .await
        .unwrap();
    assert_eq!(contents(&rebuilt.hits), vec!["rust ownership and borrowing"]);

    // Deleting the source removes its chunks from the index too.
    assert!(repo.delete_source(&sid).await.unwrap());
    let empty = repo
        .document_chunks()
        .search(vec![1.0, 0.0, 0.0], 3, Filter::new())
        .await
        .unwrap();
    assert!(empty.is_empty());
}

/// Ten chunks right on the query vector in one source, two further away
/// in another. Returns the distant source's id.
async fn seed_crowd(repo: &Repository) -> String {
    repo.migrate().await.unwrap();
    let crowd = repo
        .sources()
        .create(Record::new().with("source_url", "https://crowd.test"))
        .await
        .unwrap();
    let crowd_id = crowd.id().unwrap().to_string();
    let far = repo
        .sources()
        .create(Record::new().with("source_url", "https://far.test"))
        .await
        .unwrap();
    let far_id = far.id().unwrap().to_string();

    let mut chunks: Vec<VectorRecord> = (0..10)
        .map(|n| {
            VectorRecord::new(format!("crowd {n}"), vec![1.0, 0.0, 0.0])
                .with("source_id", crowd_id.as_str())
                .with("chunk_number", n)
        })
        .collect();
    chunks.push(
        VectorRecord::new("far one", vec![0.5, 0.5, 0.0])
            .with("source_id", far_id.as_str())
            .with("chunk_number", 0),
    );
    chunks.push(
        VectorRecord::new("far two", vec![0.0, 0.2, 1.0])
            .with("source_id", far_id.as_str())
            .with("chunk_number", 1),
    );
    repo.document_chunks().insert_vectors(chunks).await.unwrap();
    far_id
}

#[tokio::test]
async fn test_filtered_search_matches_native_results() {
    let dir = tempfile::tempdir().unwrap();
    let repos = [
        Repository::new(StoreConfig::in_memory(DIMS)).unwrap(),
        sqlite(&dir.path().join("crowd.db"), VectorFallbackStrategy::ExternalIndex),
    ];
    let mut outcomes = Vec::new();
    for repo in &repos {
        let far_id = seed_crowd(repo).await;
        let by_far = Filter::new().eq("source_id", far_id.as_str());
        let mut seen = Vec::new();
        for top_k in [1, 2, 5] {
            let results = repo
                .document_chunks()
                .search(vec![1.0, 0.0, 0.0], top_k, by_far.clone())
                .await
                .unwrap();
            seen.push(
                contents(&results.hits)
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
            );
        }
        outcomes.push(seen);
    }
    assert_eq!(outcomes[0][0], vec!["far one"]);
    assert_eq!(outcomes[0][1], vec!["far one", "far two"]);
    assert_eq!(outcomes[0][2], vec!["far one", "far two"]);
    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test]
async fn test_wrong_query_dimensions_rejected_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let repos = [
        Repository::new(StoreConfig::in_memory(DIMS)).unwrap(),
        sqlite(&dir.path().join("a.db"), VectorFallbackStrategy::ExternalIndex),
        sqlite(&dir.path().join("b.db"), VectorFallbackStrategy::KeywordDegrade),
    ];
    for repo in &repos {
        seed(repo).await;
        let err = repo
            .search_by_vector(VectorQuery::new(Table::CodeExamples, vec![1.0, 0.0], 3).with_text("rust"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.field(), Some("embedding"));

        let err = repo
            .search_by_vector(VectorQuery::new(Table::Projects, vec![1.0, 0.0, 0.0], 3).with_text("rust"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

#[tokio::test]
async fn test_keyword_search_scores_matched_terms() {
    let repo = Repository::new(StoreConfig::in_memory(DIMS)).unwrap();
    seed(&repo).await;
    let hits = repo
        .keyword_search(KeywordQuery::new(Table::DocumentChunks, "rust ASYNC", 5))
        .await
        .unwrap();
    assert_eq!(contents(&hits), vec!["async runtimes in rust", "rust ownership and borrowing"]);
    assert!((hits[0].score - 1.0).abs() < f32::EPSILON);
    assert!((hits[1].score - 0.5).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_hybrid_search_merges_signals() {
    let dir = tempfile::tempdir().unwrap();
    let repos = [
        Repository::new(StoreConfig::in_memory(DIMS)).unwrap(),
        sqlite(&dir.path().join("hybrid.db"), VectorFallbackStrategy::ExternalIndex),
    ];
    for repo in &repos {
        seed(repo).await;
        let query = HybridQuery::new(Table::DocumentChunks, vec![0.8, 0.6, 0.0], "async", 2);
        let weighted = repo.hybrid_search(query.clone()).await.unwrap();
        assert_eq!(weighted.hits.len(), 2);
        assert_eq!(weighted.hits[0].record.get_str("content"), Some("async runtimes in rust"));
        assert!(weighted.hits[0].vector_score.is_some());
        assert!(weighted.hits[0].keyword_score.is_some());

        let rrf = repo
            .hybrid_search(query.with_policy(HybridPolicy::ReciprocalRank { k: 60.0 }))
            .await
            .unwrap();
        assert_eq!(rrf.hits[0].record.get_str("content"), Some("async runtimes in rust"));
    }

    let err = repos[0]
        .hybrid_search(HybridQuery::new(Table::DocumentChunks, vec![1.0, 0.0, 0.0], "  ", 2))
        .await
        .unwrap_err();
    assert_eq!(err.field(), Some("text"));
}

#[tokio::test]
async fn test_redis_external_index() {
    let Ok(url) = std::env::var("KSTORE_TEST_REDIS_URL") else {
        eprintln!("Skipping test: KSTORE_TEST_REDIS_URL not set");
        return;
    };
    if !cfg!(feature = "redis") {
        eprintln!("Skipping test: built without the 'redis' feature");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut config = StoreConfig::sqlite(dir.path().join("redis.db"), DIMS)
        .with_vector_fallback(VectorFallbackStrategy::ExternalIndex);
    config.external_index_url = Some(url);
    let repo = Repository::new(config).unwrap();
    let sid = seed(&repo).await;

    let results = repo
        .document_chunks()
        .search(vec![0.0, 0.0, 1.0], 1, Filter::new().eq("source_id", sid.as_str()))
        .await
        .unwrap();
    assert_eq!(results.mode, SearchMode::ExternalIndex);
    assert_eq!(contents(&results.hits), vec!["gardening tips"]);
    assert!(repo.delete_source(&sid).await.unwrap());
}
