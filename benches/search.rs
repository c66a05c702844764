//! Benchmarks for search operations.
//!
//! Benchmark targets:
//! - Native similarity search over 1,000 chunks: <5ms
//! - Hybrid merge of 2 x 100 hits: <1ms
//!
//! Covers the in-memory adapter's native search, the in-process index
//! behind the fallback layer, and the hybrid merge.

// Criterion macros generate items without docs - this is expected for benchmarks
// Benchmarks use expect/unwrap for simplicity - panics are acceptable in benchmarks
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::cast_precision_loss)]

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use knowledge_store::models::{
    Filter, HybridPolicy, Record, ScoredRecord, Table, VectorQuery, VectorRecord,
};
use knowledge_store::storage::traits::VectorIndex;
use knowledge_store::storage::vector::merge_hybrid;
use knowledge_store::storage::InMemoryVectorIndex;
use knowledge_store::{Repository, StoreConfig};
use std::hint::black_box;
use tokio::runtime::Runtime;

const DIMS: usize = 64;

// ============================================================================
// Helper Functions
// ============================================================================

/// Deterministic pseudo-embedding for item `n`.
fn embedding(n: usize) -> Vec<f32> {
    (0..DIMS).map(|i| ((n * 31 + i * 7) % 97) as f32 / 97.0).collect()
}

/// Creates a migrated in-memory store holding `count` chunks.
fn seeded_repo(rt: &Runtime, count: usize) -> Repository {
    rt.block_on(async {
        let repo = Repository::new(StoreConfig::in_memory(DIMS)).unwrap();
        repo.migrate().await.unwrap();
        let source = repo
            .sources()
            .create(Record::new().with("source_url", "https://bench.test"))
            .await
            .unwrap();
        let sid = source.id().unwrap().to_string();
        let chunks = (0..count)
            .map(|n| {
                VectorRecord::new(format!("chunk {n} about topic {}", n % 10), embedding(n))
                    .with("source_id", sid.as_str())
                    .with("chunk_number", n)
            })
            .collect();
        repo.document_chunks().insert_vectors(chunks).await.unwrap();
        repo
    })
}

fn hits(prefix: &str, count: usize) -> Vec<ScoredRecord> {
    (0..count)
        .map(|n| ScoredRecord {
            record: Record::new().with("id", format!("{prefix}{}", n % (count / 2 + 1))),
            score: 1.0 - n as f32 / count as f32,
        })
        .collect()
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_native_search(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("native_vector_search");
    for count in [100, 1_000] {
        let repo = seeded_repo(&rt, count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.to_async(&rt).iter(|| async {
                let query = VectorQuery::new(Table::DocumentChunks, embedding(7), 10);
                black_box(repo.search_by_vector(query).await.unwrap())
            });
        });
    }
    group.finish();
}

fn bench_index_search(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let index = InMemoryVectorIndex::new(DIMS);
    rt.block_on(async {
        for n in 0..1_000 {
            index
                .upsert(Table::DocumentChunks, &format!("id-{n}"), &embedding(n))
                .await
                .unwrap();
        }
    });
    c.bench_function("in_process_index_search_1000", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                index
                    .search(Table::DocumentChunks, &embedding(3), 10)
                    .await
                    .unwrap(),
            )
        });
    });
}

fn bench_hybrid_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("hybrid_merge");
    let policies = [
        ("weighted", HybridPolicy::default()),
        ("rrf", HybridPolicy::ReciprocalRank { k: 60.0 }),
    ];
    for (name, policy) in policies {
        group.bench_function(name, |b| {
            b.iter(|| black_box(merge_hybrid(hits("v", 100), hits("k", 100), policy, 10)));
        });
    }
    group.finish();
}

fn bench_filtered_list(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let repo = seeded_repo(&rt, 1_000);
    c.bench_function("filtered_list_1000", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                repo.document_chunks()
                    .list_where(&Filter::new().eq("chunk_number", 500))
                    .await
                    .unwrap(),
            )
        });
    });
}

criterion_group!(
    benches,
    bench_native_search,
    bench_index_search,
    bench_hybrid_merge,
    bench_filtered_list
);
criterion_main!(benches);
