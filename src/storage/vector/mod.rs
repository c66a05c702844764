//! Vector search helpers, external indexes and the fallback layer.
//!
//! - [`cosine_similarity`] and [`rank_by_similarity`]: brute-force scoring
//!   shared by the in-memory adapter and [`InMemoryVectorIndex`]
//! - [`merge_hybrid`] and [`hybrid_search`]: keyword ∪ vector with an
//!   explicit [`HybridPolicy`]
//! - [`VectorFallback`]: wraps an adapter without native vectors and routes
//!   similarity search to an external index or to keyword matching

mod fallback;
mod index;
mod redis;

pub use fallback::{FallbackStrategy, VectorFallback};
pub use index::InMemoryVectorIndex;
pub use redis::RedisVectorIndex;

use crate::models::{
    HybridHit, HybridPolicy, HybridQuery, HybridResults, KeywordQuery, ScoredRecord, VectorQuery,
};
use crate::storage::StorageAdapter;
use crate::{Error, Result};
use std::cmp::Ordering;
use std::collections::HashMap;

/// `1 - cosine_distance`, clamped to `[0, 1]`.
///
/// Zero vectors and length mismatches score 0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

/// Scores candidates and keeps the best `top_k`.
///
/// Candidates must be in insertion order; the sort is stable, so equal
/// scores keep that order.
pub fn rank_by_similarity<T>(
    query: &[f32],
    candidates: impl IntoIterator<Item = (T, Vec<f32>)>,
    top_k: usize,
) -> Vec<(T, f32)> {
    let mut scored: Vec<(T, f32)> = candidates
        .into_iter()
        .map(|(item, embedding)| {
            let score = cosine_similarity(query, &embedding);
            (item, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(top_k);
    scored
}

/// Merges vector and keyword hits under a policy.
///
/// Records are identified by `id`. Ties keep first appearance, vector hits
/// first.
#[must_use]
pub fn merge_hybrid(
    vector: Vec<ScoredRecord>,
    keyword: Vec<ScoredRecord>,
    policy: HybridPolicy,
    top_k: usize,
) -> Vec<HybridHit> {
    let mut order: Vec<String> = Vec::new();
    let mut hits: HashMap<String, HybridHit> = HashMap::new();

    let mut absorb = |list: Vec<ScoredRecord>, is_vector: bool| {
        for (rank, scored) in list.into_iter().enumerate() {
            let Some(id) = scored.record.id().map(ToString::to_string) else {
                continue;
            };
            let contribution = match policy {
                HybridPolicy::Weighted {
                    vector_weight,
                    keyword_weight,
                } => {
                    let weight = if is_vector { vector_weight } else { keyword_weight };
                    weight * scored.score
                },
                #[allow(clippy::cast_precision_loss)]
                HybridPolicy::ReciprocalRank { k } => 1.0 / (k + rank as f32 + 1.0),
            };
            let hit = hits.entry(id.clone()).or_insert_with(|| {
                order.push(id);
                HybridHit {
                    record: scored.record.clone(),
                    score: 0.0,
                    vector_score: None,
                    keyword_score: None,
                }
            });
            hit.score += contribution;
            if is_vector {
                hit.vector_score = Some(scored.score);
            } else {
                hit.keyword_score = Some(scored.score);
            }
        }
    };
    absorb(vector, true);
    absorb(keyword, false);

    let mut merged: Vec<HybridHit> = order.into_iter().filter_map(|id| hits.remove(&id)).collect();
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    merged.truncate(top_k);
    merged
}

/// Runs a vector search and a keyword search and merges them.
///
/// Each signal fetches `2 * top_k` candidates before merging.
///
/// # Errors
///
/// Returns a validation error for an empty text, or any error from either
/// search.
pub async fn hybrid_search(adapter: &dyn StorageAdapter, query: HybridQuery) -> Result<HybridResults> {
    if query.text.trim().is_empty() {
        return Err(Error::validation(
            "hybrid_search",
            adapter.backend(),
            "text",
            "hybrid search needs query text",
        ));
    }
    let candidates = query.top_k.saturating_mul(2);
    let vector_query = VectorQuery::new(query.collection, query.embedding.clone(), candidates)
        .with_filters(query.filters.clone())
        .with_text(query.text.clone());
    let keyword_query = KeywordQuery::new(query.collection, query.text.clone(), candidates)
        .with_filters(query.filters.clone());

    let (vector, keyword) = tokio::join!(
        adapter.search_by_vector(vector_query),
        adapter.keyword_search(keyword_query)
    );
    let vector = vector?;
    let keyword = keyword?;
    tracing::debug!(
        backend = adapter.backend(),
        vector_hits = vector.len(),
        keyword_hits = keyword.len(),
        mode = ?vector.mode,
        "Merging hybrid search signals"
    );

    Ok(HybridResults {
        hits: merge_hybrid(vector.hits, keyword, query.policy, query.top_k),
        vector_mode: vector.mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;

    fn hit(id: &str, score: f32) -> ScoredRecord {
        ScoredRecord {
            record: Record::new().with("id", id),
            score,
        }
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]).abs() < 1e-6);
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).abs() < 1e-6);
    }

    #[test]
    fn test_rank_keeps_insertion_order_on_ties() {
        let ranked = rank_by_similarity(
            &[1.0, 0.0],
            vec![("a", vec![0.0, 1.0]), ("b", vec![1.0, 0.0]), ("c", vec![2.0, 0.0])],
            2,
        );
        let ids: Vec<_> = ranked.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_weighted_merge_combines_signals() {
        let merged = merge_hybrid(
            vec![hit("a", 0.9), hit("b", 0.5)],
            vec![hit("b", 1.0), hit("c", 1.0)],
            HybridPolicy::default(),
            10,
        );
        let ids: Vec<_> = merged.iter().filter_map(|h| h.record.id()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(merged[0].vector_score, Some(0.5));
        assert_eq!(merged[0].keyword_score, Some(1.0));
        assert_eq!(merged[2].vector_score, None);
    }

    #[test]
    fn test_reciprocal_rank_merge() {
        let merged = merge_hybrid(
            vec![hit("a", 0.9), hit("b", 0.8)],
            vec![hit("b", 0.5), hit("a", 0.4)],
            HybridPolicy::ReciprocalRank { k: 60.0 },
            1,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].record.id(), Some("a"));
    }
}
