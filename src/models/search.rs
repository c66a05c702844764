//! Vector and hybrid search types.

use super::record::{Filter, Record};
use super::schema::Table;
use serde::{Deserialize, Serialize};

/// A nearest-neighbour query against one vector collection.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    /// Collection to search.
    pub collection: Table,
    /// Query embedding. Must match the configured dimensionality.
    pub embedding: Vec<f32>,
    /// Maximum number of hits.
    pub top_k: usize,
    /// Equality filters applied before ranking.
    pub filters: Filter,
    /// Original query text, used by the keyword-degrade fallback.
    pub query_text: Option<String>,
}

impl VectorQuery {
    /// Creates a query with no filters and no text.
    #[must_use]
    pub fn new(collection: Table, embedding: Vec<f32>, top_k: usize) -> Self {
        Self {
            collection,
            embedding,
            top_k,
            filters: Filter::new(),
            query_text: None,
        }
    }

    /// Sets the filters.
    #[must_use]
    pub fn with_filters(mut self, filters: Filter) -> Self {
        self.filters = filters;
        self
    }

    /// Sets the query text.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.query_text = Some(text.into());
        self
    }
}

/// A term-match query over a collection's text column.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordQuery {
    /// Collection to search.
    pub collection: Table,
    /// Free text. Split on whitespace into lowercase terms.
    pub text: String,
    /// Maximum number of hits.
    pub top_k: usize,
    /// Equality filters applied before ranking.
    pub filters: Filter,
}

/// Maximum number of distinct terms considered by keyword search.
pub const MAX_KEYWORD_TERMS: usize = 16;

impl KeywordQuery {
    /// Creates a query with no filters.
    #[must_use]
    pub fn new(collection: Table, text: impl Into<String>, top_k: usize) -> Self {
        Self {
            collection,
            text: text.into(),
            top_k,
            filters: Filter::new(),
        }
    }

    /// Sets the filters.
    #[must_use]
    pub fn with_filters(mut self, filters: Filter) -> Self {
        self.filters = filters;
        self
    }

    /// Distinct lowercase terms, in first-seen order.
    #[must_use]
    pub fn terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for term in self.text.split_whitespace() {
            let term = term.to_ascii_lowercase();
            if !terms.contains(&term) {
                terms.push(term);
            }
            if terms.len() == MAX_KEYWORD_TERMS {
                break;
            }
        }
        terms
    }
}

/// How a result set was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchMode {
    /// The backend ranked by cosine similarity itself.
    Native,
    /// An external vector index ranked the ids.
    ExternalIndex,
    /// Term matching over `content` stood in for similarity.
    KeywordDegraded,
}

impl SearchMode {
    /// Returns `true` for any fallback mode.
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        !matches!(self, Self::Native)
    }
}

/// A record with its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    /// The matched row, without its embedding.
    pub record: Record,
    /// Score in `[0, 1]`, higher is closer.
    pub score: f32,
}

/// Results of a vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResults {
    /// Hits ordered by descending score, ties by insertion order.
    pub hits: Vec<ScoredRecord>,
    /// How the hits were produced.
    pub mode: SearchMode,
}

impl SearchResults {
    /// Creates a result set.
    #[must_use]
    pub const fn new(hits: Vec<ScoredRecord>, mode: SearchMode) -> Self {
        Self { hits, mode }
    }

    /// Returns `true` if a fallback produced these results.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.mode.is_degraded()
    }

    /// Number of hits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Returns `true` if nothing matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Merge policy for hybrid search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HybridPolicy {
    /// `vector_weight * vector_score + keyword_weight * keyword_score`.
    Weighted {
        /// Weight of the vector signal.
        vector_weight: f32,
        /// Weight of the keyword signal.
        keyword_weight: f32,
    },
    /// Reciprocal rank fusion: `sum(1 / (k + rank))`.
    ReciprocalRank {
        /// Smoothing constant, usually 60.
        k: f32,
    },
}

impl Default for HybridPolicy {
    fn default() -> Self {
        Self::Weighted {
            vector_weight: 0.7,
            keyword_weight: 0.3,
        }
    }
}

/// A keyword-plus-vector query.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridQuery {
    /// Collection to search.
    pub collection: Table,
    /// Query embedding.
    pub embedding: Vec<f32>,
    /// Query text for the keyword signal.
    pub text: String,
    /// Maximum number of hits.
    pub top_k: usize,
    /// Equality filters applied to both signals.
    pub filters: Filter,
    /// How the two signals are merged.
    pub policy: HybridPolicy,
}

impl HybridQuery {
    /// Creates a query with the default weighted policy.
    #[must_use]
    pub fn new(
        collection: Table,
        embedding: Vec<f32>,
        text: impl Into<String>,
        top_k: usize,
    ) -> Self {
        Self {
            collection,
            embedding,
            text: text.into(),
            top_k,
            filters: Filter::new(),
            policy: HybridPolicy::default(),
        }
    }

    /// Sets the merge policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: HybridPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the filters.
    #[must_use]
    pub fn with_filters(mut self, filters: Filter) -> Self {
        self.filters = filters;
        self
    }
}

/// One merged hybrid hit.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridHit {
    /// The matched row.
    pub record: Record,
    /// Combined score under the query's policy.
    pub score: f32,
    /// Vector score, if the vector signal matched.
    pub vector_score: Option<f32>,
    /// Keyword score, if the keyword signal matched.
    pub keyword_score: Option<f32>,
}

/// Results of a hybrid search.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridResults {
    /// Hits ordered by descending combined score.
    pub hits: Vec<HybridHit>,
    /// Mode of the vector signal.
    pub vector_mode: SearchMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_terms_dedup_and_lowercase() {
        let query = KeywordQuery::new(Table::DocumentChunks, "Rust  async rust TOKIO", 5);
        assert_eq!(query.terms(), vec!["rust", "async", "tokio"]);
    }

    #[test]
    fn test_keyword_query_equality_covers_float_filters() {
        let mut a = KeywordQuery::new(Table::DocumentChunks, "rust", 5);
        a.filters = Filter::new().eq("score", 0.5);
        let mut b = a.clone();
        assert_eq!(a, b);
        b.filters = Filter::new().eq("score", 0.25);
        assert_ne!(a, b);
    }

    #[test]
    fn test_degraded_modes() {
        assert!(!SearchMode::Native.is_degraded());
        assert!(SearchMode::ExternalIndex.is_degraded());
        assert!(SearchMode::KeywordDegraded.is_degraded());
    }
}
