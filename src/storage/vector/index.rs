//! Brute-force in-process vector index.

use super::rank_by_similarity;
use crate::models::{EMBEDDING_FIELD, Table};
use crate::storage::pool::acquire_lock;
use crate::storage::traits::VectorIndex;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

type Entries = Vec<(String, Vec<f32>)>;

/// An external index kept in memory.
///
/// Entries keep insertion order so equal scores rank stably. Suitable for
/// tests and small local stores; contents are lost on restart and rebuilt
/// from the database by the fallback layer.
#[derive(Debug)]
pub struct InMemoryVectorIndex {
    dimensions: usize,
    entries: Mutex<HashMap<Table, Entries>>,
}

impl InMemoryVectorIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, operation: &str, embedding: &[f32]) -> Result<()> {
        if embedding.len() == self.dimensions {
            Ok(())
        } else {
            Err(Error::validation(
                operation,
                self.name(),
                EMBEDDING_FIELD,
                format!(
                    "expected {} dimensions, got {}",
                    self.dimensions,
                    embedding.len()
                ),
            ))
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn name(&self) -> &'static str {
        "in-memory-index"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn upsert(&self, collection: Table, id: &str, embedding: &[f32]) -> Result<()> {
        self.check("index_upsert", embedding)?;
        let mut entries = acquire_lock(&self.entries);
        let list = entries.entry(collection).or_default();
        match list.iter_mut().find(|(existing, _)| existing == id) {
            Some((_, stored)) => *stored = embedding.to_vec(),
            None => list.push((id.to_string(), embedding.to_vec())),
        }
        Ok(())
    }

    async fn remove(&self, collection: Table, id: &str) -> Result<bool> {
        let mut entries = acquire_lock(&self.entries);
        let Some(list) = entries.get_mut(&collection) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|(existing, _)| existing != id);
        Ok(list.len() != before)
    }

    async fn search(
        &self,
        collection: Table,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        self.check("index_search", embedding)?;
        let entries = acquire_lock(&self.entries);
        let candidates = entries
            .get(&collection)
            .into_iter()
            .flatten()
            .map(|(id, stored)| (id.clone(), stored.clone()));
        Ok(rank_by_similarity(embedding, candidates, limit))
    }

    async fn count(&self, collection: Table) -> Result<usize> {
        Ok(acquire_lock(&self.entries).get(&collection).map_or(0, Vec::len))
    }

    async fn clear(&self, collection: Table) -> Result<()> {
        acquire_lock(&self.entries).remove(&collection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let index = InMemoryVectorIndex::new(2);
        index.upsert(Table::DocumentChunks, "a", &[1.0, 0.0]).await.unwrap();
        index.upsert(Table::DocumentChunks, "b", &[0.0, 1.0]).await.unwrap();
        index.upsert(Table::DocumentChunks, "a", &[0.0, 1.0]).await.unwrap();
        assert_eq!(index.count(Table::DocumentChunks).await.unwrap(), 2);

        let hits = index.search(Table::DocumentChunks, &[0.0, 1.0], 5).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_collections_are_separate() {
        let index = InMemoryVectorIndex::new(2);
        index.upsert(Table::DocumentChunks, "a", &[1.0, 0.0]).await.unwrap();
        assert!(index.search(Table::CodeExamples, &[1.0, 0.0], 5).await.unwrap().is_empty());
        assert!(!index.remove(Table::CodeExamples, "a").await.unwrap());
        assert!(index.remove(Table::DocumentChunks, "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_validation() {
        let index = InMemoryVectorIndex::new(2);
        let err = index.upsert(Table::DocumentChunks, "a", &[1.0]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
