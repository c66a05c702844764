//! `RediSearch` external vector index.
//!
//! Requires Redis Stack (or Redis with the `RediSearch` 2.4+ module). Each
//! collection gets its own HNSW index over hashes keyed
//! `<prefix>:<collection>:<record id>`.
//!
//! Scores are `1 - cosine distance`, clamped to `[0, 1]`. Equal scores come
//! back in the order Redis returns them, which is not insertion order.

use crate::models::Table;
#[cfg(feature = "redis")]
use crate::models::EMBEDDING_FIELD;
use crate::storage::traits::VectorIndex;
use crate::{Error, Result};
use async_trait::async_trait;
#[cfg(feature = "redis")]
use crate::storage::pool::acquire_lock;
#[cfg(feature = "redis")]
use redis::aio::ConnectionManager;
#[cfg(feature = "redis")]
use std::collections::HashSet;
#[cfg(feature = "redis")]
use std::sync::Mutex;
#[cfg(feature = "redis")]
use tokio::sync::OnceCell;

const BACKEND: &str = "redis-index";

/// Redis-backed [`VectorIndex`].
pub struct RedisVectorIndex {
    url: String,
    prefix: String,
    dimensions: usize,
    #[cfg(feature = "redis")]
    client: redis::Client,
    #[cfg(feature = "redis")]
    connection: OnceCell<ConnectionManager>,
    #[cfg(feature = "redis")]
    created: Mutex<HashSet<Table>>,
}

impl std::fmt::Debug for RedisVectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisVectorIndex")
            .field("prefix", &self.prefix)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl RedisVectorIndex {
    /// Opens a client. No connection is made until first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a malformed URL, or if the
    /// `redis` feature is not compiled in.
    pub fn new(url: impl Into<String>, prefix: impl Into<String>, dimensions: usize) -> Result<Self> {
        let url = url.into();
        #[cfg(feature = "redis")]
        {
            let client = redis::Client::open(url.as_str())
                .map_err(|e| Error::Configuration(format!("invalid redis url: {e}")))?;
            Ok(Self {
                url,
                prefix: prefix.into(),
                dimensions,
                client,
                connection: OnceCell::new(),
                created: Mutex::new(HashSet::new()),
            })
        }
        #[cfg(not(feature = "redis"))]
        {
            let _prefix: String = prefix.into();
            let _ = dimensions;
            Err(Error::Configuration(format!(
                "external index '{url}' requires the 'redis' feature"
            )))
        }
    }

    /// The configured URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn index_name(&self, collection: Table) -> String {
        format!("{}:{}", self.prefix, collection.name())
    }

    fn key(&self, collection: Table, id: &str) -> String {
        format!("{}:{}:{id}", self.prefix, collection.name())
    }
}

#[cfg(feature = "redis")]
impl RedisVectorIndex {
    async fn conn(&self) -> Result<ConnectionManager> {
        self.connection
            .get_or_try_init(|| async {
                self.client
                    .get_connection_manager()
                    .await
                    .map_err(|e| Error::connectivity("redis_connect", BACKEND, e))
            })
            .await
            .cloned()
    }

    fn map_err(operation: &'static str, e: &redis::RedisError) -> Error {
        if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
            Error::connectivity(operation, BACKEND, e)
        } else {
            Error::backend(operation, BACKEND, e)
        }
    }

    fn check(&self, operation: &str, embedding: &[f32]) -> Result<()> {
        if embedding.len() == self.dimensions {
            return Ok(());
        }
        Err(Error::validation(
            operation,
            BACKEND,
            EMBEDDING_FIELD,
            format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                embedding.len()
            ),
        ))
    }

    fn vector_to_bytes(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    async fn ensure_index(&self, conn: &mut ConnectionManager, collection: Table) -> Result<()> {
        if acquire_lock(&self.created).contains(&collection) {
            return Ok(());
        }
        let name = self.index_name(collection);
        let created: redis::RedisResult<()> = redis::cmd("FT.CREATE")
            .arg(&name)
            .arg("ON")
            .arg("HASH")
            .arg("PREFIX")
            .arg("1")
            .arg(format!("{name}:"))
            .arg("SCHEMA")
            .arg("embedding")
            .arg("VECTOR")
            .arg("HNSW")
            .arg("6")
            .arg("TYPE")
            .arg("FLOAT32")
            .arg("DIM")
            .arg(self.dimensions)
            .arg("DISTANCE_METRIC")
            .arg("COSINE")
            .arg("record_id")
            .arg("TAG")
            .query_async(conn)
            .await;
        match created {
            Ok(()) => {},
            Err(e) if e.to_string().contains("Index already exists") => {},
            Err(e) => return Err(Self::map_err("index_create", &e)),
        }
        acquire_lock(&self.created).insert(collection);
        Ok(())
    }

    fn text(value: &redis::Value) -> Option<String> {
        match value {
            redis::Value::BulkString(s) => Some(String::from_utf8_lossy(s).to_string()),
            redis::Value::SimpleString(s) => Some(s.clone()),
            redis::Value::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }

    fn field(fields: &redis::Value, name: &str) -> Option<String> {
        let redis::Value::Array(items) = fields else {
            return None;
        };
        items
            .chunks(2)
            .find(|pair| pair.len() == 2 && Self::text(&pair[0]).as_deref() == Some(name))
            .and_then(|pair| Self::text(&pair[1]))
    }

    /// Parses `FT.SEARCH` output: `[total, key, [field, value, ...], ...]`.
    fn parse_search(value: &redis::Value) -> Vec<(String, f32)> {
        let redis::Value::Array(items) = value else {
            return Vec::new();
        };
        items
            .iter()
            .skip(1)
            .collect::<Vec<_>>()
            .chunks(2)
            .filter_map(|pair| {
                let fields = pair.get(1)?;
                let id = Self::field(fields, "record_id")?;
                let distance = Self::field(fields, "__embedding_score")?.parse::<f32>().ok()?;
                Some((id, (1.0 - distance).clamp(0.0, 1.0)))
            })
            .collect()
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl VectorIndex for RedisVectorIndex {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn upsert(&self, collection: Table, id: &str, embedding: &[f32]) -> Result<()> {
        self.check("index_upsert", embedding)?;
        let mut conn = self.conn().await?;
        self.ensure_index(&mut conn, collection).await?;
        redis::cmd("HSET")
            .arg(self.key(collection, id))
            .arg("embedding")
            .arg(Self::vector_to_bytes(embedding))
            .arg("record_id")
            .arg(id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Self::map_err("index_upsert", &e))
    }

    async fn remove(&self, collection: Table, id: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.key(collection, id))
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("index_remove", &e))?;
        Ok(deleted > 0)
    }

    async fn search(
        &self,
        collection: Table,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        self.check("index_search", embedding)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        self.ensure_index(&mut conn, collection).await?;
        let value: redis::Value = redis::cmd("FT.SEARCH")
            .arg(self.index_name(collection))
            .arg(format!("*=>[KNN {limit} @embedding $BLOB]"))
            .arg("PARAMS")
            .arg("2")
            .arg("BLOB")
            .arg(Self::vector_to_bytes(embedding))
            .arg("SORTBY")
            .arg("__embedding_score")
            .arg("ASC")
            .arg("RETURN")
            .arg("2")
            .arg("record_id")
            .arg("__embedding_score")
            .arg("LIMIT")
            .arg("0")
            .arg(limit)
            .arg("DIALECT")
            .arg("2")
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("index_search", &e))?;
        Ok(Self::parse_search(&value))
    }

    async fn count(&self, collection: Table) -> Result<usize> {
        let mut conn = self.conn().await?;
        let info: redis::RedisResult<redis::Value> = redis::cmd("FT.INFO")
            .arg(self.index_name(collection))
            .query_async(&mut conn)
            .await;
        match info {
            Ok(value) => Ok(Self::field(&value, "num_docs")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)),
            Err(e) if e.to_string().contains("Unknown index name") => Ok(0),
            Err(e) => Err(Self::map_err("index_count", &e)),
        }
    }

    async fn clear(&self, collection: Table) -> Result<()> {
        let mut conn = self.conn().await?;
        let dropped: redis::RedisResult<()> = redis::cmd("FT.DROPINDEX")
            .arg(self.index_name(collection))
            .arg("DD")
            .query_async(&mut conn)
            .await;
        acquire_lock(&self.created).remove(&collection);
        match dropped {
            Err(e) if !e.to_string().contains("Unknown index name") => {
                Err(Self::map_err("index_clear", &e))
            },
            _ => Ok(()),
        }
    }
}

#[cfg(not(feature = "redis"))]
#[async_trait]
impl VectorIndex for RedisVectorIndex {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn upsert(&self, collection: Table, id: &str, _embedding: &[f32]) -> Result<()> {
        Err(Error::Configuration(format!(
            "cannot index {}: redis feature disabled",
            self.key(collection, id)
        )))
    }

    async fn remove(&self, collection: Table, id: &str) -> Result<bool> {
        Err(Error::Configuration(format!(
            "cannot remove {}: redis feature disabled",
            self.key(collection, id)
        )))
    }

    async fn search(&self, collection: Table, _embedding: &[f32], _limit: usize) -> Result<Vec<(String, f32)>> {
        Err(Error::Configuration(format!(
            "cannot search {}: redis feature disabled",
            self.index_name(collection)
        )))
    }

    async fn count(&self, collection: Table) -> Result<usize> {
        Err(Error::Configuration(format!(
            "cannot count {}: redis feature disabled",
            self.index_name(collection)
        )))
    }

    async fn clear(&self, collection: Table) -> Result<()> {
        Err(Error::Configuration(format!(
            "cannot clear {}: redis feature disabled",
            self.index_name(collection)
        )))
    }
}
