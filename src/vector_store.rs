//! # Vector store contract
//!
//! Everything the pipeline needs from a similarity-search backend, independent of
//! which backend it is:
//!
//! - [`ChunkRecord`]: one chunk ready to be stored, with its flattened metadata.
//! - [`ContextResult`]: one ranked hit coming back from a query.
//! - [`VectorIndex`]: batch insert + nearest-neighbour query.
//! - [`IndexConnector`]: connection + schema bootstrap, re-run when the pipeline tries
//!   to leave degraded mode.
//! - [`IndexError`]: the failure taxonomy, classified for retry and degraded mode.
//!
//! [`MemoryVectorStore`] is the in-process implementation: an ID→chunk map plus
//! brute-force cosine distance over any [`Embedder`]. The remote implementation lives
//! in [`crate::weaviate`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::embedding::Embedder;
use crate::metadata::DocumentMetadata;
use crate::retry::Retryable;

/// Failures from a vector store or its embedding provider.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Network-level failure: refused connection, reset, timeout.
    #[error("connection error: {0}")]
    Connection(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    /// The store is in degraded mode; nothing was attempted.
    #[error("vector store unavailable")]
    Unavailable,
    /// Schema/collection bootstrap failed for a reason other than "already exists".
    #[error("schema bootstrap failed: {0}")]
    Bootstrap(String),
    /// Some items of a batch were rejected. Items before the failure may be stored.
    #[error("batch insert incomplete ({written}/{total} written): {message}")]
    Batch {
        written: usize,
        total: usize,
        message: String,
    },
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
}

impl IndexError {
    /// Whether the failure says the store itself is unreachable, as opposed to a
    /// request it understood and rejected.
    pub fn is_connection(&self) -> bool {
        match self {
            IndexError::Connection(_) | IndexError::Unavailable => true,
            IndexError::Status { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

impl Retryable for IndexError {
    fn is_transient(&self) -> bool {
        match self {
            IndexError::Connection(_) => true,
            IndexError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for IndexError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            IndexError::Malformed(e.to_string())
        } else {
            IndexError::Connection(e.to_string())
        }
    }
}

/// A chunk as written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// UUID-shaped, derived from source, position and content.
    pub id: String,
    pub content: String,
    pub title: String,
    pub category: String,
    pub source: String,
}

impl ChunkRecord {
    /// Build the record for chunk number `index` of a document. Missing metadata
    /// values become empty strings.
    pub fn new(content: String, metadata: &DocumentMetadata, index: usize) -> Self {
        let source = metadata.source_or_empty().to_string();
        Self {
            id: chunk_id(&source, index, &content),
            title: metadata.title_or_empty().to_string(),
            category: metadata.category_or_empty().to_string(),
            source,
            content,
        }
    }
}

/// Stable UUID-formatted id for a chunk.
///
/// Re-indexing the same document yields the same ids, so a retried batch
/// overwrites what a failed attempt already wrote.
pub fn chunk_id(source: &str, index: usize, content: &str) -> String {
    let digest = sha256::digest(format!("{source}\u{1f}{index}\u{1f}{content}"));
    format!(
        "{}-{}-{}-{}-{}",
        &digest[0..8],
        &digest[8..12],
        &digest[12..16],
        &digest[16..20],
        &digest[20..32]
    )
}

/// Metadata carried by a retrieved chunk. Absent fields are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub source: String,
}

/// One retrieved chunk, ranked by ascending distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResult {
    pub content: String,
    pub metadata: ContextMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

/// A similarity-search store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Write all `records` as one logical batch and return how many were stored.
    ///
    /// Any rejected item fails the whole call with [`IndexError::Batch`].
    async fn insert_batch(&self, records: &[ChunkRecord]) -> Result<usize, IndexError>;

    /// Up to `limit` nearest chunks to `text`, best first.
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<ContextResult>, IndexError>;
}

/// Establishes a ready-to-use [`VectorIndex`] (connection + schema bootstrap).
///
/// Returns [`IndexError::Unavailable`] when the store can't be reached and
/// [`IndexError::Bootstrap`] when it can be reached but not prepared.
#[async_trait]
pub trait IndexConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn VectorIndex>, IndexError>;
}

/// Connector for an index that is already live, such as a [`MemoryVectorStore`].
pub struct FixedConnector(Arc<dyn VectorIndex>);

impl FixedConnector {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self(index)
    }
}

#[async_trait]
impl IndexConnector for FixedConnector {
    async fn connect(&self) -> Result<Arc<dyn VectorIndex>, IndexError> {
        Ok(self.0.clone())
    }
}

pub(crate) fn reject_empty(records: &[ChunkRecord]) -> Result<(), IndexError> {
    match records.iter().find(|r| r.content.trim().is_empty()) {
        Some(r) => Err(IndexError::InvalidRecord(format!(
            "chunk {} from '{}' has empty content",
            r.id, r.source
        ))),
        None => Ok(()),
    }
}

struct StoredChunk {
    record: ChunkRecord,
    vector: Vec<f32>,
}

/// In-process store: ID→chunk map with brute-force cosine search.
pub struct MemoryVectorStore<E: Embedder> {
    embedder: E,
    id_to_chunk: RwLock<HashMap<String, StoredChunk>>,
}

impl<E: Embedder> MemoryVectorStore<E> {
    pub fn new(embedder: E) -> Self {
        Self {
            embedder,
            id_to_chunk: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.id_to_chunk.read().map(|m| m.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a stored chunk by id.
    pub fn get(&self, id: &str) -> Option<ChunkRecord> {
        self.id_to_chunk
            .read()
            .ok()
            .and_then(|m| m.get(id).map(|c| c.record.clone()))
    }
}

#[async_trait]
impl<E: Embedder> VectorIndex for MemoryVectorStore<E> {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_batch(&self, records: &[ChunkRecord]) -> Result<usize, IndexError> {
        reject_empty(records)?;
        let texts: Vec<String> = records.iter().map(|r| r.content.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;

        let mut map = self
            .id_to_chunk
            .write()
            .map_err(|_| IndexError::Malformed("memory store lock poisoned".into()))?;
        for (record, vector) in records.iter().zip(vectors) {
            map.insert(
                record.id.clone(),
                StoredChunk {
                    record: record.clone(),
                    vector,
                },
            );
        }
        debug!("Stored {} chunks in memory store ({} total)", records.len(), map.len());
        Ok(records.len())
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<ContextResult>, IndexError> {
        let query = self
            .embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Embedding("no vector for query".into()))?;

        let map = self
            .id_to_chunk
            .read()
            .map_err(|_| IndexError::Malformed("memory store lock poisoned".into()))?;
        let mut scored: Vec<(f32, &StoredChunk)> = map
            .values()
            .map(|chunk| (cosine_distance(&query, &chunk.vector), chunk))
            .collect();
        scored.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.record.id.cmp(&b.1.record.id))
        });

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(distance, chunk)| ContextResult {
                content: chunk.record.content.clone(),
                metadata: ContextMetadata {
                    title: chunk.record.title.clone(),
                    category: chunk.record.category.clone(),
                    source: chunk.record.source.clone(),
                },
                distance: Some(distance),
            })
            .collect())
    }
}

/// Cosine distance (`1 - cosine similarity`); `1.0` for empty or mismatched vectors.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 1.0;
    }
    1.0 - dot / denom
}
