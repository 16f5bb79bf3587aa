//! Store capabilities consumed by the index processors.
//!
//! Two independent backends hold every indexed chunk: a [`VectorStore`]
//! for dense similarity search and a [`KeywordStore`] for lexical search.
//! Both are keyed by chunk id, so writing the same chunk twice leaves a
//! single entry and deleting an unknown id is a no-op.
//!
//! Implementations must be `Send + Sync`; processors share them through
//! `Arc<dyn ...>` across concurrent ingests.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Chunk, Metadata};

/// The stored form of a chunk, shared by both store kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub id: String,
    pub source_doc_id: String,
    pub text: String,
    pub metadata: Metadata,
}

impl From<&Chunk> for IndexedChunk {
    fn from(chunk: &Chunk) -> Self {
        Self {
            id: chunk.id.clone(),
            source_doc_id: chunk.source_doc_id.clone(),
            text: chunk.text.clone(),
            metadata: chunk.metadata.clone(),
        }
    }
}

/// A search hit from one backend, before normalisation and merging.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub source_doc_id: String,
    /// Backend-specific score (cosine similarity or lexical weight).
    pub raw_score: f64,
    pub text: String,
    pub metadata: Metadata,
}

impl ChunkCandidate {
    pub(crate) fn from_indexed(chunk: &IndexedChunk, raw_score: f64) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            source_doc_id: chunk.source_doc_id.clone(),
            raw_score,
            text: chunk.text.clone(),
            metadata: chunk.metadata.clone(),
        }
    }
}

/// Dense vector index.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the vector for `chunk.id`.
    async fn upsert(&self, chunk: &IndexedChunk, vector: Vec<f32>) -> Result<()>;

    /// Remove entries by chunk id. Unknown ids are ignored.
    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Remove every entry belonging to a source document.
    async fn delete_by_source(&self, source_doc_id: &str) -> Result<()>;

    /// Ids of every entry belonging to a source document, in no particular
    /// order.
    async fn ids_by_source(&self, source_doc_id: &str) -> Result<Vec<String>>;

    /// The `k` nearest entries by cosine similarity, best first.
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<ChunkCandidate>>;

    async fn count(&self) -> Result<usize>;
}

/// Lexical index.
#[async_trait]
pub trait KeywordStore: Send + Sync {
    /// Index chunks. `keywords[i]`, when given, supplements the terms
    /// extracted from `docs[i].text`.
    async fn add_texts(&self, docs: &[IndexedChunk], keywords: Option<&[Vec<String>]>)
        -> Result<()>;

    /// Remove entries by chunk id. Unknown ids are ignored.
    async fn delete_by_ids(&self, ids: &[String]) -> Result<()>;

    /// Remove every entry belonging to a source document.
    async fn delete_by_source(&self, source_doc_id: &str) -> Result<()>;

    async fn ids_by_source(&self, source_doc_id: &str) -> Result<Vec<String>>;

    /// The `k` best lexical matches for `keyword`, best first.
    async fn search(&self, keyword: &str, k: usize) -> Result<Vec<ChunkCandidate>>;

    async fn count(&self) -> Result<usize>;
}
