//! In-memory [`VectorStore`] and [`KeywordStore`] implementations.
//!
//! Uses `HashMap` behind `std::sync::RwLock`. Vector search is brute-force
//! cosine similarity over all stored vectors; keyword search weights each
//! matched term by `(1 + ln tf) * ln(1 + N / df)`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::keywords;
use crate::model::cosine_similarity;

use super::{ChunkCandidate, IndexedChunk, KeywordStore, VectorStore};

fn poisoned_read<E>(_: E) -> Error {
    Error::StoreReadFailure("lock poisoned".to_string())
}

fn poisoned_write<E>(_: E) -> Error {
    Error::StoreWriteFailure("lock poisoned".to_string())
}

fn rank(mut candidates: Vec<ChunkCandidate>, k: usize) -> Vec<ChunkCandidate> {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(k);
    candidates
}

struct StoredVector {
    chunk: IndexedChunk,
    vector: Vec<f32>,
}

/// In-memory vector store for tests and the CLI.
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<HashMap<String, StoredVector>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, chunk: &IndexedChunk, vector: Vec<f32>) -> Result<()> {
        if vector.is_empty() {
            return Err(Error::StoreWriteFailure(format!(
                "empty vector for chunk {}",
                chunk.id
            )));
        }
        let mut entries = self.entries.write().map_err(poisoned_write)?;
        entries.insert(
            chunk.id.clone(),
            StoredVector {
                chunk: chunk.clone(),
                vector,
            },
        );
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned_write)?;
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }

    async fn delete_by_source(&self, source_doc_id: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned_write)?;
        entries.retain(|_, e| e.chunk.source_doc_id != source_doc_id);
        Ok(())
    }

    async fn ids_by_source(&self, source_doc_id: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(poisoned_read)?;
        Ok(entries
            .values()
            .filter(|e| e.chunk.source_doc_id == source_doc_id)
            .map(|e| e.chunk.id.clone())
            .collect())
    }

    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<ChunkCandidate>> {
        let entries = self.entries.read().map_err(poisoned_read)?;
        let candidates = entries
            .values()
            .map(|e| {
                let sim = cosine_similarity(vector, &e.vector) as f64;
                ChunkCandidate::from_indexed(&e.chunk, sim)
            })
            .collect();
        Ok(rank(candidates, k))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(poisoned_read)?.len())
    }
}

struct StoredText {
    chunk: IndexedChunk,
    terms: HashMap<String, usize>,
}

/// In-memory keyword store for tests and the CLI.
#[derive(Default)]
pub struct InMemoryKeywordStore {
    entries: RwLock<HashMap<String, StoredText>>,
}

impl InMemoryKeywordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeywordStore for InMemoryKeywordStore {
    async fn add_texts(
        &self,
        docs: &[IndexedChunk],
        keywords: Option<&[Vec<String>]>,
    ) -> Result<()> {
        if let Some(kw) = keywords {
            if kw.len() != docs.len() {
                return Err(Error::StoreWriteFailure(format!(
                    "{} keyword lists for {} documents",
                    kw.len(),
                    docs.len()
                )));
            }
        }

        let mut entries = self.entries.write().map_err(poisoned_write)?;
        for (i, doc) in docs.iter().enumerate() {
            let mut terms = keywords::term_frequencies(&doc.text);
            if let Some(extra) = keywords.map(|kw| &kw[i]) {
                for term in extra {
                    *terms.entry(term.to_lowercase()).or_insert(0) += 1;
                }
            }
            entries.insert(
                doc.id.clone(),
                StoredText {
                    chunk: doc.clone(),
                    terms,
                },
            );
        }
        Ok(())
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned_write)?;
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }

    async fn delete_by_source(&self, source_doc_id: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned_write)?;
        entries.retain(|_, e| e.chunk.source_doc_id != source_doc_id);
        Ok(())
    }

    async fn ids_by_source(&self, source_doc_id: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(poisoned_read)?;
        Ok(entries
            .values()
            .filter(|e| e.chunk.source_doc_id == source_doc_id)
            .map(|e| e.chunk.id.clone())
            .collect())
    }

    async fn search(&self, keyword: &str, k: usize) -> Result<Vec<ChunkCandidate>> {
        let mut query_terms = keywords::tokenize(keyword);
        query_terms.sort();
        query_terms.dedup();
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let entries = self.entries.read().map_err(poisoned_read)?;
        let n = entries.len() as f64;
        let df: HashMap<&str, usize> = query_terms
            .iter()
            .map(|t| {
                let count = entries.values().filter(|e| e.terms.contains_key(t)).count();
                (t.as_str(), count)
            })
            .collect();

        let candidates = entries
            .values()
            .filter_map(|e| {
                let score: f64 = query_terms
                    .iter()
                    .filter_map(|t| {
                        let tf = *e.terms.get(t)? as f64;
                        let idf = (1.0 + n / df[t.as_str()] as f64).ln();
                        Some((1.0 + tf.ln()) * idf)
                    })
                    .sum();
                (score > 0.0).then(|| ChunkCandidate::from_indexed(&e.chunk, score))
            })
            .collect();
        Ok(rank(candidates, k))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(poisoned_read)?.len())
    }
}
