//! Index processors: the ingest (extract → transform → load) and retrieval
//! side of a dataset.
//!
//! One [`IndexProcessor`] implementation exists per chunk shape
//! ([`DocForm`]); [`ProcessorFactory`] picks the implementation and resolves
//! the dataset's configured store backends by name.
//!
//! | Phase | Input | Output |
//! |-------|-------|--------|
//! | extract | [`ExtractSetting`] (bytes + file name) | [`RawDocument`]s |
//! | transform | raw documents + [`ProcessRule`] | [`Chunk`]s |
//! | load | chunks | vector and/or keyword entries |
//! | clean | chunk ids | entries removed |
//! | retrieve | [`RetrieveParams`] | [`RetrievedDocument`]s |

pub mod paragraph;
pub mod parent_child;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, IndexPhase, Result};
use crate::keywords;
use crate::model::ModelProvider;
use crate::models::{
    Chunk, Dataset, DatasetStatus, DocForm, IndexingTechnique, Metadata, Query, RawDocument,
    RetrievedDocument,
};
use crate::parser::{file_type_of, ParserRegistry};
use crate::search::{finalize, merge_candidates, sort_by_score, MergeStrategy};
use crate::splitter::ProcessRule;
use crate::store::{IndexedChunk, KeywordStore, VectorStore};

pub use paragraph::ParagraphIndexProcessor;
pub use parent_child::ParentChildIndexProcessor;

/// Keywords extracted per chunk for the lexical index.
pub const KEYWORDS_PER_CHUNK: usize = 10;

/// One resource to ingest.
#[derive(Debug, Clone)]
pub struct ExtractSetting {
    pub source_doc_id: String,
    pub file_name: String,
    /// Overrides the type derived from `file_name`.
    pub file_type: Option<String>,
    pub content: Vec<u8>,
    /// Copied into every extracted document's metadata.
    pub extend_params: Metadata,
}

impl ExtractSetting {
    pub fn new(
        source_doc_id: impl Into<String>,
        file_name: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            source_doc_id: source_doc_id.into(),
            file_name: file_name.into(),
            file_type: None,
            content: content.into(),
            extend_params: Metadata::new(),
        }
    }

    /// Lower-cased file type: the explicit one, else the file extension.
    pub fn resolved_type(&self) -> Option<String> {
        self.file_type
            .as_ref()
            .map(|t| t.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .or_else(|| file_type_of(&self.file_name))
    }
}

/// Per-ingest values.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    pub dataset: Dataset,
    pub process_rule: ProcessRule,
}

impl ProcessorContext {
    pub fn new(dataset: Dataset, process_rule: ProcessRule) -> Self {
        Self {
            dataset,
            process_rule,
        }
    }
}

/// One query string to retrieve for, optionally with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalQuery {
    pub text: String,
    pub vector: Option<Vec<f32>>,
}

impl From<&Query> for RetrievalQuery {
    fn from(q: &Query) -> Self {
        Self {
            text: q.text().to_string(),
            vector: None,
        }
    }
}

impl From<&str> for RetrievalQuery {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
            vector: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrieveParams {
    pub dataset: Dataset,
    pub queries: Vec<RetrievalQuery>,
    pub top_k: usize,
    pub strategy: MergeStrategy,
    pub score_threshold: Option<f64>,
    /// Re-score merged hits with this model's `score` against the first
    /// query.
    pub rerank_model_id: Option<i64>,
}

impl RetrieveParams {
    pub fn new(dataset: Dataset, queries: Vec<RetrievalQuery>, top_k: usize) -> Self {
        Self {
            dataset,
            queries,
            top_k,
            strategy: MergeStrategy::default(),
            score_threshold: None,
            rerank_model_id: None,
        }
    }

    /// Candidates fetched per backend and query before merging.
    fn candidate_k(&self) -> usize {
        (self.top_k * 3).max(10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestState {
    Extracted,
    Transformed,
    Loaded,
    Cleaned,
}

/// Entries written by one `load` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub vectors: usize,
    pub keywords: usize,
}

/// Summary of one `ingest` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub source_doc_id: String,
    pub state: IngestState,
    pub documents: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub keywords: usize,
    pub duration_ms: u64,
}

/// Capabilities shared by every processor.
#[derive(Clone)]
pub struct IndexBackends {
    pub parsers: Arc<ParserRegistry>,
    pub models: Arc<dyn ModelProvider>,
    pub vector: Arc<dyn VectorStore>,
    pub keyword: Arc<dyn KeywordStore>,
}

impl IndexBackends {
    /// Parse the resource and stamp every document with the setting's id.
    pub(crate) fn extract(&self, setting: &ExtractSetting) -> Result<Vec<RawDocument>> {
        let file_type = setting
            .resolved_type()
            .ok_or_else(|| Error::UnsupportedDocumentType(setting.file_name.clone()))?;
        let parser = self.parsers.get(&file_type)?;
        let mut docs = parser.parse(&setting.content, &setting.file_name, &setting.extend_params)?;
        for doc in &mut docs {
            doc.source_doc_id = setting.source_doc_id.clone();
        }
        debug!(
            file = %setting.file_name,
            file_type = %file_type,
            documents = docs.len(),
            "extracted"
        );
        Ok(docs)
    }

    pub(crate) async fn load(
        &self,
        dataset: &Dataset,
        chunks: &[Chunk],
        with_keywords: bool,
    ) -> Result<LoadStats> {
        let mut stats = LoadStats::default();
        if chunks.is_empty() {
            return Ok(stats);
        }
        let indexed: Vec<IndexedChunk> = chunks.iter().map(IndexedChunk::from).collect();

        if dataset.indexing_technique == IndexingTechnique::HighQuality {
            // Embed everything before the first write so a model failure
            // leaves the stores untouched.
            let mut vectors = Vec::with_capacity(indexed.len());
            for chunk in &indexed {
                vectors.push(self.models.embed(dataset.embedding_model_id, &chunk.text).await?);
            }
            for (chunk, vector) in indexed.iter().zip(vectors) {
                self.vector.upsert(chunk, vector).await?;
                stats.vectors += 1;
            }
        }

        if writes_keywords(dataset, with_keywords) {
            let kws: Vec<Vec<String>> = indexed
                .iter()
                .map(|c| keywords::extract_keywords(&c.text, KEYWORDS_PER_CHUNK))
                .collect();
            self.keyword.add_texts(&indexed, Some(&kws)).await?;
            stats.keywords = indexed.len();
        }
        Ok(stats)
    }

    pub(crate) async fn clean(
        &self,
        dataset: &Dataset,
        node_ids: &[String],
        with_keywords: bool,
    ) -> Result<()> {
        self.vector.delete(node_ids).await?;
        if writes_keywords(dataset, with_keywords) {
            self.keyword.delete_by_ids(node_ids).await?;
        }
        Ok(())
    }

    pub(crate) async fn clean_source(&self, source_doc_id: &str) -> Result<()> {
        self.vector.delete_by_source(source_doc_id).await?;
        self.keyword.delete_by_source(source_doc_id).await?;
        Ok(())
    }

    /// Ids held for a source document in either store, sorted.
    pub(crate) async fn source_ids(&self, source_doc_id: &str) -> Result<Vec<String>> {
        let mut ids = self.vector.ids_by_source(source_doc_id).await?;
        ids.extend(self.keyword.ids_by_source(source_doc_id).await?);
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Merged and deduplicated hits for every query, not yet truncated.
    pub(crate) async fn search(&self, params: &RetrieveParams) -> Result<Vec<RetrievedDocument>> {
        let strategy = match params.dataset.indexing_technique {
            IndexingTechnique::Economy => MergeStrategy::KeywordOnly,
            IndexingTechnique::HighQuality => params.strategy,
        };
        strategy.validate()?;
        let k = params.candidate_k();

        let mut merged = Vec::new();
        for query in params.queries.iter().filter(|q| !q.text.trim().is_empty()) {
            let vector_hits = if strategy.uses_vector() {
                let vector = match &query.vector {
                    Some(v) => v.clone(),
                    None => {
                        self.models
                            .embed(params.dataset.embedding_model_id, &query.text)
                            .await?
                    }
                };
                self.vector.search(&vector, k).await?
            } else {
                Vec::new()
            };
            let keyword_hits = if strategy.uses_keyword() {
                self.keyword.search(&query.text, k).await?
            } else {
                Vec::new()
            };
            merged.extend(merge_candidates(&keyword_hits, &vector_hits, strategy));
        }
        Ok(finalize(merged, usize::MAX, None))
    }

    /// Optional rerank, then threshold and `top_k`.
    pub(crate) async fn rank(
        &self,
        mut docs: Vec<RetrievedDocument>,
        params: &RetrieveParams,
    ) -> Result<Vec<RetrievedDocument>> {
        if let (Some(model_id), Some(first)) = (params.rerank_model_id, params.queries.first()) {
            docs.truncate(params.candidate_k());
            for doc in &mut docs {
                doc.score = self.models.score(model_id, &first.text, &doc.text).await? as f64;
            }
            sort_by_score(&mut docs);
        }
        Ok(finalize(docs, params.top_k, params.score_threshold))
    }
}

/// Economy datasets have no vectors, so their keyword entries are always
/// written and cleaned.
fn writes_keywords(dataset: &Dataset, with_keywords: bool) -> bool {
    with_keywords || dataset.indexing_technique == IndexingTechnique::Economy
}

/// Assign contiguous section indices per source document.
pub(crate) fn next_index(counters: &mut HashMap<String, usize>, source_doc_id: &str, n: usize) -> usize {
    let slot = counters.entry(source_doc_id.to_string()).or_insert(0);
    let first = *slot;
    *slot += n;
    first
}

/// The index side of a dataset.
#[async_trait]
pub trait IndexProcessor: Send + Sync {
    fn doc_form(&self) -> DocForm;

    /// Parse the resource into raw documents.
    async fn extract(&self, setting: &ExtractSetting, ctx: &ProcessorContext) -> Result<Vec<RawDocument>>;

    /// Split raw documents into chunks. Fails before producing any chunk when
    /// the rule is invalid.
    async fn transform(&self, docs: Vec<RawDocument>, ctx: &ProcessorContext) -> Result<Vec<Chunk>>;

    /// Write chunks to the stores. Idempotent per chunk id.
    async fn load(
        &self,
        dataset: &Dataset,
        chunks: &[Chunk],
        with_keywords: bool,
        ctx: &ProcessorContext,
    ) -> Result<LoadStats>;

    /// Delete chunks by id. Unknown ids are ignored. Keyword entries are
    /// removed when `with_keywords` is set or the dataset is economy.
    async fn clean(
        &self,
        dataset: &Dataset,
        node_ids: &[String],
        with_keywords: bool,
        ctx: &ProcessorContext,
    ) -> Result<IngestState>;

    /// Delete every chunk of one source document.
    async fn clean_source(&self, dataset: &Dataset, source_doc_id: &str) -> Result<IngestState>;

    /// Ids currently indexed for one source document.
    async fn source_chunk_ids(&self, source_doc_id: &str) -> Result<Vec<String>>;

    async fn retrieve(&self, params: &RetrieveParams) -> Result<Vec<RetrievedDocument>>;

    /// Extract, transform and load one resource, replacing any chunks a
    /// previous ingest of the same source document left behind.
    ///
    /// The new chunks are loaded before anything is removed; only after a
    /// successful load are the previous chunks that the new set does not
    /// overwrite deleted. A failed re-ingest keeps the old index searchable.
    async fn ingest(
        &self,
        setting: &ExtractSetting,
        ctx: &ProcessorContext,
        with_keywords: bool,
    ) -> Result<IngestReport> {
        let started = Instant::now();
        let docs = self
            .extract(setting, ctx)
            .await
            .map_err(|e| e.in_phase(IndexPhase::Extract))?;
        let documents = docs.len();

        let chunks = self
            .transform(docs, ctx)
            .await
            .map_err(|e| e.in_phase(IndexPhase::Transform))?;

        let previous = self
            .source_chunk_ids(&setting.source_doc_id)
            .await
            .map_err(|e| e.in_phase(IndexPhase::Clean))?;
        let stats = self
            .load(&ctx.dataset, &chunks, with_keywords, ctx)
            .await
            .map_err(|e| e.in_phase(IndexPhase::Load))?;

        let fresh: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let stale: Vec<String> = previous
            .into_iter()
            .filter(|id| !fresh.contains(id.as_str()))
            .collect();
        if !stale.is_empty() {
            debug!(source = %setting.source_doc_id, stale = stale.len(), "removing stale chunks");
            self.clean(&ctx.dataset, &stale, true, ctx)
                .await
                .map_err(|e| e.in_phase(IndexPhase::Clean))?;
        }

        let report = IngestReport {
            source_doc_id: setting.source_doc_id.clone(),
            state: IngestState::Loaded,
            documents,
            chunks: chunks.len(),
            vectors: stats.vectors,
            keywords: stats.keywords,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            source = %report.source_doc_id,
            chunks = report.chunks,
            vectors = report.vectors,
            "ingested"
        );
        Ok(report)
    }
}

/// Builds the processor for a dataset from named store backends.
#[derive(Clone)]
pub struct ProcessorFactory {
    parsers: Arc<ParserRegistry>,
    models: Arc<dyn ModelProvider>,
    vector_stores: HashMap<String, Arc<dyn VectorStore>>,
    keyword_stores: HashMap<String, Arc<dyn KeywordStore>>,
}

impl ProcessorFactory {
    pub fn new(parsers: Arc<ParserRegistry>, models: Arc<dyn ModelProvider>) -> Self {
        Self {
            parsers,
            models,
            vector_stores: HashMap::new(),
            keyword_stores: HashMap::new(),
        }
    }

    pub fn with_vector_store(mut self, name: impl Into<String>, store: Arc<dyn VectorStore>) -> Self {
        self.vector_stores.insert(name.into(), store);
        self
    }

    pub fn with_keyword_store(mut self, name: impl Into<String>, store: Arc<dyn KeywordStore>) -> Self {
        self.keyword_stores.insert(name.into(), store);
        self
    }

    pub fn backends(&self, dataset: &Dataset) -> Result<IndexBackends> {
        let vector = self
            .vector_stores
            .get(&dataset.vector_store)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "unknown vector store '{}' for dataset {}",
                    dataset.vector_store, dataset.id
                ))
            })?;
        let keyword = self
            .keyword_stores
            .get(&dataset.keyword_store)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "unknown keyword store '{}' for dataset {}",
                    dataset.keyword_store, dataset.id
                ))
            })?;
        Ok(IndexBackends {
            parsers: self.parsers.clone(),
            models: self.models.clone(),
            vector,
            keyword,
        })
    }

    /// The processor matching the dataset's `doc_form`.
    pub fn for_dataset(&self, dataset: &Dataset) -> Result<Arc<dyn IndexProcessor>> {
        let backends = self.backends(dataset)?;
        Ok(match dataset.doc_form {
            DocForm::Text => Arc::new(ParagraphIndexProcessor::new(backends)),
            DocForm::ParentChild => Arc::new(ParentChildIndexProcessor::new(backends)),
        })
    }
}

/// Disabled datasets answer every retrieval with no hits.
pub(crate) fn retrievable(dataset: &Dataset) -> bool {
    if dataset.status() == DatasetStatus::Disabled {
        debug!(dataset = dataset.id, "dataset disabled, skipping retrieval");
        return false;
    }
    true
}
