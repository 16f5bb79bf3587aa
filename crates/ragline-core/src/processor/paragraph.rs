//! Flat paragraph chunks: every chunk is indexed and returned as-is.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use super::{
    next_index, retrievable, ExtractSetting, IndexBackends, IndexProcessor, IngestState,
    LoadStats, ProcessorContext, RetrieveParams,
};
use crate::error::Result;
use crate::models::{Chunk, Dataset, DocForm, RawDocument, RetrievedDocument};
use crate::splitter::{make_chunk, SegmentSplitter};

pub struct ParagraphIndexProcessor {
    backends: IndexBackends,
}

impl ParagraphIndexProcessor {
    pub fn new(backends: IndexBackends) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl IndexProcessor for ParagraphIndexProcessor {
    fn doc_form(&self) -> DocForm {
        DocForm::Text
    }

    async fn extract(&self, setting: &ExtractSetting, _ctx: &ProcessorContext) -> Result<Vec<RawDocument>> {
        self.backends.extract(setting)
    }

    async fn transform(&self, docs: Vec<RawDocument>, ctx: &ProcessorContext) -> Result<Vec<Chunk>> {
        let splitter = SegmentSplitter::for_rule(&ctx.process_rule)?;
        let mut counters = HashMap::new();
        let mut chunks = Vec::new();
        for doc in &docs {
            let pieces = splitter.split(&doc.text);
            let first = next_index(&mut counters, &doc.source_doc_id, pieces.len());
            chunks.extend(pieces.iter().enumerate().map(|(i, text)| {
                make_chunk(&doc.source_doc_id, first + i, text, doc.metadata.clone())
            }));
        }
        debug!(documents = docs.len(), chunks = chunks.len(), "transformed");
        Ok(chunks)
    }

    async fn load(
        &self,
        dataset: &Dataset,
        chunks: &[Chunk],
        with_keywords: bool,
        _ctx: &ProcessorContext,
    ) -> Result<LoadStats> {
        self.backends.load(dataset, chunks, with_keywords).await
    }

    async fn clean(
        &self,
        dataset: &Dataset,
        node_ids: &[String],
        with_keywords: bool,
        _ctx: &ProcessorContext,
    ) -> Result<IngestState> {
        self.backends.clean(dataset, node_ids, with_keywords).await?;
        Ok(IngestState::Cleaned)
    }

    async fn clean_source(&self, _dataset: &Dataset, source_doc_id: &str) -> Result<IngestState> {
        self.backends.clean_source(source_doc_id).await?;
        Ok(IngestState::Cleaned)
    }

    async fn source_chunk_ids(&self, source_doc_id: &str) -> Result<Vec<String>> {
        self.backends.source_ids(source_doc_id).await
    }

    async fn retrieve(&self, params: &RetrieveParams) -> Result<Vec<RetrievedDocument>> {
        if !retrievable(&params.dataset) {
            return Ok(Vec::new());
        }
        let hits = self.backends.search(params).await?;
        self.backends.rank(hits, params).await
    }
}
