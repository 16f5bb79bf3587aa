//! Parent/child chunks: small child chunks are indexed for precise matching,
//! while retrieval returns the larger parent segment they came from.
//!
//! Parents are cut with the process rule's segmentation, children with its
//! subchunk segmentation. Only children are written to the stores; each one
//! carries its parent's id, index and text in metadata.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{
    next_index, retrievable, ExtractSetting, IndexBackends, IndexProcessor, IngestState,
    LoadStats, ProcessorContext, RetrieveParams,
};
use crate::error::Result;
use crate::models::{Chunk, Dataset, DocForm, RawDocument, RetrievedDocument};
use crate::splitter::{derive_chunk_id, make_chunk, SegmentSplitter};

pub const PARENT_ID: &str = "parent_id";
pub const PARENT_INDEX: &str = "parent_index";
pub const PARENT_TEXT: &str = "parent_text";

pub struct ParentChildIndexProcessor {
    backends: IndexBackends,
}

impl ParentChildIndexProcessor {
    pub fn new(backends: IndexBackends) -> Self {
        Self { backends }
    }
}

/// Collapse child hits onto their parents, keeping each parent's best score.
fn lift_to_parents(hits: Vec<RetrievedDocument>) -> Vec<RetrievedDocument> {
    let mut parents: HashMap<String, RetrievedDocument> = HashMap::new();
    for hit in hits {
        let parent_id = match hit.metadata.get(PARENT_ID).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => hit.chunk_id.clone(),
        };
        let better = parents
            .get(&parent_id)
            .map_or(true, |existing| hit.score > existing.score);
        if !better {
            continue;
        }
        let text = hit
            .metadata
            .get(PARENT_TEXT)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| hit.text.clone());
        let mut metadata = hit.metadata;
        metadata.remove(PARENT_TEXT);
        metadata.insert("matched_child_id".to_string(), Value::String(hit.chunk_id));
        parents.insert(
            parent_id.clone(),
            RetrievedDocument {
                chunk_id: parent_id,
                source_doc_id: hit.source_doc_id,
                text,
                score: hit.score,
                metadata,
            },
        );
    }
    parents.into_values().collect()
}

#[async_trait]
impl IndexProcessor for ParentChildIndexProcessor {
    fn doc_form(&self) -> DocForm {
        DocForm::ParentChild
    }

    async fn extract(&self, setting: &ExtractSetting, _ctx: &ProcessorContext) -> Result<Vec<RawDocument>> {
        self.backends.extract(setting)
    }

    async fn transform(&self, docs: Vec<RawDocument>, ctx: &ProcessorContext) -> Result<Vec<Chunk>> {
        let parent_splitter = SegmentSplitter::for_rule(&ctx.process_rule)?;
        let child_splitter = SegmentSplitter::new(ctx.process_rule.effective_subchunk()?);

        let mut parent_counters = HashMap::new();
        let mut child_counters = HashMap::new();
        let mut children = Vec::new();
        for doc in &docs {
            let parent_texts = parent_splitter.split(&doc.text);
            let first = next_index(&mut parent_counters, &doc.source_doc_id, parent_texts.len());
            for (i, parent_text) in parent_texts.iter().enumerate() {
                let parent = make_chunk(&doc.source_doc_id, first + i, parent_text, doc.metadata.clone());
                let child_texts = child_splitter.split(&parent.text);
                let mut index = next_index(&mut child_counters, &doc.source_doc_id, child_texts.len());
                for (j, child_text) in child_texts.iter().enumerate() {
                    let mut metadata = parent.metadata.clone();
                    metadata.insert(PARENT_ID.to_string(), Value::String(parent.id.clone()));
                    metadata.insert(PARENT_INDEX.to_string(), Value::from(parent.section_index));
                    metadata.insert(PARENT_TEXT.to_string(), Value::String(parent.text.clone()));
                    let mut child = make_chunk(&doc.source_doc_id, index, child_text, metadata);
                    child.id = derive_chunk_id(&parent.id, j);
                    children.push(child);
                    index += 1;
                }
            }
        }
        debug!(documents = docs.len(), children = children.len(), "transformed");
        Ok(children)
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
        let children = self.backends.search(params).await?;
        let parents = lift_to_parents(children);
        self.backends.rank(parents, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_support::*;
    use crate::processor::RetrievalQuery;
    use crate::splitter::{ProcessRule, SegmentationRule};
    use crate::store::VectorStore;

    const DOC: &str = "Refunds are issued within five business days. Store credit is instant.\n\n\
        Shipping takes two weeks. Express shipping takes three days.";

    fn ctx() -> ProcessorContext {
        let mut dataset = Dataset::new(1, "faq", 1);
        dataset.doc_form = DocForm::ParentChild;
        let mut rule = ProcessRule::custom(SegmentationRule {
            max_tokens: 60,
            max_chunk_size: 80,
            chunk_overlap: 0,
            ..Default::default()
        });
        rule.subchunk_segmentation = Some(SegmentationRule {
            max_tokens: 50,
            max_chunk_size: 50,
            chunk_overlap: 0,
            separator: ". ".to_string(),
            ..Default::default()
        });
        ProcessorContext::new(dataset, rule)
    }

    #[tokio::test]
    async fn children_reference_their_parent() {
        let f = fixture();
        let processor = ParentChildIndexProcessor::new(f.backends.clone());
        let ctx = ctx();
        let docs = vec![RawDocument::new("faq", DOC)];
        let children = processor.transform(docs, &ctx).await.unwrap();

        assert_eq!(children.len(), 4);
        let indices: Vec<usize> = children.iter().map(|c| c.section_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        let parent_of = |c: &Chunk| c.metadata[PARENT_ID].as_str().unwrap().to_string();
        assert_eq!(parent_of(&children[0]), parent_of(&children[1]));
        assert_ne!(parent_of(&children[1]), parent_of(&children[2]));
        assert_eq!(children[0].id, derive_chunk_id(&parent_of(&children[0]), 0));
        assert!(children[2].metadata[PARENT_TEXT]
            .as_str()
            .unwrap()
            .starts_with("Shipping takes two weeks."));
    }

    #[tokio::test]
    async fn retrieve_returns_parents_once() {
        let f = fixture();
        let processor = ParentChildIndexProcessor::new(f.backends.clone());
        let ctx = ctx();
        let report = processor
            .ingest(&ExtractSetting::new("faq", "faq.txt", DOC), &ctx, true)
            .await
            .unwrap();
        assert_eq!(report.chunks, 4);
        assert_eq!(f.vector.count().await.unwrap(), 4);

        let params = RetrieveParams::new(
            ctx.dataset.clone(),
            vec![
                RetrievalQuery::from("Express shipping takes three days"),
                RetrievalQuery::from("Shipping takes two weeks"),
            ],
            5,
        );
        let hits = processor.retrieve(&params).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].text.starts_with("Shipping takes two weeks."));
        assert!(hits[0].text.contains("Express shipping"));
        assert!(hits[0].metadata.get(PARENT_TEXT).is_none());
        assert!(hits[0].metadata.contains_key("matched_child_id"));
    }

    #[test]
    fn lift_keeps_best_child() {
        let child = |id: &str, parent: &str, score: f64| {
            let mut metadata = crate::models::Metadata::new();
            metadata.insert(PARENT_ID.into(), Value::String(parent.into()));
            metadata.insert(PARENT_TEXT.into(), Value::String(format!("parent {}", parent)));
            RetrievedDocument {
                chunk_id: id.into(),
                source_doc_id: "d".into(),
                text: id.into(),
                score,
                metadata,
            }
        };
        let mut lifted = lift_to_parents(vec![
            child("c1", "p1", 0.2),
            child("c2", "p1", 0.9),
            child("c3", "p2", 0.5),
        ]);
        lifted.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        assert_eq!(lifted.len(), 2);
        assert_eq!(lifted[0].chunk_id, "p1");
        assert_eq!(lifted[0].score, 0.9);
        assert_eq!(lifted[0].text, "parent p1");
        assert_eq!(lifted[0].metadata["matched_child_id"], "c2");
    }
}
