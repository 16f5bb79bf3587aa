//! Drives a query through the transformation pipeline and into retrieval
//! against datasets ingested through the processor factory.

use std::sync::Arc;

use async_trait::async_trait;
use ragline_core::model::ModelProvider;
use ragline_core::models::{Dataset, DocForm, Query};
use ragline_core::parser::ParserRegistry;
use ragline_core::processor::{
    ExtractSetting, IngestState, ProcessorContext, ProcessorFactory, RetrievalQuery,
    RetrieveParams,
};
use ragline_core::query::{
    default_pipeline, IntentRule, IntentSlotGate, KeywordIntentClassifier, Lexicon,
    ModelExpansionGateway, PipelineConfig, SlotDefinition, SlotTemplate, SlotType, StageStatus,
};
use ragline_core::splitter::ProcessRule;
use ragline_core::store::memory::{InMemoryKeywordStore, InMemoryVectorStore};
use ragline_core::{Error, Result};

/// Deterministic stand-in: letter-frequency embeddings and a canned chat
/// reply listing two paraphrases.
struct StubModels;

fn letters(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 26];
    for c in text.to_lowercase().chars().filter(|c| c.is_ascii_lowercase()) {
        v[(c as u8 - b'a') as usize] += 1.0;
    }
    v
}

#[async_trait]
impl ModelProvider for StubModels {
    async fn chat(&self, model_id: i64, _prompt: &str) -> Result<String> {
        if model_id != 7 {
            return Err(Error::InvalidModelId(model_id));
        }
        Ok("1. refund processing time\n2. how long until my money is returned".to_string())
    }

    async fn embed(&self, _model_id: i64, text: &str) -> Result<Vec<f32>> {
        Ok(letters(text))
    }

    async fn score(&self, _model_id: i64, _query: &str, _passage: &str) -> Result<f32> {
        Ok(0.5)
    }
}

const FAQ: &str = "# Refunds\n\nRefund processing time is five business days.\n\n\
    # Shipping\n\nInternational shipping takes two weeks.";

fn factory() -> ProcessorFactory {
    ProcessorFactory::new(Arc::new(ParserRegistry::with_text_parsers()), Arc::new(StubModels))
        .with_vector_store("memory", Arc::new(InMemoryVectorStore::new()))
        .with_keyword_store("memory", Arc::new(InMemoryKeywordStore::new()))
}

fn config() -> PipelineConfig {
    PipelineConfig {
        model_id: Some(7),
        intent_recognition_enabled: true,
        ..Default::default()
    }
}

fn gate() -> IntentSlotGate {
    let classifier = KeywordIntentClassifier::new(vec![IntentRule {
        code: "order_status".into(),
        keywords: vec!["order".into(), "where is".into()],
    }]);
    let mut template = SlotTemplate::new("order_status")
        .with_slot(SlotDefinition::new("order_id", SlotType::Integer).required());
    template.block_retrieval_on_missing = true;
    IntentSlotGate::new(Arc::new(classifier), vec![template])
}

#[tokio::test]
async fn expanded_queries_retrieve_the_right_chunk() {
    let factory = factory();
    let dataset = Dataset::new(1, "faq", 1);
    let processor = factory.for_dataset(&dataset).unwrap();
    let ctx = ProcessorContext::new(dataset.clone(), ProcessRule::automatic());
    let report = processor
        .ingest(&ExtractSetting::new("faq", "faq.md", FAQ), &ctx, true)
        .await
        .unwrap();
    assert_eq!(report.state, IngestState::Loaded);
    assert!(report.chunks >= 1);

    let gateway = Arc::new(ModelExpansionGateway::new(Arc::new(StubModels), 7));
    let pipeline = default_pipeline(config(), gateway, None, Some(gate())).unwrap();
    let (queries, trace) = pipeline
        .transform_with_trace(Query::new("  1. \"refund timeline\"  "))
        .await;

    assert_eq!(queries[0].text(), "refund timeline");
    assert_eq!(queries.len(), 4);
    assert_eq!(queries[3].text(), "  1. \"refund timeline\"  ");
    assert_eq!(trace.stage("normalization").unwrap().status, StageStatus::Applied);
    assert_eq!(trace.stage("expansion").unwrap().status, StageStatus::Applied);
    assert!(!trace.blocks_retrieval());

    let params = RetrieveParams::new(
        dataset,
        queries.iter().map(RetrievalQuery::from).collect(),
        3,
    );
    let hits = processor.retrieve(&params).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().any(|h| h.text.contains("Refund processing time")));
}

#[tokio::test]
async fn missing_slot_blocks_retrieval() {
    let gateway = Arc::new(ModelExpansionGateway::new(Arc::new(StubModels), 7));
    let pipeline = default_pipeline(config(), gateway, None, Some(gate())).unwrap();

    let (_, trace) = pipeline
        .transform_with_trace(Query::new("where is my order"))
        .await;
    let clarification = trace.clarification.as_ref().unwrap();
    assert_eq!(clarification.missing_slots, vec!["order_id"]);
    assert!(trace.blocks_retrieval());

    let (_, trace) = pipeline
        .transform_with_trace(Query::new("where is my order 12345"))
        .await;
    assert!(trace.clarification.is_none());
    assert_eq!(trace.attributes["intent"]["code"], "order_status");
}

#[tokio::test]
async fn expansion_failure_degrades_to_original_query() {
    let gateway = Arc::new(ModelExpansionGateway::new(Arc::new(StubModels), 7));
    let config = PipelineConfig {
        model_id: Some(99),
        ..Default::default()
    };
    let pipeline = default_pipeline(config, gateway, None, None).unwrap();
    let (queries, trace) = pipeline.transform_with_trace(Query::new("refund")).await;

    assert_eq!(queries, vec![Query::new("refund")]);
    let expansion = trace.stage("expansion").unwrap();
    assert_eq!(expansion.status, StageStatus::Failed);
    assert!(expansion.error.as_deref().unwrap().contains("99"));
}

#[tokio::test]
async fn synonym_recall_reaches_differently_worded_chunk() {
    let factory = factory();
    let dataset = Dataset::new(3, "faq", 1);
    let processor = factory.for_dataset(&dataset).unwrap();
    let ctx = ProcessorContext::new(dataset.clone(), ProcessRule::automatic());
    processor
        .ingest(&ExtractSetting::new("faq", "faq.md", FAQ), &ctx, true)
        .await
        .unwrap();

    let config = PipelineConfig {
        enable_expanding: false,
        enable_synonym_recall: true,
        ..Default::default()
    };
    let lexicon = Arc::new(Lexicon::default().with_synonyms("reimbursement", ["refund"]));
    let gateway = Arc::new(ModelExpansionGateway::new(Arc::new(StubModels), 7));
    let pipeline = default_pipeline(config, gateway, Some(lexicon), None).unwrap();
    assert_eq!(
        pipeline.stage_names(),
        vec![
            "normalization",
            "phonetic_correction",
            "prefix_completion",
            "synonym_recall",
            "expansion"
        ]
    );

    let (queries, trace) = pipeline.transform_with_trace(Query::new("reimbursement")).await;
    let texts: Vec<&str> = queries.iter().map(|q| q.text()).collect();
    assert_eq!(texts, vec!["reimbursement", "reimbursement refund"]);
    assert_eq!(trace.stage("synonym_recall").unwrap().status, StageStatus::Applied);
    assert_eq!(trace.stage("prefix_completion").unwrap().status, StageStatus::Skipped);

    let mut params = RetrieveParams::new(
        dataset,
        queries.iter().map(RetrievalQuery::from).collect(),
        1,
    );
    params.strategy = ragline_core::search::MergeStrategy::KeywordOnly;
    let hits = processor.retrieve(&params).await.unwrap();
    assert!(hits[0].text.contains("Refund processing time"));
}

#[tokio::test]
async fn parent_child_dataset_returns_parents() {
    let factory = factory();
    let mut dataset = Dataset::new(2, "manual", 1);
    dataset.doc_form = DocForm::ParentChild;
    let processor = factory.for_dataset(&dataset).unwrap();
    let ctx = ProcessorContext::new(dataset.clone(), ProcessRule::automatic());
    processor
        .ingest(&ExtractSetting::new("manual", "manual.md", FAQ), &ctx, false)
        .await
        .unwrap();

    let params = RetrieveParams::new(
        dataset,
        vec![RetrievalQuery::from("International shipping takes two weeks.")],
        5,
    );
    let hits = processor.retrieve(&params).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].text.contains("Refunds") && hits[0].text.contains("Shipping"));
}
