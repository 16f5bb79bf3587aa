//! Wiring of the configured components into one request-serving engine.
//!
//! An [`Engine`] owns the model registry, the parser registry, the in-memory
//! stores and the query pipeline built from a [`Config`]. The CLI creates
//! one per invocation; library users can hold one for many requests.

use anyhow::{Context, Result};
use ragline_core::models::{Dataset, Query, RetrievedDocument};
use ragline_core::parser::ParserRegistry;
use ragline_core::processor::{
    IndexProcessor, ProcessorContext, ProcessorFactory, RetrievalQuery, RetrieveParams,
};
use ragline_core::query::{
    default_pipeline, Clarification, IntentSlotGate, KeywordIntentClassifier,
    ModelExpansionGateway, QueryTransformationTrace, QueryTransformerPipeline,
};
use ragline_core::sampling::SamplingDecider;
use ragline_core::store::memory::{InMemoryKeywordStore, InMemoryVectorStore};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::extract::parser_registry;
use crate::ingest::{ingest_dir, IngestSummary};
use crate::provider::ModelRegistry;

const MEMORY_BACKEND: &str = "memory";

/// One `ask` request.
#[derive(Debug, Clone, Default)]
pub struct AskRequest {
    pub query: String,
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Include the transformation trace even when the request is not
    /// sampled.
    pub include_trace: bool,
}

impl AskRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub trace_id: String,
    pub sampled: bool,
    pub queries: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,
    pub results: Vec<RetrievedDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<QueryTransformationTrace>,
}

pub struct Engine {
    config: Config,
    dataset: Dataset,
    parsers: Arc<ParserRegistry>,
    processor: Arc<dyn IndexProcessor>,
    pipeline: QueryTransformerPipeline,
    sampler: SamplingDecider,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        let models = Arc::new(ModelRegistry::from_config(&config.models)?);
        let parsers = Arc::new(parser_registry());
        let dataset = config.dataset.to_dataset();

        let factory = ProcessorFactory::new(parsers.clone(), models.clone())
            .with_vector_store(MEMORY_BACKEND, Arc::new(InMemoryVectorStore::new()))
            .with_keyword_store(MEMORY_BACKEND, Arc::new(InMemoryKeywordStore::new()));
        let processor = factory.for_dataset(&dataset)?;

        let mut pipeline_config = config.pipeline.clone();
        let expansion_model = match pipeline_config.model_id {
            Some(id) => id,
            None => {
                if pipeline_config.enable_expanding {
                    info!("no pipeline.model_id configured, query expansion disabled");
                }
                pipeline_config.enable_expanding = false;
                dataset.embedding_model_id
            }
        };
        let gateway = Arc::new(ModelExpansionGateway::new(models, expansion_model));
        let gate = if config.intents.is_empty() {
            None
        } else {
            let classifier = Arc::new(KeywordIntentClassifier::new(config.intents.clone()));
            Some(IntentSlotGate::new(classifier, config.slot_templates.clone()))
        };
        let lexicon = (!config.lexicon.is_empty()).then(|| Arc::new(config.lexicon.clone()));
        let pipeline = default_pipeline(pipeline_config, gateway, lexicon, gate)
            .context("invalid [pipeline]")?;
        let sampler = SamplingDecider::new(config.sampling.clone()).context("invalid [sampling]")?;

        debug!(
            dataset = dataset.id,
            doc_form = ?dataset.doc_form,
            stages = ?pipeline.stage_names(),
            "engine ready"
        );
        Ok(Self {
            config,
            dataset,
            parsers,
            processor,
            pipeline,
            sampler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn processor(&self) -> &Arc<dyn IndexProcessor> {
        &self.processor
    }

    pub fn processor_context(&self) -> ProcessorContext {
        ProcessorContext::new(self.dataset.clone(), self.config.chunking.clone())
    }

    pub async fn ingest(&self, root: &Path) -> Result<IngestSummary> {
        ingest_dir(
            root,
            &self.config.ingest,
            &self.parsers,
            self.processor.clone(),
            &self.processor_context(),
        )
        .await
    }

    pub async fn transform(&self, query: &str) -> (Vec<Query>, QueryTransformationTrace) {
        self.pipeline
            .transform_with_trace(Query::new(query))
            .await
    }

    /// Transform, decide sampling, then retrieve unless the intent gate
    /// asked for clarification.
    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse> {
        let trace_id = request
            .trace_id
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let sampled = self.sampler.should_sample_request(
            request.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            Some(&trace_id),
            request.user_id.as_deref(),
        );

        let (queries, trace) = self.transform(&request.query).await;
        if sampled {
            // Sampled traces go to the evaluation log target.
            info!(
                target: "ragline::eval",
                trace_id = %trace_id,
                trace = %serde_json::to_string(&trace)?,
                "sampled query trace"
            );
        }

        let results = if trace.blocks_retrieval() {
            info!(trace_id = %trace_id, "clarification required, retrieval skipped");
            Vec::new()
        } else {
            let retrieval = &self.config.retrieval;
            let mut params = RetrieveParams::new(
                self.dataset.clone(),
                queries.iter().map(RetrievalQuery::from).collect(),
                retrieval.top_k,
            );
            params.strategy = retrieval.strategy;
            params.score_threshold = retrieval.score_threshold;
            params.rerank_model_id = retrieval.rerank_model_id;
            self.processor.retrieve(&params).await?
        };

        Ok(AskResponse {
            trace_id,
            sampled,
            queries: queries.iter().map(|q| q.text().to_string()).collect(),
            clarification: trace.clarification.clone(),
            results,
            trace: (sampled || request.include_trace).then_some(trace),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragline_core::query::StageStatus;

    #[tokio::test]
    async fn expansion_is_off_without_a_chat_model() {
        let engine = Engine::new(Config::minimal()).unwrap();
        let (queries, trace) = engine.transform("  Refund   policy?? ").await;
        let texts: Vec<&str> = queries.iter().map(|q| q.text()).collect();
        assert_eq!(texts, vec!["Refund policy??", "  Refund   policy?? "]);
        let expansion = trace.stage("expansion").unwrap();
        assert_eq!(expansion.status, StageStatus::Skipped);
        assert!(expansion.error.is_none());
    }

    #[tokio::test]
    async fn configured_lexicon_feeds_synonym_recall() {
        let mut config = Config::minimal();
        config.pipeline.enable_synonym_recall = true;
        config.lexicon = ragline_core::query::Lexicon::default()
            .with_synonyms("refund", ["reimbursement"]);
        let engine = Engine::new(config).unwrap();
        let (queries, trace) = engine.transform("refund").await;
        let texts: Vec<&str> = queries.iter().map(|q| q.text()).collect();
        assert_eq!(texts, vec!["refund", "refund reimbursement"]);
        assert_eq!(trace.stage("synonym_recall").unwrap().status, StageStatus::Applied);
    }

    #[tokio::test]
    async fn trace_id_is_generated_and_forced_sampling_includes_trace() {
        let engine = Engine::new(Config::minimal()).unwrap();
        let mut request = AskRequest::new("anything");
        request.headers = vec![("x-eval-force".into(), "true".into())];
        let response = engine.ask(request).await.unwrap();
        assert!(uuid::Uuid::parse_str(&response.trace_id).is_ok());
        assert!(response.sampled);
        assert!(response.trace.is_some());
        assert!(response.results.is_empty());
    }
}
