//! Query transformation: normalise, expand and gate a user query before
//! retrieval.
//!
//! ```text
//! query ─▶ NormalizationStage ─▶ [lexicon stages] ─▶ ExpansionStage ─▶ IntentSlotGate ─▶ final policy
//! ```
//!
//! The lexicon stages (phonetic correction, prefix completion, synonym
//! recall) only join the pipeline when a [`Lexicon`] is supplied.
//!
//! Use [`default_pipeline`] for the standard stage order, or assemble a
//! [`QueryTransformerPipeline`] stage by stage.

pub mod context;
pub mod expansion;
pub mod intent;
pub mod lexicon;
pub mod normalize;
pub mod pipeline;

use std::sync::Arc;

pub use context::{
    Clarification, ExpansionConfig, FallbackPolicy, NormalizationConfig, PipelineConfig,
    PrefixConfig, QueryContext, QueryTransformationTrace, StageStatus, StageTrace, SynonymConfig,
};
pub use expansion::{ExpansionStage, ModelExpansionGateway, QueryExpansionGateway};
pub use intent::{
    IntentClassifier, IntentMatch, IntentRule, IntentSlotGate, KeywordIntentClassifier,
    ModelIntentClassifier, SlotDefinition, SlotTemplate, SlotType,
};
pub use lexicon::{Lexicon, PhoneticCorrectionStage, PrefixCompletionStage, SynonymRecallStage};
pub use normalize::{normalize, NormalizationStage};
pub use pipeline::{QueryStage, QueryTransformerPipeline};

use crate::error::Result;

/// The standard pipeline: normalization, the lexicon stages when a lexicon
/// is supplied, expansion, then the intent/slot gate when a classifier is
/// supplied. Each stage still honours its enable flag in `config`.
pub fn default_pipeline(
    config: PipelineConfig,
    gateway: Arc<dyn QueryExpansionGateway>,
    lexicon: Option<Arc<Lexicon>>,
    gate: Option<IntentSlotGate>,
) -> Result<QueryTransformerPipeline> {
    let mut pipeline = QueryTransformerPipeline::new(config)?.with_stage(Arc::new(NormalizationStage));
    if let Some(lexicon) = lexicon {
        pipeline = pipeline
            .with_stage(Arc::new(PhoneticCorrectionStage::new(lexicon.clone())))
            .with_stage(Arc::new(PrefixCompletionStage::new(lexicon.clone())))
            .with_stage(Arc::new(SynonymRecallStage::new(lexicon)));
    }
    pipeline = pipeline.with_stage(Arc::new(ExpansionStage::new(gateway)));
    if let Some(gate) = gate {
        pipeline = pipeline.with_stage(Arc::new(gate));
    }
    Ok(pipeline)
}
