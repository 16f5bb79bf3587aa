//! Staged query transformation.
//!
//! A [`QueryTransformerPipeline`] runs an ordered list of [`QueryStage`]s
//! over a query list. Every stage execution (or skip) is traced. A stage
//! that returns an error never fails the request: the error is recorded and
//! the pipeline carries on according to the configured
//! [`FallbackPolicy`].
//!
//! After the stages, a final policy is applied:
//!
//! 1. dedup by exact text, keeping first-seen order
//! 2. truncate to `max_queries`
//! 3. with `keep_original`, make sure the raw original text is present by
//!    appending it, or replacing the last entry when at the cap

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::context::{
    FallbackPolicy, PipelineConfig, QueryContext, QueryTransformationTrace, StageStatus,
    StageTrace,
};
use crate::error::Result;
use crate::models::Query;

/// One transformation step.
#[async_trait]
pub trait QueryStage: Send + Sync {
    /// Stable name used in traces and logs.
    fn name(&self) -> &str;

    fn is_enabled(&self, config: &PipelineConfig) -> bool;

    /// Transform `queries` into a replacement list. An empty result means
    /// "no change".
    async fn apply(&self, ctx: &mut QueryContext, queries: Vec<Query>) -> anyhow::Result<Vec<Query>>;
}

/// Ordered stage runner. Cheap to share via `Arc` across requests.
#[derive(Clone)]
pub struct QueryTransformerPipeline {
    config: PipelineConfig,
    stages: Vec<Arc<dyn QueryStage>>,
}

impl std::fmt::Debug for QueryTransformerPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryTransformerPipeline")
            .field("config", &self.config)
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl QueryTransformerPipeline {
    /// Create an empty pipeline. Fails when the config is invalid.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stages: Vec::new(),
        })
    }

    /// Append a stage; stages run in the order they are added.
    pub fn with_stage(mut self, stage: Arc<dyn QueryStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Transform a query into 1..=`max_queries` queries.
    pub async fn transform(&self, query: Query) -> Vec<Query> {
        self.transform_with_trace(query).await.0
    }

    /// Like [`transform`](Self::transform), also returning the full trace.
    pub async fn transform_with_trace(
        &self,
        query: Query,
    ) -> (Vec<Query>, QueryTransformationTrace) {
        let mut ctx = QueryContext::new(query.clone(), self.config.clone());

        if query.text().trim().is_empty() {
            debug!("blank query, skipping all stages");
            let out = vec![query];
            let trace = ctx.into_trace(&out);
            return (out, trace);
        }

        for stage in &self.stages {
            self.run_stage(stage.as_ref(), &mut ctx).await;
        }

        let out = finalize_queries(
            std::mem::take(&mut ctx.current_queries),
            ctx.original_query(),
            &self.config,
        );
        debug!(
            original = ctx.original_query().text(),
            count = out.len(),
            "query transformation finished"
        );
        let trace = ctx.into_trace(&out);
        (out, trace)
    }

    async fn run_stage(&self, stage: &dyn QueryStage, ctx: &mut QueryContext) {
        let name = stage.name();
        let input = ctx.current_queries.clone();

        if !stage.is_enabled(ctx.config()) {
            ctx.push_trace(StageTrace::skipped(name, &input, "disabled"));
            return;
        }
        if ctx.latency_exceeded() {
            warn!(stage = name, "latency budget exhausted, skipping stage");
            ctx.push_trace(StageTrace::skipped(name, &input, "timeout"));
            return;
        }

        let started = Instant::now();
        let result = stage.apply(ctx, input.clone()).await;
        let reported = ctx.take_stage_error();

        match result {
            Ok(output) if output.is_empty() => {
                debug!(stage = name, "stage returned no queries, keeping input");
                let trace = StageTrace::new(name, StageStatus::Applied, &input, &input, started.elapsed())
                    .with_note("empty output; input kept")
                    .with_error(reported);
                ctx.push_trace(trace);
            }
            Ok(output) => {
                // A reported error with nothing changed counts as a failed stage.
                let status = match &reported {
                    Some(err) => {
                        warn!(stage = name, error = %err, "stage degraded");
                        if output == input {
                            StageStatus::Failed
                        } else {
                            StageStatus::Applied
                        }
                    }
                    None => StageStatus::Applied,
                };
                debug!(stage = name, inputs = input.len(), outputs = output.len(), "stage applied");
                let trace = StageTrace::new(name, status, &input, &output, started.elapsed())
                    .with_error(reported);
                ctx.push_trace(trace);
                ctx.current_queries = output;
            }
            Err(e) => {
                warn!(stage = name, error = %format!("{:#}", e), "stage failed");
                let output = match self.config.fallback_policy {
                    FallbackPolicy::SkipStage => input.clone(),
                    FallbackPolicy::OriginalQueryOnly => vec![ctx.original_query().clone()],
                };
                let error = match reported {
                    Some(r) => format!("{:#}; {}", e, r),
                    None => format!("{:#}", e),
                };
                let trace = StageTrace::new(name, StageStatus::Failed, &input, &output, started.elapsed())
                    .with_error(Some(error));
                ctx.push_trace(trace);
                ctx.current_queries = output;
            }
        }
    }
}

/// Dedup, cap and `keep_original` handling. Never returns an empty list.
pub fn finalize_queries(queries: Vec<Query>, original: &Query, config: &PipelineConfig) -> Vec<Query> {
    let max = config.max_queries.max(1);

    let mut seen = HashSet::new();
    let mut out: Vec<Query> = queries
        .into_iter()
        .filter(|q| seen.insert(q.text().to_string()))
        .collect();
    out.truncate(max);

    if config.keep_original && !out.iter().any(|q| q.text() == original.text()) {
        if out.len() >= max {
            out.pop();
        }
        out.push(original.clone());
    }
    if out.is_empty() {
        out.push(original.clone());
    }
    out
}
