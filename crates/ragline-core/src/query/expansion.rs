//! LLM-backed query expansion.
//!
//! Each input query is sent to a [`QueryExpansionGateway`] with a prompt
//! asking for paraphrases. The reply is parsed one query per line. The stage
//! degrades instead of failing: on timeout, model error or an unparsable
//! reply the input query is kept and the problem is reported into the
//! stage trace.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use tracing::debug;

use super::context::{PipelineConfig, QueryContext};
use super::normalize::normalize;
use super::pipeline::QueryStage;
use crate::model::ModelProvider;
use crate::models::Query;

/// Upper bound for one parsed line.
const MAX_LINE_CHARS: usize = 512;

/// Parse a model reply into at most `max` query strings.
///
/// Every line is cleaned with the normalisation rules (ordinal and bullet
/// markers, quotes, whitespace); blank lines and repeats are dropped.
pub fn parse_expanded_queries(text: &str, max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(|line| normalize(line, MAX_LINE_CHARS))
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(line.to_lowercase()))
        .take(max)
        .collect()
}

/// Text generation capability used by [`ExpansionStage`].
#[async_trait]
pub trait QueryExpansionGateway: Send + Sync {
    /// Run the expansion prompt and return the raw reply.
    async fn generate_expansion(&self, prompt: &str, model_id: Option<i64>) -> anyhow::Result<String>;

    fn parse_expanded_queries(&self, text: &str, max: usize) -> Vec<String> {
        parse_expanded_queries(text, max)
    }
}

/// Adapts a [`ModelProvider`] chat model to [`QueryExpansionGateway`].
pub struct ModelExpansionGateway {
    provider: Arc<dyn ModelProvider>,
    default_model_id: i64,
}

impl ModelExpansionGateway {
    pub fn new(provider: Arc<dyn ModelProvider>, default_model_id: i64) -> Self {
        Self {
            provider,
            default_model_id,
        }
    }
}

#[async_trait]
impl QueryExpansionGateway for ModelExpansionGateway {
    async fn generate_expansion(&self, prompt: &str, model_id: Option<i64>) -> anyhow::Result<String> {
        let id = model_id.unwrap_or(self.default_model_id);
        Ok(self.provider.chat(id, prompt).await?)
    }
}

pub struct ExpansionStage {
    gateway: Arc<dyn QueryExpansionGateway>,
}

impl ExpansionStage {
    pub const NAME: &'static str = "expansion";

    pub fn new(gateway: Arc<dyn QueryExpansionGateway>) -> Self {
        Self { gateway }
    }

    /// Paraphrases of `query`, not including `query` itself.
    pub async fn expand(&self, query: &Query, config: &PipelineConfig) -> anyhow::Result<Vec<Query>> {
        let prompt = config.expansion.render_prompt(query.text());
        let timeout = config.expansion.timeout();

        let reply = tokio::time::timeout(timeout, self.gateway.generate_expansion(&prompt, config.model_id))
            .await
            .map_err(|_| anyhow!("expansion timed out after {}ms", timeout.as_millis()))?
            .context("expansion model call failed")?;

        let variants: Vec<Query> = self
            .gateway
            .parse_expanded_queries(&reply, config.max_queries)
            .into_iter()
            .filter(|v| v.to_lowercase() != query.text().to_lowercase())
            .map(|v| query.with_text(v))
            .collect();

        if variants.is_empty() {
            return Err(anyhow!("no expansions parsed from model reply"));
        }
        Ok(variants)
    }
}

#[async_trait]
impl QueryStage for ExpansionStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_enabled(&self, config: &PipelineConfig) -> bool {
        config.enable_expanding
    }

    async fn apply(&self, ctx: &mut QueryContext, queries: Vec<Query>) -> anyhow::Result<Vec<Query>> {
        let mut out = Vec::with_capacity(queries.len() * 2);
        for query in queries {
            if query.text().trim().is_empty() {
                out.push(query);
                continue;
            }
            let expanded = self.expand(&query, ctx.config()).await;
            match expanded {
                Ok(variants) => {
                    debug!(query = query.text(), variants = variants.len(), "query expanded");
                    out.push(query);
                    out.extend(variants);
                }
                Err(e) => {
                    ctx.report_stage_error(format!("{:#}", e));
                    out.push(query);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::context::ExpansionConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Canned {
        reply: anyhow::Result<String>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Canned {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl QueryExpansionGateway for Canned {
        async fn generate_expansion(&self, _: &str, _: Option<i64>) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(anyhow!("{}", e)),
            }
        }
    }

    #[test]
    fn parse_cleans_lines() {
        let reply = "1. How do refunds work?\n\n- \"Refund timeline\"\n2) how do refunds work?\n  \n3. Return policy";
        assert_eq!(
            parse_expanded_queries(reply, 5),
            vec!["How do refunds work?", "Refund timeline", "Return policy"]
        );
        assert_eq!(parse_expanded_queries(reply, 1).len(), 1);
        assert!(parse_expanded_queries("  \n \n", 3).is_empty());
    }

    #[tokio::test]
    async fn expansion_appends_variants() {
        let stage = ExpansionStage::new(Canned::ok("refund timeline\nreturn policy"));
        let mut ctx = QueryContext::new(Query::new("refund"), PipelineConfig::default());
        let out = stage.apply(&mut ctx, vec![Query::new("refund")]).await.unwrap();
        let texts: Vec<&str> = out.iter().map(|q| q.text()).collect();
        assert_eq!(texts, vec!["refund", "refund timeline", "return policy"]);
        assert!(ctx.take_stage_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_input_and_reports() {
        let gateway = Arc::new(Canned {
            reply: Ok("late".to_string()),
            delay: Duration::from_secs(60),
            calls: AtomicUsize::new(0),
        });
        let config = PipelineConfig {
            expansion: ExpansionConfig {
                timeout_ms: 100,
                ..Default::default()
            },
            ..Default::default()
        };
        let stage = ExpansionStage::new(gateway);
        let mut ctx = QueryContext::new(Query::new("refund"), config);
        let out = stage.apply(&mut ctx, vec![Query::new("refund")]).await.unwrap();
        assert_eq!(out, vec![Query::new("refund")]);
        assert!(ctx.take_stage_error().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn model_error_keeps_input() {
        let gateway = Arc::new(Canned {
            reply: Err(anyhow!("503 from upstream")),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        });
        let stage = ExpansionStage::new(gateway);
        let mut ctx = QueryContext::new(Query::new("q"), PipelineConfig::default());
        let out = stage.apply(&mut ctx, vec![Query::new("q")]).await.unwrap();
        assert_eq!(out, vec![Query::new("q")]);
        assert!(ctx.take_stage_error().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn blank_query_skips_model_call() {
        let gateway = Canned::ok("anything");
        let stage = ExpansionStage::new(gateway.clone());
        let mut ctx = QueryContext::new(Query::new("q"), PipelineConfig::default());
        let out = stage.apply(&mut ctx, vec![Query::new("  ")]).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unparsable_reply_is_reported() {
        let stage = ExpansionStage::new(Canned::ok("\n  \n"));
        let mut ctx = QueryContext::new(Query::new("q"), PipelineConfig::default());
        let out = stage.apply(&mut ctx, vec![Query::new("q")]).await.unwrap();
        assert_eq!(out, vec![Query::new("q")]);
        assert!(ctx.take_stage_error().is_some());
    }
}
