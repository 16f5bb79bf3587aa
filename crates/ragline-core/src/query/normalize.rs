//! Query text normalisation.
//!
//! Rules, applied until the text stops changing:
//!
//! - control characters removed (whitespace controls become spaces)
//! - surrounding whitespace trimmed
//! - a leading ordinal (`1.`, `2)`, `3：`) or bullet (`-`, `*`, `•`) dropped
//! - one layer of matching surrounding quotes dropped
//! - whitespace runs collapsed to a single space
//! - text cut to `max_query_length` characters

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::context::{PipelineConfig, QueryContext};
use super::pipeline::QueryStage;
use crate::models::Query;

static ORDINAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+[.)：:．\s]+").unwrap());
static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[-*•]\s+").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const QUOTE_PAIRS: &[(char, char)] = &[('"', '"'), ('\'', '\''), ('“', '”'), ('‘', '’')];

/// Normalise `text`. Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(text: &str, max_len: usize) -> String {
    let mut current = normalize_once(text, max_len);
    loop {
        let next = normalize_once(&current, max_len);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn normalize_once(text: &str, max_len: usize) -> String {
    let cleaned: String = text
        .chars()
        .filter_map(|c| match c {
            c if c.is_whitespace() => Some(' '),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();

    let mut s = cleaned.trim();
    if let Some(m) = ORDINAL.find(s) {
        s = &s[m.end()..];
    } else if let Some(m) = BULLET.find(s) {
        s = &s[m.end()..];
    }
    let s = strip_quotes(s.trim());
    let collapsed = WHITESPACE.replace_all(s, " ");

    let truncated: String = collapsed.chars().take(max_len).collect();
    truncated.trim().to_string()
}

fn strip_quotes(s: &str) -> &str {
    for (open, close) in QUOTE_PAIRS {
        if let Some(inner) = s.strip_prefix(*open).and_then(|r| r.strip_suffix(*close)) {
            return inner.trim();
        }
    }
    s
}

/// Applies [`normalize`] to every query; queries that normalise to nothing
/// are dropped.
#[derive(Debug, Default)]
pub struct NormalizationStage;

impl NormalizationStage {
    pub const NAME: &'static str = "normalization";
}

#[async_trait]
impl QueryStage for NormalizationStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_enabled(&self, config: &PipelineConfig) -> bool {
        config.enable_normalization
    }

    async fn apply(&self, ctx: &mut QueryContext, queries: Vec<Query>) -> anyhow::Result<Vec<Query>> {
        let max_len = ctx.config().normalization.max_query_length;
        Ok(queries
            .iter()
            .map(|q| q.with_text(normalize(q.text(), max_len)))
            .filter(|q| !q.text().is_empty())
            .collect())
    }
}
