//! Dictionary-driven rewrites that run without a model.
//!
//! | Stage | Adds |
//! |-------|------|
//! | [`PhoneticCorrectionStage`] | the query with known misspellings or homophones replaced |
//! | [`PrefixCompletionStage`] | dictionary words that a short query is a prefix of |
//! | [`SynonymRecallStage`] | the query followed by a synonym of one of its terms |
//!
//! Every stage keeps its input queries first and appends variants, so a
//! missing dictionary entry is a no-op rather than a failure.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::context::{PipelineConfig, QueryContext};
use super::pipeline::QueryStage;
use crate::models::Query;

/// Word lists shared by the lexicon stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lexicon {
    /// Wrong form → right form, replaced as substrings. Longer keys are
    /// applied first.
    pub corrections: BTreeMap<String, String>,
    /// Completion candidates, in preference order.
    pub prefix_words: Vec<String>,
    /// Term → synonyms. Terms match case-insensitively.
    pub synonyms: BTreeMap<String, Vec<String>>,
}

impl Lexicon {
    pub fn is_empty(&self) -> bool {
        self.corrections.is_empty() && self.prefix_words.is_empty() && self.synonyms.is_empty()
    }

    pub fn with_correction(mut self, wrong: impl Into<String>, right: impl Into<String>) -> Self {
        self.corrections.insert(wrong.into(), right.into());
        self
    }

    pub fn with_prefix_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_words.extend(words.into_iter().map(Into::into));
        self
    }

    pub fn with_synonyms<I, S>(mut self, term: impl Into<String>, synonyms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.synonyms
            .entry(term.into().to_lowercase())
            .or_default()
            .extend(synonyms.into_iter().map(Into::into));
        self
    }

    /// `text` with every correction applied, or `None` when nothing matched.
    pub fn correct(&self, text: &str) -> Option<String> {
        let mut keys: Vec<&String> = self.corrections.keys().filter(|k| !k.is_empty()).collect();
        keys.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));

        let mut out = text.to_string();
        for key in keys {
            if out.contains(key.as_str()) {
                out = out.replace(key.as_str(), &self.corrections[key]);
            }
        }
        (out != text).then_some(out)
    }

    /// Up to `max` words starting with `prefix` (case-insensitive), other
    /// than `prefix` itself.
    pub fn complete(&self, prefix: &str, max: usize) -> Vec<String> {
        let lower = prefix.to_lowercase();
        self.prefix_words
            .iter()
            .filter(|w| w.as_str() != prefix && w.to_lowercase().starts_with(&lower))
            .take(max)
            .cloned()
            .collect()
    }

    /// Synonyms of the terms in `text`, in term order, without repeats or
    /// words the text already contains.
    pub fn synonyms_for(&self, text: &str, max: usize) -> Vec<String> {
        let lower = text.to_lowercase();
        let terms = extract_terms(&lower);
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        let matched = self.synonyms.iter().filter(|(term, _)| {
            terms.contains(term.to_lowercase().as_str())
                || (!term.is_ascii() && lower.contains(term.to_lowercase().as_str()))
        });
        for (_, synonyms) in matched {
            for synonym in synonyms {
                let key = synonym.trim().to_lowercase();
                if key.is_empty() || lower.contains(&key) || !seen.insert(key) {
                    continue;
                }
                out.push(synonym.trim().to_string());
                if out.len() >= max {
                    return out;
                }
            }
        }
        out
    }
}

/// Whitespace- and punctuation-separated terms longer than one character.
fn extract_terms(text: &str) -> HashSet<&str> {
    text.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .map(str::trim)
        .filter(|t| t.chars().count() > 1)
        .collect()
}

fn dedup(queries: Vec<Query>, key: impl Fn(&Query) -> String) -> Vec<Query> {
    let mut seen = HashSet::new();
    queries.into_iter().filter(|q| seen.insert(key(q))).collect()
}

/// Adds a corrected copy of each query whose text contains a known
/// misspelling or homophone.
pub struct PhoneticCorrectionStage {
    lexicon: Arc<Lexicon>,
}

impl PhoneticCorrectionStage {
    pub const NAME: &'static str = "phonetic_correction";

    pub fn new(lexicon: Arc<Lexicon>) -> Self {
        Self { lexicon }
    }
}

#[async_trait]
impl QueryStage for PhoneticCorrectionStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_enabled(&self, config: &PipelineConfig) -> bool {
        config.enable_phonetic_correction
    }

    async fn apply(&self, _ctx: &mut QueryContext, queries: Vec<Query>) -> anyhow::Result<Vec<Query>> {
        let mut out = Vec::with_capacity(queries.len() * 2);
        for q in queries {
            let corrected = self.lexicon.correct(q.text());
            out.push(q.clone());
            if let Some(text) = corrected.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
                debug!(from = q.text(), to = %text, "corrected query");
                out.push(q.with_text(text));
            }
        }
        Ok(dedup(out, |q| q.text().trim().to_string()))
    }
}

/// Adds dictionary completions for short queries, e.g. `"ref"` →
/// `"refund"`.
pub struct PrefixCompletionStage {
    lexicon: Arc<Lexicon>,
}

impl PrefixCompletionStage {
    pub const NAME: &'static str = "prefix_completion";

    pub fn new(lexicon: Arc<Lexicon>) -> Self {
        Self { lexicon }
    }
}

#[async_trait]
impl QueryStage for PrefixCompletionStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_enabled(&self, config: &PipelineConfig) -> bool {
        config.enable_prefix_completion
    }

    async fn apply(&self, ctx: &mut QueryContext, queries: Vec<Query>) -> anyhow::Result<Vec<Query>> {
        let cfg = ctx.config().prefix.clone();
        let mut out = queries.clone();
        for q in &queries {
            let text = q.text().trim();
            let len = text.chars().count();
            if len < cfg.min_prefix_length || (cfg.only_short_query && len > cfg.short_query_max_len) {
                continue;
            }
            out.extend(
                self.lexicon
                    .complete(text, cfg.max_candidates)
                    .into_iter()
                    .map(|c| q.with_text(c)),
            );
        }
        Ok(dedup(out, |q| q.text().trim().to_string()))
    }
}

/// Adds `"<query> <synonym>"` for synonyms of the query's terms.
pub struct SynonymRecallStage {
    lexicon: Arc<Lexicon>,
}

impl SynonymRecallStage {
    pub const NAME: &'static str = "synonym_recall";

    pub fn new(lexicon: Arc<Lexicon>) -> Self {
        Self { lexicon }
    }
}

#[async_trait]
impl QueryStage for SynonymRecallStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_enabled(&self, config: &PipelineConfig) -> bool {
        config.enable_synonym_recall
    }

    async fn apply(&self, ctx: &mut QueryContext, queries: Vec<Query>) -> anyhow::Result<Vec<Query>> {
        let top_k = ctx.config().synonym.top_k;
        let mut out = queries.clone();
        for q in &queries {
            for synonym in self.lexicon.synonyms_for(q.text(), top_k) {
                out.push(q.with_text(format!("{} {}", q.text().trim(), synonym)));
            }
        }
        Ok(dedup(out, |q| q.text().trim().to_lowercase()))
    }
}
