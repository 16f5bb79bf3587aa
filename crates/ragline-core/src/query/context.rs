//! Request-local state and configuration for one pipeline run.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{Metadata, Query};

/// What the pipeline does with the query list when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Keep the failed stage's input.
    #[default]
    SkipStage,
    /// Reset the list to the original query.
    OriginalQueryOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    /// Normalised queries are cut to this many characters.
    pub max_query_length: usize,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            max_query_length: 512,
        }
    }
}

pub const DEFAULT_EXPANSION_PROMPT: &str = "Generate {count} different versions of a provided user query. \
Each version should be worded differently, using synonyms or alternative sentence structures, \
but they should all retain the original meaning. These versions will be used to retrieve relevant documents. \
It is very important to provide each query version on a separate line, \
without enumerations, hyphens, or any additional formatting!\nUser query: {query}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    /// Number of variants to ask for.
    pub count: usize,
    /// Prompt with `{query}` and `{count}` placeholders.
    pub prompt_template: String,
    pub timeout_ms: u64,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            count: 3,
            prompt_template: DEFAULT_EXPANSION_PROMPT.to_string(),
            timeout_ms: 5_000,
        }
    }
}

/// Limits for [`PrefixCompletionStage`](super::lexicon::PrefixCompletionStage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefixConfig {
    /// Queries shorter than this (in characters) are not completed.
    pub min_prefix_length: usize,
    pub max_candidates: usize,
    /// Only complete queries of at most `short_query_max_len` characters.
    pub only_short_query: bool,
    pub short_query_max_len: usize,
}

impl Default for PrefixConfig {
    fn default() -> Self {
        Self {
            min_prefix_length: 2,
            max_candidates: 5,
            only_short_query: true,
            short_query_max_len: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynonymConfig {
    /// Synonym variants added per query.
    pub top_k: usize,
}

impl Default for SynonymConfig {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

impl ExpansionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn render_prompt(&self, query: &str) -> String {
        self.prompt_template
            .replace("{query}", query)
            .replace("{count}", &self.count.to_string())
    }
}

/// Pipeline switches and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub enable_normalization: bool,
    pub enable_phonetic_correction: bool,
    pub enable_prefix_completion: bool,
    pub enable_synonym_recall: bool,
    pub enable_expanding: bool,
    /// Upper bound on the number of output queries. Must be > 0.
    pub max_queries: usize,
    /// Guarantee the original query text is part of the output.
    pub keep_original: bool,
    pub intent_recognition_enabled: bool,
    /// Chat model used by model-backed stages; `None` means the stage's own
    /// default.
    pub model_id: Option<i64>,
    pub fallback_policy: FallbackPolicy,
    /// Once a run has taken this long, remaining stages are skipped.
    pub max_latency_ms: Option<u64>,
    pub normalization: NormalizationConfig,
    pub prefix: PrefixConfig,
    pub synonym: SynonymConfig,
    pub expansion: ExpansionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_normalization: true,
            enable_phonetic_correction: false,
            enable_prefix_completion: false,
            enable_synonym_recall: false,
            enable_expanding: true,
            max_queries: 5,
            keep_original: true,
            intent_recognition_enabled: false,
            model_id: None,
            fallback_policy: FallbackPolicy::SkipStage,
            max_latency_ms: None,
            normalization: NormalizationConfig::default(),
            prefix: PrefixConfig::default(),
            synonym: SynonymConfig::default(),
            expansion: ExpansionConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_queries == 0 {
            return Err(Error::InvalidConfiguration(
                "pipeline.max_queries must be > 0".to_string(),
            ));
        }
        if self.normalization.max_query_length == 0 {
            return Err(Error::InvalidConfiguration(
                "pipeline.normalization.max_query_length must be > 0".to_string(),
            ));
        }
        if self.enable_prefix_completion && self.prefix.max_candidates == 0 {
            return Err(Error::InvalidConfiguration(
                "pipeline.prefix.max_candidates must be > 0 when prefix completion is enabled"
                    .to_string(),
            ));
        }
        if self.enable_synonym_recall && self.synonym.top_k == 0 {
            return Err(Error::InvalidConfiguration(
                "pipeline.synonym.top_k must be > 0 when synonym recall is enabled".to_string(),
            ));
        }
        if self.enable_expanding && self.expansion.count == 0 {
            return Err(Error::InvalidConfiguration(
                "pipeline.expansion.count must be > 0 when expansion is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_latency(&self) -> Option<Duration> {
        self.max_latency_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Applied,
    Skipped,
    Failed,
}

/// Record of one stage execution (or skip).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTrace {
    pub stage_name: String,
    pub status: StageStatus,
    pub input_queries: Vec<String>,
    pub output_queries: Vec<String>,
    /// Output texts absent from the input.
    pub added: Vec<String>,
    /// Input texts absent from the output.
    pub removed: Vec<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn texts(queries: &[Query]) -> Vec<String> {
    queries.iter().map(|q| q.text().to_string()).collect()
}

fn comparable(text: &str) -> String {
    text.trim().to_lowercase()
}

fn difference(from: &[String], against: &[String]) -> Vec<String> {
    let seen: HashSet<String> = against.iter().map(|t| comparable(t)).collect();
    let mut emitted = HashSet::new();
    from.iter()
        .filter(|t| !seen.contains(&comparable(t)) && emitted.insert(comparable(t)))
        .cloned()
        .collect()
}

impl StageTrace {
    pub fn new(
        stage_name: &str,
        status: StageStatus,
        input: &[Query],
        output: &[Query],
        duration: Duration,
    ) -> Self {
        let input_queries = texts(input);
        let output_queries = texts(output);
        Self {
            stage_name: stage_name.to_string(),
            status,
            added: difference(&output_queries, &input_queries),
            removed: difference(&input_queries, &output_queries),
            input_queries,
            output_queries,
            duration_ms: duration.as_millis() as u64,
            error: None,
            note: None,
        }
    }

    /// A stage that did not run; its output equals its input.
    pub fn skipped(stage_name: &str, input: &[Query], note: &str) -> Self {
        Self::new(stage_name, StageStatus::Skipped, input, input, Duration::ZERO).with_note(note)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }
}

/// Outcome of the intent/slot gate when required slots are missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub intent_code: String,
    /// Missing required slot names, in slot order.
    pub missing_slots: Vec<String>,
    pub questions: Vec<String>,
    pub extracted_slots: Metadata,
    /// Retrieval must not run for this request.
    pub block_retrieval: bool,
}

/// Mutable state of one pipeline run.
///
/// Created per request and never shared between requests.
#[derive(Debug)]
pub struct QueryContext {
    original_query: Query,
    pub current_queries: Vec<Query>,
    config: PipelineConfig,
    stage_traces: Vec<StageTrace>,
    attributes: Metadata,
    clarification: Option<Clarification>,
    stage_error: Option<String>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl QueryContext {
    pub fn new(original_query: Query, config: PipelineConfig) -> Self {
        Self {
            current_queries: vec![original_query.clone()],
            original_query,
            config,
            stage_traces: Vec::new(),
            attributes: Metadata::new(),
            clarification: None,
            stage_error: None,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn original_query(&self) -> &Query {
        &self.original_query
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stage_traces(&self) -> &[StageTrace] {
        &self.stage_traces
    }

    pub(crate) fn push_trace(&mut self, trace: StageTrace) {
        self.stage_traces.push(trace);
    }

    pub fn attributes(&self) -> &Metadata {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn clarification(&self) -> Option<&Clarification> {
        self.clarification.as_ref()
    }

    pub fn set_clarification(&mut self, clarification: Clarification) {
        self.clarification = Some(clarification);
    }

    /// Record a problem the running stage recovered from. The message lands
    /// in that stage's trace; the stage's output is still used.
    pub fn report_stage_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.stage_error = Some(match self.stage_error.take() {
            Some(prev) => format!("{}; {}", prev, message),
            None => message,
        });
    }

    pub(crate) fn take_stage_error(&mut self) -> Option<String> {
        self.stage_error.take()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub(crate) fn latency_exceeded(&self) -> bool {
        self.config
            .max_latency()
            .is_some_and(|budget| self.elapsed() >= budget)
    }

    pub(crate) fn into_trace(self, final_queries: &[Query]) -> QueryTransformationTrace {
        QueryTransformationTrace {
            original_query: self.original_query.text().to_string(),
            started_at: self.started_at,
            total_duration_ms: self.started.elapsed().as_millis() as u64,
            stages: self.stage_traces,
            final_queries: texts(final_queries),
            attributes: self.attributes,
            clarification: self.clarification,
        }
    }
}

/// Full debugging record of one `transform_with_trace` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryTransformationTrace {
    pub original_query: String,
    pub started_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub stages: Vec<StageTrace>,
    pub final_queries: Vec<String>,
    pub attributes: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,
}

impl QueryTransformationTrace {
    pub fn stage(&self, name: &str) -> Option<&StageTrace> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    /// Whether retrieval should be suppressed for this request.
    pub fn blocks_retrieval(&self) -> bool {
        self.clarification
            .as_ref()
            .is_some_and(|c| c.block_retrieval)
    }
}
