//! TOML configuration.
//!
//! Every section is optional; omitted sections take their defaults. See
//! `config/ragline.example.toml` for a complete file.

use anyhow::{bail, Context, Result};
use ragline_core::models::{Dataset, DocForm, IndexingTechnique};
use ragline_core::query::{IntentRule, Lexicon, PipelineConfig, SlotTemplate};
use ragline_core::sampling::SamplingConfig;
use ragline_core::search::MergeStrategy;
use ragline_core::splitter::ProcessRule;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ProcessRule,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Dictionaries for the correction, prefix and synonym stages.
    #[serde(default)]
    pub lexicon: Lexicon,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub intents: Vec<IntentRule>,
    #[serde(default)]
    pub slot_templates: Vec<SlotTemplate>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub strategy: MergeStrategy,
    #[serde(default)]
    pub score_threshold: Option<f64>,
    #[serde(default)]
    pub rerank_model_id: Option<i64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            strategy: MergeStrategy::default(),
            score_threshold: None,
            rerank_model_id: None,
        }
    }
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    #[serde(default = "default_dataset_id")]
    pub id: i64,
    #[serde(default = "default_dataset_name")]
    pub name: String,
    #[serde(default = "default_model_id")]
    pub embedding_model_id: i64,
    #[serde(default)]
    pub indexing_technique: IndexingTechnique,
    #[serde(default)]
    pub doc_form: DocForm,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            id: default_dataset_id(),
            name: default_dataset_name(),
            embedding_model_id: default_model_id(),
            indexing_technique: IndexingTechnique::default(),
            doc_form: DocForm::default(),
        }
    }
}

impl DatasetConfig {
    pub fn to_dataset(&self) -> Dataset {
        let mut dataset = Dataset::new(self.id, self.name.clone(), self.embedding_model_id);
        dataset.indexing_technique = self.indexing_technique;
        dataset.doc_form = self.doc_form;
        dataset
    }
}

fn default_dataset_id() -> i64 {
    1
}
fn default_dataset_name() -> String {
    "default".to_string()
}
fn default_model_id() -> i64 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_with_keywords")]
    pub with_keywords: bool,
    /// Larger files are skipped.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            concurrency: default_concurrency(),
            with_keywords: default_with_keywords(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_concurrency() -> usize {
    4
}
fn default_with_keywords() -> bool {
    true
}
fn default_max_file_bytes() -> u64 {
    20 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// OpenAI-compatible HTTP API.
    Openai,
    /// ONNX embedding model run in process by fastembed; `name` picks the
    /// model. Needs the `local-embeddings-fastembed` feature.
    Local,
    /// Feature-hashing embeddings. No download, no network.
    Hashing,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub id: i64,
    /// Model name sent to the API.
    pub name: String,
    pub kind: ModelKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

impl Config {
    /// Defaults plus one local model with id 1, so every command works
    /// without a config file.
    pub fn minimal() -> Self {
        Self {
            models: vec![ModelConfig {
                id: default_model_id(),
                name: "hashing".to_string(),
                kind: ModelKind::Hashing,
                base_url: None,
                api_key_env: default_api_key_env(),
                dims: None,
                timeout_secs: default_timeout_secs(),
                max_retries: default_max_retries(),
            }],
            ..Default::default()
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    config
        .chunking
        .effective_segmentation()
        .context("invalid [chunking]")?;
    config
        .chunking
        .effective_subchunk()
        .context("invalid [chunking.subchunk_segmentation]")?;
    config.pipeline.validate().context("invalid [pipeline]")?;

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    config
        .retrieval
        .strategy
        .validate()
        .context("invalid [retrieval.strategy]")?;

    if !(0.0..=1.0).contains(&config.sampling.rate) {
        bail!("sampling.rate must be in [0.0, 1.0]");
    }
    if config.ingest.concurrency == 0 {
        bail!("ingest.concurrency must be >= 1");
    }

    let mut ids = HashSet::new();
    for model in &config.models {
        if !ids.insert(model.id) {
            bail!("duplicate model id {} in [[models]]", model.id);
        }
        if model.name.trim().is_empty() {
            bail!("models.name must be set for model {}", model.id);
        }
        if model.dims == Some(0) {
            bail!("models.dims must be > 0 for model {}", model.id);
        }
    }

    let needs_embedding = config.dataset.indexing_technique == IndexingTechnique::HighQuality;
    if needs_embedding && !ids.contains(&config.dataset.embedding_model_id) {
        bail!(
            "dataset.embedding_model_id {} is not defined in [[models]]",
            config.dataset.embedding_model_id
        );
    }
    if let Some(id) = config.pipeline.model_id {
        if !ids.contains(&id) {
            bail!("pipeline.model_id {} is not defined in [[models]]", id);
        }
    }
    if let Some(id) = config.retrieval.rerank_model_id {
        if !ids.contains(&id) {
            bail!("retrieval.rerank_model_id {} is not defined in [[models]]", id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragline_core::splitter::ProcessMode;

    const FULL: &str = r#"
[chunking]
mode = "custom"

[chunking.segmentation]
max_tokens = 300
chunk_overlap = 30

[pipeline]
max_queries = 4
model_id = 2
intent_recognition_enabled = true

[pipeline.expansion]
count = 2
timeout_ms = 1500

[retrieval]
top_k = 3
rerank_model_id = 1

[retrieval.strategy]
type = "hybrid"
vector_weight = 0.5

[sampling]
rate = 0.25

[dataset]
name = "handbook"
doc_form = "parent_child"

[ingest]
include_globs = ["**/*.md"]
concurrency = 2

[[models]]
id = 1
name = "hashing"
kind = "hashing"
dims = 128

[[models]]
id = 2
name = "gpt-4o-mini"
kind = "openai"
base_url = "http://localhost:8080/v1"

[[intents]]
code = "order_status"
keywords = ["order", "where is"]

[[slot_templates]]
intent_code = "order_status"
block_retrieval_on_missing = true

[[slot_templates.slots]]
name = "order_id"
type = "integer"
required = true
"#;

    #[test]
    fn parses_full_config() {
        let config = parse_config(FULL).unwrap();
        assert_eq!(config.chunking.mode, ProcessMode::Custom);
        assert_eq!(config.chunking.segmentation.max_tokens, 300);
        assert_eq!(config.pipeline.max_queries, 4);
        assert_eq!(config.pipeline.expansion.timeout_ms, 1500);
        assert_eq!(config.retrieval.strategy, MergeStrategy::Hybrid { vector_weight: 0.5 });
        assert_eq!(config.dataset.to_dataset().doc_form, DocForm::ParentChild);
        assert_eq!(config.models[1].kind, ModelKind::Openai);
        assert_eq!(config.models[1].api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.intents[0].keywords.len(), 2);
        assert!(config.slot_templates[0].slots[0].required);
    }

    #[test]
    fn empty_file_needs_a_model() {
        let err = parse_config("").unwrap_err();
        assert!(format!("{:#}", err).contains("embedding_model_id"));

        let economy = "[dataset]\nindexing_technique = \"economy\"\n";
        let config = parse_config(economy).unwrap();
        assert_eq!(config.retrieval.top_k, 5);
        assert!(config.ingest.with_keywords);
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            "[chunking]\nmode = \"custom\"\n[chunking.segmentation]\nmax_tokens = 10\n",
            "[pipeline]\nmax_queries = 0\n",
            "[retrieval]\ntop_k = 0\n",
            "[sampling]\nrate = 2.0\n",
            "[retrieval.strategy]\ntype = \"hybrid\"\nvector_weight = 1.5\n",
            "[pipeline]\nmodel_id = 9\n",
        ];
        for case in cases {
            let content = format!("{}\n[[models]]\nid = 1\nname = \"h\"\nkind = \"hashing\"\n", case);
            assert!(parse_config(&content).is_err(), "accepted: {}", case);
        }
    }

    #[test]
    fn rejects_duplicate_model_ids() {
        let content = "[[models]]\nid = 1\nname = \"a\"\nkind = \"hashing\"\n\
                       [[models]]\nid = 1\nname = \"b\"\nkind = \"hashing\"\n";
        assert!(parse_config(content).is_err());
    }

    #[test]
    fn example_config_parses() {
        let config = parse_config(include_str!("../config/ragline.example.toml")).unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.chunking.effective_subchunk().unwrap().max_tokens, 120);
        assert!(config.pipeline.enable_synonym_recall);
        assert_eq!(config.lexicon.synonyms["refund"].len(), 2);
        assert_eq!(
            config.slot_templates[0].clarification_templates["order_id"],
            "Which order number should I look up?"
        );
    }

    #[test]
    fn lexicon_section_parses() {
        let content = r#"
[pipeline]
enable_synonym_recall = true
enable_prefix_completion = true

[pipeline.prefix]
max_candidates = 3

[lexicon]
prefix_words = ["refund", "return label"]

[lexicon.corrections]
recieve = "receive"

[lexicon.synonyms]
refund = ["reimbursement", "money back"]

[[models]]
id = 1
name = "h"
kind = "hashing"
"#;
        let config = parse_config(content).unwrap();
        assert!(config.pipeline.enable_synonym_recall);
        assert_eq!(config.pipeline.prefix.max_candidates, 3);
        assert_eq!(config.pipeline.prefix.short_query_max_len, 5);
        assert_eq!(config.lexicon.prefix_words.len(), 2);
        assert_eq!(config.lexicon.corrections["recieve"], "receive");
        assert_eq!(config.lexicon.synonyms["refund"].len(), 2);
    }

    #[test]
    fn minimal_config_is_valid() {
        validate(&Config::minimal()).unwrap();
    }
}
