//! Model providers.
//!
//! [`ModelRegistry`] implements [`ModelProvider`] over the `[[models]]`
//! configured for the run, dispatching each call by model id:
//!
//! - **`openai`** models call an OpenAI-compatible HTTP API
//!   (`/chat/completions`, `/embeddings`) with retry and backoff.
//! - **`local`** models run an ONNX embedding model in process through
//!   fastembed (`local-embeddings-fastembed` feature). The model is
//!   downloaded on first use and cached.
//! - **`hashing`** models compute feature-hashing embeddings. No download and
//!   no network, so they also serve as the offline fallback.
//!
//! Only `openai` models chat. No backend has a dedicated rerank endpoint;
//! `score` is the cosine similarity of the query and passage embeddings.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use ragline_core::keywords::tokenize;
use ragline_core::model::{cosine_similarity, ModelProvider};
use ragline_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
#[cfg(feature = "local-embeddings-fastembed")]
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{ModelConfig, ModelKind};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_HASHING_DIMS: usize = 256;

enum Backend {
    OpenAi(OpenAiModel),
    #[cfg(feature = "local-embeddings-fastembed")]
    Local(FastembedModel),
    Hashing(HashingModel),
}

/// All configured models, addressed by id.
pub struct ModelRegistry {
    models: HashMap<i64, Backend>,
}

impl ModelRegistry {
    pub fn from_config(models: &[ModelConfig]) -> anyhow::Result<Self> {
        let mut map = HashMap::new();
        for m in models {
            let backend = match m.kind {
                ModelKind::Openai => Backend::OpenAi(OpenAiModel::new(m)?),
                #[cfg(feature = "local-embeddings-fastembed")]
                ModelKind::Local => Backend::Local(FastembedModel::new(&m.name)?),
                #[cfg(not(feature = "local-embeddings-fastembed"))]
                ModelKind::Local => bail!(
                    "model {} is kind \"local\", which requires --features local-embeddings-fastembed \
                     (use kind \"hashing\" for an embedder without model files)",
                    m.id
                ),
                ModelKind::Hashing => {
                    Backend::Hashing(HashingModel::new(m.dims.unwrap_or(DEFAULT_HASHING_DIMS)))
                }
            };
            map.insert(m.id, backend);
        }
        Ok(Self { models: map })
    }

    fn get(&self, model_id: i64) -> Result<&Backend> {
        self.models
            .get(&model_id)
            .ok_or(Error::InvalidModelId(model_id))
    }
}

fn unavailable(model_id: i64, err: anyhow::Error) -> Error {
    Error::ModelUnavailable {
        model_id,
        reason: format!("{:#}", err),
    }
}

#[async_trait]
impl ModelProvider for ModelRegistry {
    async fn chat(&self, model_id: i64, prompt: &str) -> Result<String> {
        match self.get(model_id)? {
            Backend::OpenAi(m) => m.chat(prompt).await.map_err(|e| unavailable(model_id, e)),
            _ => Err(unavailable(
                model_id,
                anyhow!("embedding-only models do not support chat"),
            )),
        }
    }

    async fn embed(&self, model_id: i64, text: &str) -> Result<Vec<f32>> {
        match self.get(model_id)? {
            Backend::OpenAi(m) => m.embed(text).await.map_err(|e| unavailable(model_id, e)),
            #[cfg(feature = "local-embeddings-fastembed")]
            Backend::Local(m) => m.embed(text).await.map_err(|e| unavailable(model_id, e)),
            Backend::Hashing(m) => Ok(m.embed(text)),
        }
    }

    async fn score(&self, model_id: i64, query: &str, passage: &str) -> Result<f32> {
        let q = self.embed(model_id, query).await?;
        let p = self.embed(model_id, passage).await?;
        Ok(cosine_similarity(&q, &p))
    }
}

// ============ Local fastembed model ============

/// ONNX embedding model run by fastembed. Loaded on first use; inference
/// runs on the blocking pool.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct FastembedModel {
    model: fastembed::EmbeddingModel,
    loaded: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl FastembedModel {
    pub fn new(name: &str) -> anyhow::Result<Self> {
        Ok(Self {
            model: fastembed_model(name)?,
            loaded: Arc::new(Mutex::new(None)),
        })
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let model = self.model.clone();
        let loaded = self.loaded.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = loaded
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                debug!(model = ?model, "loading local embedding model");
                let embedder = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(embedder);
            }
            let embedder = guard
                .as_mut()
                .ok_or_else(|| anyhow!("local embedding model not loaded"))?;
            let mut vectors = embedder
                .embed(vec![text], None)
                .map_err(|e| anyhow!("Local embedding failed: {}", e))?;
            vectors.pop().ok_or_else(|| anyhow!("Empty local embedding"))
        })
        .await?
    }
}

/// Model names accepted for `kind = "local"`.
pub const LOCAL_MODELS: &[&str] = &[
    "all-minilm-l6-v2",
    "bge-small-en-v1.5",
    "bge-base-en-v1.5",
    "bge-large-en-v1.5",
    "nomic-embed-text-v1.5",
    "multilingual-e5-small",
    "multilingual-e5-base",
    "multilingual-e5-large",
];

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> anyhow::Result<fastembed::EmbeddingModel> {
    use fastembed::EmbeddingModel as M;
    Ok(match name {
        "all-minilm-l6-v2" => M::AllMiniLML6V2,
        "bge-small-en-v1.5" => M::BGESmallENV15,
        "bge-base-en-v1.5" => M::BGEBaseENV15,
        "bge-large-en-v1.5" => M::BGELargeENV15,
        "nomic-embed-text-v1.5" => M::NomicEmbedTextV15,
        "multilingual-e5-small" => M::MultilingualE5Small,
        "multilingual-e5-base" => M::MultilingualE5Base,
        "multilingual-e5-large" => M::MultilingualE5Large,
        other => bail!(
            "Unknown local embedding model '{}'. Supported: {}",
            other,
            LOCAL_MODELS.join(", ")
        ),
    })
}

// ============ Hashing model ============

/// Bag-of-words embeddings: each token is hashed into one of `dims`
/// buckets with a sign, and the result is L2-normalised.
pub struct HashingModel {
    dims: usize,
}

impl HashingModel {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut first = [0u8; 8];
            first.copy_from_slice(&digest[..8]);
            let h = u64::from_be_bytes(first);
            let bucket = (h % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        } else {
            // Empty text still needs a non-empty vector for the store.
            v[0] = 1.0;
        }
        v
    }
}

// ============ OpenAI-compatible model ============

pub struct OpenAiModel {
    name: String,
    base_url: String,
    api_key_env: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiModel {
    pub fn new(config: &ModelConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            name: config.name.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key_env: config.api_key_env.clone(),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn chat(&self, prompt: &str) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": self.name,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0,
        });
        let json = self.post("chat/completions", &body).await?;
        parse_chat_response(&json)
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.name,
            "input": [text],
        });
        let json = self.post("embeddings", &body).await?;
        parse_embedding_response(&json)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }

    /// POST with retry/backoff.
    async fn post(&self, path: &str, body: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        // Keyless local servers are common, so a missing key is not fatal.
        let api_key = std::env::var(&self.api_key_env).ok();
        let url = format!("{}/{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(url = %url, attempt, delay_secs = delay.as_secs(), "retrying model call");
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(body);
            if let Some(key) = &api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(url = %url, status = %status, "model API error, will retry");
                        last_err = Some(anyhow!("model API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("model API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow!("model API request to {} failed: {}", url, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("model call failed after retries")))
    }
}

fn parse_chat_response(json: &serde_json::Value) -> anyhow::Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid chat response: missing choices[0].message.content"))
}

/// Embedding vectors in input order (`data[].index`, falling back to array
/// order).
fn parse_embedding_response(json: &serde_json::Value) -> anyhow::Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid embedding response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid embedding response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
