//! Core data models shared by the query and index pipelines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form metadata attached to queries, documents and chunks.
pub type Metadata = serde_json::Map<String, Value>;

/// An immutable retrieval query.
///
/// Stages never mutate a `Query`; they build new values with
/// [`Query::with_text`] or [`Query::with_metadata`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    text: String,
    #[serde(default)]
    metadata: Metadata,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_meta(text: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            text: text.into(),
            metadata,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// A new query with different text and the same metadata.
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: self.metadata.clone(),
        }
    }

    /// A new query with one extra metadata entry.
    pub fn with_metadata(&self, key: impl Into<String>, value: Value) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.insert(key.into(), value);
        Self {
            text: self.text.clone(),
            metadata,
        }
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::new(text)
    }
}

/// How chunks of a dataset are embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexingTechnique {
    /// Chunks are embedded and written to the vector store.
    #[default]
    HighQuality,
    /// Keyword index only; no embedding calls.
    Economy,
}

/// Shape of the chunks produced for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocForm {
    /// Flat chunks.
    #[default]
    Text,
    /// Parent chunks for context, child chunks for matching.
    ParentChild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    #[default]
    Enabled,
    Disabled,
}

/// A logical knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    name: String,
    status: DatasetStatus,
    /// Registered vector backend name, e.g. `"memory"`.
    pub vector_store: String,
    /// Registered keyword backend name.
    pub keyword_store: String,
    pub embedding_model_id: i64,
    #[serde(default)]
    pub indexing_technique: IndexingTechnique,
    #[serde(default)]
    pub doc_form: DocForm,
}

impl Dataset {
    pub fn new(id: i64, name: impl Into<String>, embedding_model_id: i64) -> Self {
        Self {
            id,
            name: name.into(),
            status: DatasetStatus::Enabled,
            vector_store: "memory".to_string(),
            keyword_store: "memory".to_string(),
            embedding_model_id,
            indexing_technique: IndexingTechnique::HighQuality,
            doc_form: DocForm::Text,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> DatasetStatus {
        self.status
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_status(&mut self, status: DatasetStatus) {
        self.status = status;
    }
}

/// One unit of extracted text (a file, a worksheet, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub source_doc_id: String,
    pub text: String,
    pub metadata: Metadata,
}

impl RawDocument {
    pub fn new(source_doc_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_doc_id: source_doc_id.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }
}

/// A token-bounded slice of a source document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Stable id derived from the source document and section index.
    pub id: String,
    pub source_doc_id: String,
    /// Zero-based, contiguous within one source document.
    pub section_index: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    pub metadata: Metadata,
}

/// A retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedDocument {
    pub chunk_id: String,
    pub source_doc_id: String,
    pub text: String,
    pub score: f64,
    pub metadata: Metadata,
}
