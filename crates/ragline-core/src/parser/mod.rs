//! Document parsers and the registry that resolves them by file type.
//!
//! A [`DocumentParser`] turns the bytes of one resource into one or more
//! [`RawDocument`]s. The [`ParserRegistry`] maps lower-cased file types
//! (`"txt"`, `"md"`, ...) to parsers; it is populated once and then only
//! read, so it can be shared freely behind an `Arc`.
//!
//! Text formats ship here ([`text`]). Binary formats (pdf, docx, xlsx,
//! html) are registered by the application crate.

pub mod text;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::{Metadata, RawDocument};

/// Converts one resource into raw text documents.
pub trait DocumentParser: Send + Sync {
    /// Lower-cased file types this parser handles.
    fn supported_types(&self) -> &[&'static str];

    fn supports(&self, file_type: &str) -> bool {
        let wanted = file_type.to_ascii_lowercase();
        self.supported_types().iter().any(|t| *t == wanted)
    }

    /// Parse `resource`. The returned documents carry `file_name` as their
    /// provisional `source_doc_id`; callers overwrite it.
    fn parse(
        &self,
        resource: &[u8],
        file_name: &str,
        extend_params: &Metadata,
    ) -> Result<Vec<RawDocument>>;
}

/// Lower-cased extension of a file name, if any.
pub fn file_type_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase())
}

/// Decode bytes as UTF-8, dropping a leading byte-order mark.
pub fn decode_utf8(resource: &[u8], file_name: &str) -> Result<String> {
    let bytes = resource.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(resource);
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::Parse {
        file_name: file_name.to_string(),
        reason: format!("invalid UTF-8: {}", e),
    })
}

/// File type → parser map.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: BTreeMap<String, Arc<dyn DocumentParser>>,
}

impl ParserRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in text parsers.
    pub fn with_text_parsers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(text::PlainTextParser));
        registry.register(Arc::new(text::MarkdownParser));
        registry.register(Arc::new(text::CsvParser));
        registry.register(Arc::new(text::VttParser));
        registry.register(Arc::new(text::PropertiesParser));
        registry
    }

    /// Register `parser` for every type it supports. A later registration
    /// for the same type replaces the earlier one.
    pub fn register(&mut self, parser: Arc<dyn DocumentParser>) {
        for t in parser.supported_types() {
            self.parsers.insert(t.to_ascii_lowercase(), parser.clone());
        }
    }

    /// Resolve the parser for `file_type` (case-insensitive, exact match).
    pub fn get(&self, file_type: &str) -> Result<Arc<dyn DocumentParser>> {
        self.parsers
            .get(&file_type.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::UnsupportedDocumentType(file_type.to_string()))
    }

    pub fn supports(&self, file_type: &str) -> bool {
        self.parsers.contains_key(&file_type.to_ascii_lowercase())
    }

    /// Registered types, sorted.
    pub fn supported_types(&self) -> Vec<&str> {
        self.parsers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserRegistry")
            .field("types", &self.supported_types())
            .finish()
    }
}
