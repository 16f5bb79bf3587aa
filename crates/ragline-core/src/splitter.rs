//! Token-bounded segment splitter.
//!
//! Splits extracted text into chunks that respect a [`SegmentationRule`]:
//! a token budget (`max_tokens`), a character budget (`max_chunk_size`),
//! an overlap carried between neighbouring chunks (`chunk_overlap`) and a
//! preferred separator.
//!
//! # Algorithm
//!
//! 1. Split the text on `separator` (keeping it at the end of each piece
//!    when `keep_separator` is set) and drop blank pieces.
//! 2. Hard-split any piece over budget at whitespace, then at characters.
//! 3. Accumulate pieces into a window until adding the next one would
//!    exceed either budget; flush the window as a chunk and keep its tail
//!    (up to `chunk_overlap` tokens) as the start of the next one.
//! 4. Drop chunks shorter than `min_chunk_size` characters, unless that
//!    would leave nothing.
//!
//! With [`SplitStrategy::Sentence`] steps 1 and 3 change: the text is cut
//! after sentence-ending punctuation (`. ! ? ; 。 ！ ？ ；`) or blank lines,
//! sentences over [`MAX_SENTENCE_CHARS`] are broken at clause punctuation,
//! and every `sentences_per_chunk` sentences form one chunk. A group is
//! closed early when the next sentence would break the budgets. No overlap
//! is carried between sentence groups.
//!
//! Token counts are estimated: Han/kana/hangul characters count one token
//! each, other alphanumeric words count one, punctuation counts half.
//!
//! # Example
//!
//! ```rust
//! use ragline_core::splitter::{SegmentSplitter, SegmentationRule};
//!
//! let splitter = SegmentSplitter::new(SegmentationRule::default());
//! let chunks = splitter.split("Hello world.\n\nSecond paragraph.");
//! assert_eq!(chunks.len(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Chunk, Metadata, RawDocument};

/// Lowest `max_tokens` accepted for a custom rule.
pub const MIN_MAX_TOKENS: usize = 50;
/// Highest `max_tokens` accepted for a custom rule.
pub const MAX_MAX_TOKENS: usize = 10_000;
/// Sentences longer than this (in characters) are broken at clauses.
pub const MAX_SENTENCE_CHARS: usize = 1000;

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[.!?。！？；;]+|\n\s*\n)\s*").unwrap());
static CLAUSE_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[,，、；:]+\s*").unwrap());

/// How text is cut into pieces before they are packed into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// Cut on `separator` and pack pieces up to the budgets.
    #[default]
    Paragraph,
    /// Cut into sentences and group `sentences_per_chunk` of them.
    Sentence,
}

/// Chunking parameters for one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationRule {
    /// Token budget per chunk.
    pub max_tokens: usize,
    /// Chunks shorter than this (in characters) are dropped.
    pub min_chunk_size: usize,
    /// Character budget per chunk.
    pub max_chunk_size: usize,
    /// Tokens of trailing context repeated at the start of the next chunk.
    pub chunk_overlap: usize,
    pub separator: String,
    pub keep_separator: bool,
    pub strategy: SplitStrategy,
    /// Sentences per chunk under [`SplitStrategy::Sentence`].
    pub sentences_per_chunk: usize,
}

impl Default for SegmentationRule {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            min_chunk_size: 0,
            max_chunk_size: 4000,
            chunk_overlap: 50,
            separator: "\n\n".to_string(),
            keep_separator: false,
            strategy: SplitStrategy::Paragraph,
            sentences_per_chunk: 3,
        }
    }
}

impl SegmentationRule {
    /// Default rule for child chunks in parent/child datasets.
    pub fn default_subchunk() -> Self {
        Self {
            max_tokens: 200,
            min_chunk_size: 0,
            max_chunk_size: 1500,
            chunk_overlap: 20,
            separator: "\n".to_string(),
            keep_separator: false,
            strategy: SplitStrategy::Paragraph,
            sentences_per_chunk: 3,
        }
    }

    /// Check the ranges required of a custom rule.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_MAX_TOKENS..=MAX_MAX_TOKENS).contains(&self.max_tokens) {
            return Err(Error::InvalidSegmentationConfig(format!(
                "max_tokens must be between {} and {}, got {}",
                MIN_MAX_TOKENS, MAX_MAX_TOKENS, self.max_tokens
            )));
        }
        if self.max_chunk_size == 0 {
            return Err(Error::InvalidSegmentationConfig(
                "max_chunk_size must be > 0".to_string(),
            ));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(Error::InvalidSegmentationConfig(format!(
                "min_chunk_size ({}) must not exceed max_chunk_size ({})",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        if self.chunk_overlap >= self.max_tokens {
            return Err(Error::InvalidSegmentationConfig(format!(
                "chunk_overlap ({}) must be smaller than max_tokens ({})",
                self.chunk_overlap, self.max_tokens
            )));
        }
        if self.strategy == SplitStrategy::Sentence && self.sentences_per_chunk == 0 {
            return Err(Error::InvalidSegmentationConfig(
                "sentences_per_chunk must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    #[default]
    Automatic,
    Custom,
}

/// Processing rule attached to an ingest call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProcessRule {
    #[serde(default)]
    pub mode: ProcessMode,
    #[serde(default)]
    pub segmentation: SegmentationRule,
    /// Child rule for parent/child datasets.
    #[serde(default)]
    pub subchunk_segmentation: Option<SegmentationRule>,
}

impl ProcessRule {
    pub fn automatic() -> Self {
        Self::default()
    }

    pub fn custom(segmentation: SegmentationRule) -> Self {
        Self {
            mode: ProcessMode::Custom,
            segmentation,
            subchunk_segmentation: None,
        }
    }

    pub fn is_automatic(&self) -> bool {
        self.mode == ProcessMode::Automatic
    }

    /// The rule to split with. Custom rules are validated; automatic mode
    /// always uses the default rule.
    pub fn effective_segmentation(&self) -> Result<SegmentationRule> {
        if self.is_automatic() {
            return Ok(SegmentationRule::default());
        }
        self.segmentation.validate()?;
        Ok(self.segmentation.clone())
    }

    /// The rule for child chunks.
    pub fn effective_subchunk(&self) -> Result<SegmentationRule> {
        match (&self.subchunk_segmentation, self.is_automatic()) {
            (Some(rule), false) => {
                rule.validate()?;
                Ok(rule.clone())
            }
            _ => Ok(SegmentationRule::default_subchunk()),
        }
    }
}

/// Estimate the token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    let mut per_char = 0usize;
    let mut words = 0usize;
    let mut punct = 0usize;
    let mut in_word = false;

    for ch in text.chars() {
        if is_cjk(ch) {
            per_char += 1;
            in_word = false;
        } else if ch.is_alphanumeric() {
            if !in_word {
                words += 1;
                in_word = true;
            }
        } else {
            in_word = false;
            if !ch.is_whitespace() && !ch.is_control() {
                punct += 1;
            }
        }
    }

    per_char + words + punct.div_ceil(2)
}

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{3040}'..='\u{30FF}'     // hiragana, katakana
        | '\u{3400}'..='\u{4DBF}'   // CJK extension A
        | '\u{4E00}'..='\u{9FFF}'   // CJK unified ideographs
        | '\u{AC00}'..='\u{D7AF}'   // hangul syllables
        | '\u{F900}'..='\u{FAFF}'   // compatibility ideographs
        | '\u{20000}'..='\u{2A6DF}' // extension B
    )
}

#[derive(Debug, Clone)]
struct Piece {
    text: String,
    tokens: usize,
    chars: usize,
}

impl Piece {
    fn new(text: String) -> Self {
        let tokens = estimate_tokens(&text);
        let chars = text.chars().count();
        Self {
            text,
            tokens,
            chars,
        }
    }
}

/// Splits text according to a [`SegmentationRule`].
#[derive(Debug, Clone)]
pub struct SegmentSplitter {
    rule: SegmentationRule,
}

impl SegmentSplitter {
    /// Build a splitter without range validation.
    ///
    /// Use [`ProcessRule::effective_segmentation`] first when the rule comes
    /// from user configuration.
    pub fn new(rule: SegmentationRule) -> Self {
        Self { rule }
    }

    /// Build a splitter for a processing rule, failing fast on invalid
    /// custom rules.
    pub fn for_rule(rule: &ProcessRule) -> Result<Self> {
        Ok(Self::new(rule.effective_segmentation()?))
    }

    pub fn rule(&self) -> &SegmentationRule {
        &self.rule
    }

    fn max_tokens(&self) -> usize {
        self.rule.max_tokens.max(1)
    }

    fn max_chars(&self) -> usize {
        self.rule.max_chunk_size.max(1)
    }

    fn joiner(&self) -> &str {
        if self.rule.keep_separator {
            ""
        } else {
            &self.rule.separator
        }
    }

    fn fits(&self, tokens: usize, chars: usize) -> bool {
        tokens <= self.max_tokens() && chars <= self.max_chars()
    }

    /// Split text into chunk strings. Blank text yields no chunks.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut chunks: Vec<String> = match self.rule.strategy {
            SplitStrategy::Paragraph => {
                let pieces = self.bounded(self.split_on_separator(text));
                self.merge(pieces)
                    .iter()
                    .map(|w| self.join(&w.pieces))
                    .collect()
            }
            SplitStrategy::Sentence => {
                let sentences = split_sentences(text)
                    .into_iter()
                    .flat_map(|s| break_long_sentence(&s))
                    .collect();
                self.group_sentences(self.bounded(sentences))
            }
        }
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

        let min = self.rule.min_chunk_size;
        if min > 0 && chunks.iter().any(|c| c.chars().count() >= min) {
            chunks.retain(|c| c.chars().count() >= min);
        }
        chunks
    }

    /// Split one raw document into [`Chunk`]s whose section indices start at
    /// `first_index`.
    pub fn split_document(&self, doc: &RawDocument, first_index: usize) -> Vec<Chunk> {
        self.split(&doc.text)
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                make_chunk(
                    &doc.source_doc_id,
                    first_index + i,
                    &text,
                    doc.metadata.clone(),
                )
            })
            .collect()
    }

    /// Turn raw pieces into [`Piece`]s, hard-splitting any over budget.
    fn bounded(&self, raw: Vec<String>) -> Vec<Piece> {
        let mut pieces = Vec::with_capacity(raw.len());
        for text in raw {
            let piece = Piece::new(text);
            if self.fits(piece.tokens, piece.chars) {
                pieces.push(piece);
            } else {
                pieces.extend(self.hard_split(&piece.text));
            }
        }
        pieces
    }

    /// Concatenate consecutive sentences, at most `sentences_per_chunk` per
    /// chunk and within the budgets.
    fn group_sentences(&self, sentences: Vec<Piece>) -> Vec<String> {
        let per_chunk = self.rule.sentences_per_chunk.max(1);
        let mut out = Vec::new();
        let mut buf = String::new();
        let mut count = 0usize;
        let mut tokens = 0usize;
        let mut chars = 0usize;

        for sentence in sentences {
            if count > 0
                && (count >= per_chunk
                    || !self.fits(tokens + sentence.tokens, chars + sentence.chars))
            {
                out.push(std::mem::take(&mut buf));
                count = 0;
                tokens = 0;
                chars = 0;
            }
            buf.push_str(&sentence.text);
            count += 1;
            tokens += sentence.tokens;
            chars += sentence.chars;
        }
        if count > 0 {
            out.push(buf);
        }
        out
    }

    fn split_on_separator(&self, text: &str) -> Vec<String> {
        let sep = self.rule.separator.as_str();
        if sep.is_empty() {
            return vec![text.to_string()];
        }
        let parts: Vec<&str> = text.split(sep).collect();
        let last = parts.len().saturating_sub(1);
        parts
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                if self.rule.keep_separator && i < last {
                    format!("{}{}", p, sep)
                } else {
                    p.to_string()
                }
            })
            .filter(|p| !p.trim().is_empty())
            .collect()
    }

    /// Break an oversized piece at whitespace, falling back to characters.
    fn hard_split(&self, text: &str) -> Vec<Piece> {
        let mut atoms: Vec<Piece> = Vec::new();
        for word in text.split_inclusive(char::is_whitespace) {
            let piece = Piece::new(word.to_string());
            if self.fits(piece.tokens, piece.chars) {
                atoms.push(piece);
            } else {
                atoms.extend(word.chars().map(|c| Piece::new(c.to_string())));
            }
        }

        let mut out = Vec::new();
        let mut buf = String::new();
        let mut tokens = 0usize;
        let mut chars = 0usize;
        for atom in atoms {
            if !buf.is_empty() && !self.fits(tokens + atom.tokens, chars + atom.chars) {
                out.push(Piece::new(std::mem::take(&mut buf)));
                tokens = 0;
                chars = 0;
            }
            buf.push_str(&atom.text);
            tokens += atom.tokens;
            chars += atom.chars;
        }
        if !buf.trim().is_empty() {
            out.push(Piece::new(buf));
        }
        out.retain(|p| !p.text.trim().is_empty());
        out
    }

    fn merge(&self, pieces: Vec<Piece>) -> Vec<Window> {
        let joiner_chars = self.joiner().chars().count();
        let joiner_tokens = estimate_tokens(self.joiner());
        let overlap = self.rule.chunk_overlap;

        let mut windows = Vec::new();
        let mut current = Window::default();

        for piece in pieces {
            if !current.pieces.is_empty()
                && !self.fits(
                    current.tokens + joiner_tokens + piece.tokens,
                    current.chars + joiner_chars + piece.chars,
                )
            {
                let mut next = current.clone();
                windows.push(current);

                // Keep the tail as overlap, as long as the new piece still fits.
                while !next.pieces.is_empty()
                    && (next.tokens > overlap
                        || !self.fits(
                            next.tokens + joiner_tokens + piece.tokens,
                            next.chars + joiner_chars + piece.chars,
                        ))
                {
                    next.pop_front(joiner_tokens, joiner_chars);
                }
                next.fresh_from = next.pieces.len();
                current = next;
            }
            current.push(piece, joiner_tokens, joiner_chars);
        }

        if !current.pieces.is_empty() && current.fresh_from < current.pieces.len() {
            windows.push(current);
        }
        windows
    }

    fn join(&self, pieces: &VecDeque<Piece>) -> String {
        let joiner = self.joiner();
        let mut out = String::new();
        for (i, p) in pieces.iter().enumerate() {
            if i > 0 {
                out.push_str(joiner);
            }
            out.push_str(&p.text);
        }
        out
    }
}

/// Cut `text` after each match of `re`, keeping the matched text on the
/// left piece. Blank pieces are dropped.
fn split_after(re: &Regex, text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    for m in re.find_iter(text) {
        let piece = &text[start..m.end()];
        if !piece.trim().is_empty() {
            out.push(piece.to_string());
        }
        start = m.end();
    }
    if !text[start..].trim().is_empty() {
        out.push(text[start..].to_string());
    }
    out
}

/// Sentences of `text`, each carrying its closing punctuation and trailing
/// whitespace.
pub fn split_sentences(text: &str) -> Vec<String> {
    split_after(&SENTENCE_END, text)
}

/// Break a sentence over [`MAX_SENTENCE_CHARS`] at clause punctuation,
/// then at characters.
fn break_long_sentence(sentence: &str) -> Vec<String> {
    if sentence.chars().count() <= MAX_SENTENCE_CHARS {
        return vec![sentence.to_string()];
    }

    let mut out = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0usize;
    for clause in split_after(&CLAUSE_BREAK, sentence) {
        let chars = clause.chars().count();
        if buf_chars > 0 && buf_chars + chars > MAX_SENTENCE_CHARS {
            out.push(std::mem::take(&mut buf));
            buf_chars = 0;
        }
        if chars > MAX_SENTENCE_CHARS {
            let all: Vec<char> = clause.chars().collect();
            out.extend(all.chunks(MAX_SENTENCE_CHARS).map(|c| c.iter().collect::<String>()));
            continue;
        }
        buf.push_str(&clause);
        buf_chars += chars;
    }
    if buf_chars > 0 {
        out.push(buf);
    }
    out
}

/// Pieces accumulated for one chunk. Pieces before `fresh_from` are overlap
/// carried from the previous chunk.
#[derive(Debug, Clone, Default)]
struct Window {
    pieces: VecDeque<Piece>,
    tokens: usize,
    chars: usize,
    fresh_from: usize,
}

impl Window {
    fn push(&mut self, piece: Piece, joiner_tokens: usize, joiner_chars: usize) {
        if !self.pieces.is_empty() {
            self.tokens += joiner_tokens;
            self.chars += joiner_chars;
        }
        self.tokens += piece.tokens;
        self.chars += piece.chars;
        self.pieces.push_back(piece);
    }

    fn pop_front(&mut self, joiner_tokens: usize, joiner_chars: usize) {
        if let Some(p) = self.pieces.pop_front() {
            self.tokens -= p.tokens;
            self.chars -= p.chars;
            if !self.pieces.is_empty() {
                self.tokens -= joiner_tokens;
                self.chars -= joiner_chars;
            }
            self.fresh_from = self.fresh_from.saturating_sub(1);
        }
    }
}

/// Stable chunk id for `(key, index)`. Re-splitting the same document yields
/// the same ids, which keeps loads idempotent.
pub fn derive_chunk_id(key: &str, index: usize) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}:{}", key, index).as_bytes()).to_string()
}

/// Create a single [`Chunk`] with a stable id and SHA-256 content hash.
pub fn make_chunk(source_doc_id: &str, index: usize, text: &str, metadata: Metadata) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: derive_chunk_id(source_doc_id, index),
        source_doc_id: source_doc_id.to_string(),
        section_index: index,
        text: text.to_string(),
        hash,
        metadata,
    }
}
