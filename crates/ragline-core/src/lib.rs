//! # ragline core
//!
//! Shared logic for ragline: the query transformation pipeline, the index
//! processing pipeline and the capability traits both of them consume.
//!
//! This crate performs no filesystem or network I/O. Model runtimes,
//! persistence engines and binary document formats are supplied by the
//! calling application through the traits in [`model`], [`store`] and
//! [`parser`].
//!
//! ## Data flow
//!
//! ```text
//! index path:  bytes ─▶ extract ─▶ transform (split) ─▶ load (vector + keyword)
//! query path:  query ─▶ normalize ─▶ lexicon ─▶ expand ─▶ intent gate ─▶ retrieve (hybrid)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | `Query`, `Chunk`, `Dataset`, `RawDocument`, `RetrievedDocument` |
//! | [`query`] | Staged query transformation with per-stage tracing |
//! | [`splitter`] | Token-bounded paragraph and sentence splitting, segmentation rules |
//! | [`parser`] | Document parser trait, registry and text-format parsers |
//! | [`store`] | Vector / keyword store traits and in-memory backends |
//! | [`search`] | Score normalisation and hybrid merge |
//! | [`processor`] | Index processors: extract, transform, load, clean, retrieve |
//! | [`sampling`] | Deterministic evaluation sampling decision |
//! | [`model`] | Model provider capability and vector helpers |
//! | [`keywords`] | Keyword extraction for the lexical index |

pub mod error;
pub mod keywords;
pub mod model;
pub mod models;
pub mod parser;
pub mod processor;
pub mod query;
pub mod sampling;
pub mod search;
pub mod splitter;
pub mod store;

pub use error::{Error, IndexPhase, Result};
