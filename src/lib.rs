//! # ragline
//!
//! Query transformation and index processing for retrieval-augmented
//! generation, runnable from the command line.
//!
//! The logic lives in [`ragline_core`]; this crate supplies what the core
//! leaves to its caller: TOML configuration, model backends (OpenAI-compatible
//! HTTP and a local hashing embedder), parsers for binary document formats,
//! directory ingestion and the `ragline` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │  Directory  │──▶│ extract ▶ transform  │──▶│ vector store │
//! │  (ingest)   │   │   ▶ clean ▶ load     │   │ keyword store│
//! └─────────────┘   └──────────────────────┘   └──────┬───────┘
//!                                                     │ retrieve
//! ┌─────────────┐   ┌──────────────────────┐          │
//! │    Query    │──▶│ normalize ▶ expand   │──────────┘
//! │   (ask)     │   │   ▶ intent/slot gate │
//! └─────────────┘   └──────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragline chunk docs/handbook.md              # show how a file is split
//! ragline transform "  1. refund policy" --trace
//! ragline ask "refund policy" --docs ./docs   # ingest, then retrieve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`provider`] | Model registry: OpenAI-compatible and local models |
//! | [`extract`] | PDF, DOCX, XLSX and HTML parsers |
//! | [`ingest`] | Directory scan and concurrent ingestion |
//! | [`engine`] | Configured pipeline, processor and sampler |

pub mod config;
pub mod engine;
pub mod extract;
pub mod ingest;
pub mod provider;
