//! # ragline CLI
//!
//! ## Usage
//!
//! ```bash
//! ragline --config ./config/ragline.toml <command>
//! ```
//!
//! Without `--config` every command runs on built-in defaults with a local
//! hashing embedder.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragline chunk <file>` | Extract and split one file, print the chunks |
//! | `ragline transform "<query>"` | Run the query transformation pipeline |
//! | `ragline ingest <dir>` | Ingest a directory and print the ingest summary |
//! | `ragline ask "<query>" --docs <dir>` | Ingest, transform, then retrieve |
//!
//! Output is JSON on stdout; logs go to stderr (`RUST_LOG` overrides the
//! `info` default).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ragline::config::{self, Config};
use ragline::engine::{AskRequest, Engine};
use ragline_core::processor::ExtractSetting;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Query transformation and index processing for retrieval-augmented
/// generation.
#[derive(Parser)]
#[command(name = "ragline", version)]
struct Cli {
    /// Path to configuration file (TOML). Built-in defaults apply when
    /// omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract and split one file with the configured chunking rule.
    Chunk {
        file: PathBuf,
    },

    /// Transform a query and print the resulting queries.
    Transform {
        query: String,

        /// Print the per-stage trace as well.
        #[arg(long)]
        trace: bool,
    },

    /// Ingest every supported file under a directory.
    Ingest {
        dir: PathBuf,
    },

    /// Ingest a directory, then answer a query against it.
    Ask {
        query: String,

        /// Directory of documents to retrieve from.
        #[arg(long)]
        docs: PathBuf,

        /// Trace id used for the sampling decision (generated when absent).
        #[arg(long)]
        trace_id: Option<String>,

        /// User id, the sampling key when no trace id is given.
        #[arg(long)]
        user_id: Option<String>,

        /// Request header as `Name=value`; repeatable.
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Include the transformation trace even when not sampled.
        #[arg(long)]
        trace: bool,
    },
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected Name=value, got '{}'", raw)),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::minimal(),
    };
    let engine = Engine::new(cfg)?;

    match cli.command {
        Commands::Chunk { file } => run_chunk(&engine, &file).await?,
        Commands::Transform { query, trace } => {
            let (queries, full_trace) = engine.transform(&query).await;
            let texts: Vec<&str> = queries.iter().map(|q| q.text()).collect();
            if trace {
                print_json(&json!({ "queries": texts, "trace": full_trace }))?;
            } else {
                print_json(&json!({ "queries": texts }))?;
            }
        }
        Commands::Ingest { dir } => {
            let summary = engine.ingest(&dir).await?;
            print_json(&summary)?;
        }
        Commands::Ask {
            query,
            docs,
            trace_id,
            user_id,
            headers,
            trace,
        } => {
            let summary = engine.ingest(&docs).await?;
            if summary.ingested.is_empty() {
                tracing::warn!(dir = %docs.display(), "no documents were ingested");
            }
            let response = engine
                .ask(AskRequest {
                    query,
                    trace_id,
                    user_id,
                    headers,
                    include_trace: trace,
                })
                .await?;
            print_json(&response)?;
        }
    }

    Ok(())
}

async fn run_chunk(engine: &Engine, file: &Path) -> Result<()> {
    let content = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.display().to_string());
    let setting = ExtractSetting::new(file.display().to_string(), file_name, content);

    let ctx = engine.processor_context();
    let processor = engine.processor();
    let docs = processor.extract(&setting, &ctx).await?;
    let chunks = processor.transform(docs, &ctx).await?;

    let out: Vec<_> = chunks
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "section_index": c.section_index,
                "hash": c.hash,
                "text": c.text,
                "metadata": c.metadata,
            })
        })
        .collect();
    print_json(&out)
}
