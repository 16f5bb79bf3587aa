//! Directory ingestion.
//!
//! Walks a directory, keeps files matched by the include globs (and not by
//! the exclude globs) whose type has a registered parser, and runs
//! [`IndexProcessor::ingest`] on each, with at most `ingest.concurrency`
//! files in flight. A file that fails to ingest is reported and skipped; it never
//! aborts the run.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ragline_core::parser::{file_type_of, ParserRegistry};
use ragline_core::processor::{ExtractSetting, IndexProcessor, IngestReport, ProcessorContext};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::IngestConfig;

/// A file found by [`scan_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path relative to the scanned root, with `/` separators. Used as the
    /// source document id.
    pub relative: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub files: usize,
    pub documents: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub keywords: usize,
    pub ingested: Vec<IngestReport>,
    pub skipped: Vec<SkippedFile>,
}

impl IngestSummary {
    fn record(&mut self, report: IngestReport) {
        self.documents += report.documents;
        self.chunks += report.chunks;
        self.vectors += report.vectors;
        self.keywords += report.keywords;
        self.ingested.push(report);
    }
}

/// Files under `root` to ingest, sorted by relative path.
pub fn scan_dir(root: &Path, config: &IngestConfig, parsers: &ParserRegistry) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        bail!("Ingest root is not a directory: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        if exclude_set.is_match(&relative) || !include_set.is_match(&relative) {
            continue;
        }
        let supported = file_type_of(&relative).is_some_and(|t| parsers.supports(&t));
        if !supported {
            continue;
        }
        files.push(SourceFile {
            path: path.to_path_buf(),
            relative,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

/// Ingest every file [`scan_dir`] finds.
pub async fn ingest_dir(
    root: &Path,
    config: &IngestConfig,
    parsers: &ParserRegistry,
    processor: Arc<dyn IndexProcessor>,
    ctx: &ProcessorContext,
) -> Result<IngestSummary> {
    let files = scan_dir(root, config, parsers)?;
    let mut summary = IngestSummary {
        files: files.len(),
        ..Default::default()
    };

    let ctx = Arc::new(ctx.clone());
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut handles = Vec::with_capacity(files.len());

    for file in files {
        let processor = processor.clone();
        let ctx = ctx.clone();
        let sem = semaphore.clone();
        let max_bytes = config.max_file_bytes;
        let with_keywords = config.with_keywords;

        handles.push(tokio::spawn(async move {
            let result = match sem.acquire().await {
                Ok(_permit) => {
                    ingest_file(&file, processor.as_ref(), &ctx, max_bytes, with_keywords).await
                }
                Err(e) => Err(e.into()),
            };
            (file.relative, result)
        }));
    }

    for handle in handles {
        let (path, result) = handle.await.context("ingest task panicked")?;
        match result {
            Ok(report) => summary.record(report),
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(path = %path, error = %reason, "skipping file");
                summary.skipped.push(SkippedFile { path, reason });
            }
        }
    }

    summary.ingested.sort_by(|a, b| a.source_doc_id.cmp(&b.source_doc_id));
    summary.skipped.sort_by(|a, b| a.path.cmp(&b.path));
    info!(
        files = summary.files,
        ingested = summary.ingested.len(),
        skipped = summary.skipped.len(),
        chunks = summary.chunks,
        "ingest finished"
    );
    Ok(summary)
}

async fn ingest_file(
    file: &SourceFile,
    processor: &dyn IndexProcessor,
    ctx: &ProcessorContext,
    max_bytes: u64,
    with_keywords: bool,
) -> Result<IngestReport> {
    let size = tokio::fs::metadata(&file.path).await?.len();
    if size > max_bytes {
        bail!("file is {} bytes, over the {} byte limit", size, max_bytes);
    }
    let content = tokio::fs::read(&file.path)
        .await
        .with_context(|| format!("Failed to read {}", file.path.display()))?;
    let file_name = file
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.relative.clone());

    let mut setting = ExtractSetting::new(file.relative.clone(), file_name, content);
    setting.extend_params.insert("path".into(), json!(file.relative));
    Ok(processor.ingest(&setting, ctx, with_keywords).await?)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("guides")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("guides/refunds.md"), "# Refunds\n\nFive days.").unwrap();
        fs::write(root.join("notes.txt"), "Plain notes.").unwrap();
        fs::write(root.join("image.png"), [0u8, 1, 2]).unwrap();
        fs::write(root.join(".git/config.txt"), "ignored").unwrap();
        tmp
    }

    #[test]
    fn scan_filters_by_glob_and_parser() {
        let tmp = tree();
        let files = scan_dir(tmp.path(), &IngestConfig::default(), &ParserRegistry::with_text_parsers()).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, vec!["guides/refunds.md", "notes.txt"]);

        let only_md = IngestConfig {
            include_globs: vec!["**/*.md".into()],
            ..Default::default()
        };
        let files = scan_dir(tmp.path(), &only_md, &ParserRegistry::with_text_parsers()).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn scan_rejects_missing_root() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        assert!(scan_dir(&missing, &IngestConfig::default(), &ParserRegistry::new()).is_err());
    }
}
