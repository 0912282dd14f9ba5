//! # Knowledge-base ingestion
//!
//! Walks a directory of markdown documents and feeds each one to
//! [`RagService::index_document`], with `source` set to the path relative to the
//! root. `README.md` files and hidden entries are skipped.

use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use std::{error::Error, fs};
use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::metadata::DocumentMetadata;
use crate::rag::RagService;

/// Counts from one ingestion run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub indexed: usize,
    /// Documents that were empty or produced no chunks, or whose batch failed.
    pub skipped: Vec<PathBuf>,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn is_document(path: &Path) -> bool {
    let markdown = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("md"));
    let readme = path
        .file_name()
        .is_some_and(|name| name.eq_ignore_ascii_case("README.md"));
    markdown && !readme
}

/// Every indexable markdown file under `root`, sorted.
pub fn markdown_files(root: &Path) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = entry?;
        if entry.file_type().is_file() && is_document(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Path of `path` relative to `root`, with `/` separators.
pub fn source_for(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Index `files` one by one, advancing `progress` per file.
pub async fn index_files(
    service: &RagService,
    root: &Path,
    files: &[PathBuf],
    progress: &ProgressBar,
) -> IngestReport {
    let mut report = IngestReport::default();
    for path in files {
        let source = source_for(root, path);
        progress.set_message(source.clone());

        let indexed = match fs::read_to_string(path) {
            Ok(content) => {
                service
                    .index_document(&content, DocumentMetadata::default().with_source(&source))
                    .await
            }
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                false
            }
        };

        if indexed {
            report.indexed += 1;
        } else {
            report.skipped.push(path.clone());
        }
        progress.inc(1);
    }
    info!(
        "Ingestion finished: {} indexed, {} skipped",
        report.indexed,
        report.skipped.len()
    );
    report
}
