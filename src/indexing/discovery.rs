use crate::core::error::{Error, Result};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::warn;

/// How a supported file is split into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Markdown,
    Text,
    Csv,
    Python,
    Go,
    Pdf,
    Docx,
    /// One section per slide
    Pptx,
}

impl FileKind {
    /// Classify a path by extension (case-insensitive)
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "md" | "markdown" | "mdown" | "mkd" | "mkdn" => Some(FileKind::Markdown),
            "txt" => Some(FileKind::Text),
            "csv" => Some(FileKind::Csv),
            "py" => Some(FileKind::Python),
            "go" => Some(FileKind::Go),
            "pdf" => Some(FileKind::Pdf),
            "docx" => Some(FileKind::Docx),
            "pptx" => Some(FileKind::Pptx),
            _ => None,
        }
    }
}

/// A supported file found under one of the search roots
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub kind: FileKind,
}

/// Discover supported files under every root, respecting .gitignore rules.
///
/// Results are sorted by path so indexing order is stable.
pub fn discover_files(roots: &[PathBuf]) -> Result<Vec<DiscoveredFile>> {
    let mut files = Vec::new();
    for root in roots {
        discover_under(root, &mut files)?;
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files.dedup_by(|a, b| a.path == b.path);
    Ok(files)
}

fn discover_under(root: &Path, files: &mut Vec<DiscoveredFile>) -> Result<()> {
    if !root.exists() {
        return Err(Error::Config(format!(
            "Directory does not exist: {}",
            root.display()
        )));
    }

    if !root.is_dir() {
        return Err(Error::Config(format!(
            "Path is not a directory: {}",
            root.display()
        )));
    }

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .build();

    for result in walker {
        match result {
            Ok(entry) => {
                let path = entry.path();
                if path.is_dir() {
                    continue;
                }

                if let Some(kind) = FileKind::from_path(path) {
                    let relative_path = path
                        .strip_prefix(root)
                        .unwrap_or(path)
                        .to_path_buf();
                    files.push(DiscoveredFile {
                        path: path.to_path_buf(),
                        relative_path,
                        kind,
                    });
                }
            }
            Err(err) => {
                // Some entries may be unreadable; keep walking
                warn!("Failed to access file: {}", err);
            }
        }
    }

    Ok(())
}

/// Check if a file is supported for indexing
pub fn is_supported_file(path: &Path) -> bool {
    FileKind::from_path(path).is_some()
}
