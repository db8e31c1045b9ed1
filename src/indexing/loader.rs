use super::chunker::chunk_text;
use super::context::LoadingContext;
use super::discovery::{discover_files, DiscoveredFile, FileKind};
use super::extract::{docx_text, pdf_text, pptx_slides};
use crate::core::error::{Error, Result};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// A chunk of a source document, ready to be embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub text: String,
    /// File the chunk came from
    pub source: PathBuf,
    pub chunk_index: usize,
    /// Heading trail for Markdown, empty otherwise
    pub context: String,
}

/// Turns a set of folder trees into text chunks.
pub trait DocumentLoader: Send + Sync {
    /// Number of items `load` will visit, used as the progress total.
    fn count(&self, roots: &[PathBuf]) -> Result<usize>;

    /// Load every supported item under `roots`.
    ///
    /// Must check `ctx.is_cancelled()` between items and return
    /// [`Error::LoadingCancelled`] once it is set.
    fn load(&self, roots: &[PathBuf], ctx: &LoadingContext) -> Result<Vec<Document>>;
}

/// Loads supported files from the local filesystem.
///
/// PDF and Office documents are reduced to plain text first; a file that
/// cannot be read or extracted is skipped with a warning.
#[derive(Debug, Clone, Default)]
pub struct FsDocumentLoader;

impl FsDocumentLoader {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentLoader for FsDocumentLoader {
    fn count(&self, roots: &[PathBuf]) -> Result<usize> {
        Ok(discover_files(roots)?.len())
    }

    fn load(&self, roots: &[PathBuf], ctx: &LoadingContext) -> Result<Vec<Document>> {
        let files = discover_files(roots)?;
        let mut documents = Vec::new();

        for file in &files {
            if ctx.is_cancelled() {
                return Err(Error::LoadingCancelled);
            }
            ctx.start_item(file.path.to_string_lossy());

            match read_sections(file) {
                Ok(sections) => {
                    let chunks: Vec<_> = sections
                        .iter()
                        .flat_map(|section| chunk_text(section, file.kind))
                        .collect();
                    debug!("Loaded {} ({} chunks)", file.path.display(), chunks.len());
                    documents.extend(chunks.into_iter().enumerate().map(|(chunk_index, chunk)| {
                        Document {
                            text: chunk.text,
                            source: file.path.clone(),
                            chunk_index,
                            context: chunk.context,
                        }
                    }));
                }
                Err(e) => {
                    warn!("Skipping unreadable file {}: {}", file.path.display(), e);
                }
            }
            ctx.item_loaded();
        }

        Ok(documents)
    }
}

/// Text of `file`, split into one section per slide for presentations
fn read_sections(file: &DiscoveredFile) -> Result<Vec<String>> {
    match file.kind {
        FileKind::Pdf => Ok(vec![pdf_text(&fs::read(&file.path)?)?]),
        FileKind::Docx => Ok(vec![docx_text(&fs::read(&file.path)?)?]),
        FileKind::Pptx => pptx_slides(&fs::read(&file.path)?),
        _ => Ok(vec![fs::read_to_string(&file.path)?]),
    }
}
