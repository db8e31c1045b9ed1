use crate::core::config::AppDirs;
use crate::indexing::loader::{DocumentLoader, FsDocumentLoader};
use crate::search::embedding::{DefaultEmbedderFactory, EmbedderFactory};
use crate::search::llm::{DefaultLanguageModelFactory, LanguageModelFactory};
use crate::storage::vectors::IndexPool;
use std::sync::Arc;

/// The collaborators the state machines drive.
///
/// Cloning shares the same collaborators, including the index pool.
#[derive(Clone)]
pub struct Backend {
    pub loader: Arc<dyn DocumentLoader>,
    pub embedder: Arc<dyn EmbedderFactory>,
    pub language_model: Arc<dyn LanguageModelFactory>,
    pub pool: Arc<IndexPool>,
}

impl Backend {
    /// Filesystem loader, configured embedder, OpenAI chat.
    pub fn new(dirs: &AppDirs) -> Self {
        Self {
            loader: Arc::new(FsDocumentLoader::new()),
            embedder: Arc::new(DefaultEmbedderFactory::new(dirs.models_dir.clone())),
            language_model: Arc::new(DefaultLanguageModelFactory),
            pool: Arc::new(IndexPool::new()),
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn DocumentLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbedderFactory>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_language_model(mut self, language_model: Arc<dyn LanguageModelFactory>) -> Self {
        self.language_model = language_model;
        self
    }
}
