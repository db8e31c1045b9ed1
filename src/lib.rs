// Core functionality
pub mod core {
    pub mod config;
    pub mod error;
    pub mod state;
    pub mod subscription;
    pub(crate) mod sync;
}

// Data storage
pub mod storage {
    pub mod vectors;
}

// Indexing pipeline
pub mod indexing {
    pub mod chunker;
    pub mod context;
    pub mod discovery;
    pub mod extract;
    pub mod loader;
}

// Search & ML
pub mod search {
    pub mod embedding;
    pub mod llm;
    pub mod model;
    pub mod retriever;
}

// State machines
pub mod engine {
    pub mod backend;
    pub mod index;
    pub mod orchestrator;
}

// User interfaces
pub mod ui {
    pub mod cli;
}

// Re-export commonly used types
pub use core::config::{AppDirs, Config, ConfigStore, JsonConfigStore};
pub use core::error::{Error, Result};
pub use core::state::{IndexState, OrchestratorState};
pub use core::subscription::{StateCell, SubscriptionId};
pub use engine::backend::Backend;
pub use engine::index::IndexSubsystem;
pub use engine::orchestrator::Orchestrator;
pub use indexing::context::{LoadingContext, Progress};
pub use indexing::loader::{Document, DocumentLoader, FsDocumentLoader};
pub use search::embedding::{Embedder, EmbedderFactory};
pub use search::llm::{LanguageModel, LanguageModelFactory, QueryResult, StreamHandler};
pub use storage::vectors::{IndexPool, RedbVectorIndex, ScoredEntry, VectorEntry, VectorIndex};
pub use ui::cli::Cli;
