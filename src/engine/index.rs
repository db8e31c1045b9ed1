use super::backend::Backend;
use crate::core::config::{Config, INDEX_LOCATION};
use crate::core::error::{Error, Result};
use crate::core::state::IndexState;
use crate::core::subscription::{panic_message, StateCell, SubscriptionId};
use crate::core::sync::lock;
use crate::indexing::context::LoadingContext;
use crate::search::embedding::Embedder;
use crate::search::llm::{LanguageModel, QueryResult, StreamHandler};
use crate::search::retriever::{IndexSource, MultiIndexRetriever};
use crate::storage::vectors::{VectorEntry, VectorIndex, COLLECTION_NAME};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const START_ALLOWED: [IndexState; 1] = [IndexState::New];
const QUERY_ALLOWED: [IndexState; 1] = [IndexState::Loaded];

/// Documents embedded per call, with a cancellation check in between
const EMBED_BATCH_SIZE: usize = 64;

/// Embedder for the current cycle; cleared by `reset`
enum CachedEmbedder {
    /// Passed to `start_init_index_with`, used regardless of config
    Explicit(Arc<dyn Embedder>),
    /// Built by the backend factory from this config
    Built(Config, Arc<dyn Embedder>),
}

/// Owns the lifecycle of the vector index.
///
/// `New -> Loading -> Loaded`, or straight to `Loaded` when the index
/// location already holds data. Any failure moves to `Error` with the
/// cause kept in [`exception`](Self::exception). [`reset`](Self::reset)
/// returns to `New` from every state.
///
/// Used behind an `Arc`: the loader worker keeps its own reference.
pub struct IndexSubsystem {
    state: StateCell<IndexState>,
    exception: Mutex<Option<Arc<Error>>>,
    store: Mutex<Option<Arc<dyn VectorIndex>>>,
    context: Mutex<Option<Arc<LoadingContext>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    embedder: Mutex<Option<CachedEmbedder>>,
    language_model: Mutex<Option<(Config, Arc<dyn LanguageModel>)>>,
    secondary: Mutex<Vec<IndexSource>>,
    backend: Backend,
}

impl IndexSubsystem {
    pub fn new(backend: Backend) -> Self {
        Self {
            state: StateCell::new("index", IndexState::New),
            exception: Mutex::new(None),
            store: Mutex::new(None),
            context: Mutex::new(None),
            worker: Mutex::new(None),
            embedder: Mutex::new(None),
            language_model: Mutex::new(None),
            secondary: Mutex::new(Vec::new()),
            backend,
        }
    }

    pub fn state(&self) -> IndexState {
        self.state.get()
    }

    /// The failure that moved this index to `Error`, if any.
    pub fn exception(&self) -> Option<Arc<Error>> {
        lock(&self.exception).clone()
    }

    pub fn subscribe_to_statechange<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(IndexState, IndexState) + Send + Sync + 'static,
    {
        self.state.subscribe(callback)
    }

    pub fn unsubscribe_to_statechange(&self, id: SubscriptionId) -> Result<()> {
        self.state.unsubscribe(id)
    }

    pub fn set_panic_handler<F>(&self, handler: F)
    where
        F: Fn(SubscriptionId, &(dyn Any + Send)) + Send + Sync + 'static,
    {
        self.state.set_panic_handler(handler);
    }

    /// Context of the current loading attempt; `None` if no worker was started.
    pub fn loading_context(&self) -> Option<Arc<LoadingContext>> {
        lock(&self.context).clone()
    }

    /// Search another index alongside the primary one when answering queries.
    pub fn add_secondary_index(&self, index: Arc<dyn VectorIndex>, collection: impl Into<String>) {
        lock(&self.secondary).push(IndexSource::new(index, collection));
    }

    /// Attach to the index at `index_location`, building it in the
    /// background if it holds no data yet. Only allowed from `New`.
    ///
    /// The embedder comes from the backend and is created lazily.
    pub fn start_init_index(self: &Arc<Self>, config: Arc<Config>) -> Result<()> {
        self.begin(config, None)
    }

    /// Like [`start_init_index`](Self::start_init_index) with an explicit embedder.
    pub fn start_init_index_with(
        self: &Arc<Self>,
        config: Arc<Config>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<()> {
        self.begin(config, Some(embedder))
    }

    fn begin(self: &Arc<Self>, config: Arc<Config>, embedder: Option<Arc<dyn Embedder>>) -> Result<()> {
        let state = self.state();
        if !START_ALLOWED.contains(&state) {
            return Err(Error::invalid_state(state, &START_ALLOWED));
        }

        *lock(&self.embedder) = embedder.map(CachedEmbedder::Explicit);

        let Some(location) = config.index_location() else {
            self.fail(Error::MissingConfigValue([INDEX_LOCATION.to_string()].into()));
            return Ok(());
        };

        let store: Arc<dyn VectorIndex> = match self.backend.pool.open(&location) {
            Ok(store) => store as Arc<dyn VectorIndex>,
            Err(e) => {
                self.fail(e);
                return Ok(());
            }
        };
        *lock(&self.store) = Some(Arc::clone(&store));

        if self.is_created() {
            info!("Using existing index at {}", location.display());
            self.state.set(IndexState::Loaded);
            return Ok(());
        }

        let ctx = Arc::new(LoadingContext::new());
        *lock(&self.context) = Some(Arc::clone(&ctx));
        self.state.set(IndexState::Loading);

        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("index-loader".to_string())
            .spawn(move || this.run_loader(&config, store.as_ref(), &ctx));

        match spawned {
            Ok(handle) => *lock(&self.worker) = Some(handle),
            Err(e) => self.fail(e.into()),
        }
        Ok(())
    }

    fn run_loader(&self, config: &Config, store: &dyn VectorIndex, ctx: &LoadingContext) {
        info!("Index worker started");

        let outcome = catch_unwind(AssertUnwindSafe(|| self.build_entries(config, ctx)))
            .unwrap_or_else(|payload| {
                Err(Error::Service(format!(
                    "index worker panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        if let Err(Error::LoadingCancelled) = outcome {
            debug!("Index worker stopped after cancellation");
            return;
        }

        // The outcome is decided under the commit gate; subscribers hear
        // about it after the gate is released.
        let committed = ctx.commit(|| {
            match outcome.and_then(|entries| {
                store.upsert(COLLECTION_NAME, &entries)?;
                Ok(entries.len())
            }) {
                Ok(count) => {
                    info!("Indexed {} chunks", count);
                    self.state.set_deferred(IndexState::Loaded);
                }
                Err(e) => self.record_failure(e),
            }
        });

        match committed {
            Some(()) => self.state.flush(),
            None => debug!("Index worker cancelled; result discarded"),
        }
    }

    fn build_entries(&self, config: &Config, ctx: &LoadingContext) -> Result<Vec<VectorEntry>> {
        let roots = config.search_paths();
        ctx.set_total_items(self.backend.loader.count(&roots)?);

        let documents = self.backend.loader.load(&roots, ctx)?;
        if documents.is_empty() {
            return Err(Error::NoSupportedFilesInDirectory(roots));
        }
        info!("Loaded {} chunks, embedding", documents.len());

        let embedder = self.embedder(config)?;
        let mut entries = Vec::with_capacity(documents.len());
        for batch in documents.chunks(EMBED_BATCH_SIZE) {
            if ctx.is_cancelled() {
                return Err(Error::LoadingCancelled);
            }
            let texts: Vec<String> = batch.iter().map(|doc| doc.text.clone()).collect();
            let vectors = embedder.embed_documents(&texts)?;
            if vectors.len() != batch.len() {
                return Err(Error::Service(format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            entries.extend(batch.iter().zip(vectors).map(|(doc, embedding)| {
                VectorEntry::new(
                    doc.source.to_string_lossy().into_owned(),
                    doc.chunk_index,
                    embedding,
                    doc.text.clone(),
                    doc.context.clone(),
                )
            }));
        }
        Ok(entries)
    }

    /// Whether an index is attached and its collection holds data. No side effects.
    pub fn is_created(&self) -> bool {
        let Some(store) = lock(&self.store).clone() else {
            return false;
        };
        let created = match store.has_collection(COLLECTION_NAME) {
            Ok(true) => store.count(COLLECTION_NAME).map(|count| count > 0),
            other => other,
        };
        match created {
            Ok(created) => created,
            Err(e) => {
                warn!("Could not inspect index: {}", e);
                false
            }
        }
    }

    /// Cancel any loading, delete the persisted collection and return to `New`.
    ///
    /// Once this returns, a cancelled worker can no longer change the state.
    /// Safe to call from a state subscriber.
    pub fn reset(&self) {
        let ctx = lock(&self.context).take();
        if let Some(ctx) = ctx {
            ctx.cancel();
        }

        let store = lock(&self.store).take();
        if let Some(store) = store {
            if let Err(e) = store.delete_collection(COLLECTION_NAME) {
                warn!("Failed to delete collection '{}': {}", COLLECTION_NAME, e);
            }
        }

        *lock(&self.exception) = None;
        *lock(&self.embedder) = None;
        *lock(&self.language_model) = None;
        self.state.set(IndexState::New);
    }

    /// Wait for the current loader worker, if any.
    pub fn join(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Index worker panicked");
            }
        }
    }

    /// Answer `query` from the index. Only allowed from `Loaded`.
    ///
    /// Failures move the index to `Error` and yield `Ok(None)`.
    pub fn query(
        &self,
        config: &Config,
        query: &str,
        handlers: &[Arc<dyn StreamHandler>],
    ) -> Result<Option<QueryResult>> {
        let state = self.state();
        if !QUERY_ALLOWED.contains(&state) {
            return Err(Error::invalid_state(state, &QUERY_ALLOWED));
        }

        match self.answer(config, query, handlers) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                self.fail(e);
                Ok(None)
            }
        }
    }

    fn answer(
        &self,
        config: &Config,
        query: &str,
        handlers: &[Arc<dyn StreamHandler>],
    ) -> Result<QueryResult> {
        let store = lock(&self.store)
            .clone()
            .ok_or_else(|| Error::Database("index is not open".to_string()))?;
        let language_model = self.language_model(config)?;
        let embedder = self.embedder(config)?;

        let mut sources = vec![IndexSource::new(store, COLLECTION_NAME)];
        sources.extend(lock(&self.secondary).iter().cloned());

        let query_embedding = embedder.embed_query(query)?;
        let context = MultiIndexRetriever::new(sources).retrieve(&query_embedding)?;
        debug!("Retrieved {} chunks for query", context.len());

        language_model.answer(query, &context, handlers)
    }

    fn embedder(&self, config: &Config) -> Result<Arc<dyn Embedder>> {
        let mut cached = lock(&self.embedder);
        match cached.as_ref() {
            Some(CachedEmbedder::Explicit(embedder)) => return Ok(Arc::clone(embedder)),
            Some(CachedEmbedder::Built(built_for, embedder)) if built_for == config => {
                return Ok(Arc::clone(embedder))
            }
            _ => {}
        }
        let embedder = self.backend.embedder.create(config)?;
        *cached = Some(CachedEmbedder::Built(config.clone(), Arc::clone(&embedder)));
        Ok(embedder)
    }

    fn language_model(&self, config: &Config) -> Result<Arc<dyn LanguageModel>> {
        let mut cached = lock(&self.language_model);
        if let Some((cached_config, model)) = cached.as_ref() {
            if cached_config == config {
                return Ok(Arc::clone(model));
            }
        }
        let model = self.backend.language_model.create(config)?;
        *cached = Some((config.clone(), Arc::clone(&model)));
        Ok(model)
    }

    fn fail(&self, e: Error) {
        self.record_failure(e);
        self.state.flush();
    }

    fn record_failure(&self, e: Error) {
        error!("Index failed: {}", e);
        *lock(&self.exception) = Some(Arc::new(e));
        self.state.set_deferred(IndexState::Error);
    }
}
