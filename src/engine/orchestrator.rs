use super::backend::Backend;
use super::index::IndexSubsystem;
use crate::core::config::{Config, ConfigStore};
use crate::core::error::{Error, Result};
use crate::core::state::OrchestratorState::{Configured, LoadingIndex, New, Querying, Standby};
use crate::core::state::{IndexState, OrchestratorState};
use crate::core::subscription::{panic_message, StateCell, SubscriptionId};
use crate::core::sync::lock;
use crate::indexing::context::Progress;
use crate::search::llm::{QueryResult, StreamHandler};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const LOAD_CONFIG_ALLOWED: [OrchestratorState; 1] = [New];
const START_INIT_INDEX_ALLOWED: [OrchestratorState; 1] = [Configured];
const START_SEARCH_ALLOWED: [OrchestratorState; 1] = [Standby];
const RESET_ALLOWED: [OrchestratorState; 5] = [
    New,
    Configured,
    LoadingIndex,
    Standby,
    OrchestratorState::Error,
];

/// Top-level state machine: configuration, indexing and querying.
///
/// Commands are issued from one owner thread. Index construction and
/// queries run on background workers that report back only through state
/// changes and the caller's [`StreamHandler`]s. Subscribers are notified
/// on whichever thread made the change.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    state: StateCell<OrchestratorState>,
    exception: Mutex<Option<Arc<Error>>>,
    config: Mutex<Option<Arc<Config>>>,
    index: Mutex<AttachedIndex>,
    query_worker: Mutex<Option<JoinHandle<()>>>,
    config_store: Arc<dyn ConfigStore>,
    backend: Backend,
}

/// An index subsystem and our subscription to it
struct AttachedIndex {
    subsystem: Arc<IndexSubsystem>,
    subscription: SubscriptionId,
}

impl Orchestrator {
    pub fn new(config_store: Arc<dyn ConfigStore>, backend: Backend) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            state: StateCell::new("orchestrator", New),
            exception: Mutex::new(None),
            config: Mutex::new(None),
            index: Mutex::new(attach(weak, &backend)),
            query_worker: Mutex::new(None),
            config_store,
            backend,
        });
        Self { inner }
    }

    pub fn state(&self) -> OrchestratorState {
        self.inner.state.get()
    }

    /// The failure that moved the orchestrator to `Error`, if any.
    pub fn exception(&self) -> Option<Arc<Error>> {
        lock(&self.inner.exception).clone()
    }

    /// Configuration loaded by [`load_config`](Self::load_config).
    pub fn config(&self) -> Option<Arc<Config>> {
        lock(&self.inner.config).clone()
    }

    /// The current index subsystem. Replaced by every [`reset`](Self::reset).
    pub fn index(&self) -> Arc<IndexSubsystem> {
        self.inner.index()
    }

    /// Progress of the running index build, if one was started.
    pub fn loading_progress(&self) -> Option<Progress> {
        self.index().loading_context().map(|ctx| ctx.progress())
    }

    /// Call `callback` with `(old, new)` on every transition, in order.
    ///
    /// Callbacks often run on a background worker thread. They may call
    /// back into the orchestrator, [`reset`](Self::reset) included; a
    /// transition made that way is delivered once the current one has
    /// reached every subscriber.
    pub fn subscribe_to_statechange<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(OrchestratorState, OrchestratorState) + Send + Sync + 'static,
    {
        self.inner.state.subscribe(callback)
    }

    pub fn unsubscribe_to_statechange(&self, id: SubscriptionId) -> Result<()> {
        self.inner.state.unsubscribe(id)
    }

    pub fn set_panic_handler<F>(&self, handler: F)
    where
        F: Fn(SubscriptionId, &(dyn Any + Send)) + Send + Sync + 'static,
    {
        self.inner.state.set_panic_handler(handler);
    }

    /// Load and validate the configuration.
    ///
    /// Store and validation failures are not returned: they move the
    /// orchestrator to `Error` with the cause in [`exception`](Self::exception).
    pub fn load_config(&self) -> Result<()> {
        self.require(&LOAD_CONFIG_ALLOWED)?;

        let loaded = self.inner.config_store.load().and_then(|config| {
            config.check()?;
            Ok(config)
        });

        match loaded {
            Ok(config) => {
                info!("Configuration loaded");
                *lock(&self.inner.config) = Some(Arc::new(config));
                self.inner.state.set(Configured);
            }
            Err(e) => self.inner.fail(e),
        }
        Ok(())
    }

    /// Attach to or build the index for the loaded configuration.
    pub fn start_init_index(&self) -> Result<()> {
        self.require(&START_INIT_INDEX_ALLOWED)?;
        let config = self.loaded_config()?;
        let index = self.index();

        // Set before delegating: an existing index reports Loaded
        // synchronously and the handler moves us on to Standby.
        self.inner.state.set(LoadingIndex);
        if let Err(e) = index.start_init_index(config) {
            self.inner.state.compare_and_set(LoadingIndex, Configured);
            return Err(e);
        }
        Ok(())
    }

    /// Run `query` on a background worker, streaming into `handlers`.
    ///
    /// Returns once the orchestrator is `Querying`. It returns to `Standby`
    /// when the answer completes, or moves to `Error` if the query fails.
    pub fn start_search(&self, query: &str, handlers: Vec<Arc<dyn StreamHandler>>) -> Result<()> {
        self.require(&START_SEARCH_ALLOWED)?;
        if query.trim().is_empty() {
            return Err(Error::EmptyQuery);
        }
        let config = self.loaded_config()?;
        let index = self.index();

        let previous = lock(&self.inner.query_worker).take();
        if let Some(previous) = previous {
            if previous.join().is_err() {
                warn!("Previous query worker panicked");
            }
        }

        if !self.inner.state.compare_and_set(Standby, Querying) {
            return Err(Error::invalid_state(self.state(), &START_SEARCH_ALLOWED));
        }

        let mut handlers = handlers;
        handlers.push(Arc::new(CompletionHandler {
            inner: Arc::downgrade(&self.inner),
        }));

        let inner = Arc::clone(&self.inner);
        let query = query.to_string();
        let spawned = thread::Builder::new()
            .name("query".to_string())
            .spawn(move || inner.run_query(&index, &config, &query, &handlers));

        match spawned {
            Ok(handle) => *lock(&self.inner.query_worker) = Some(handle),
            Err(e) => self.inner.fail(e.into()),
        }
        Ok(())
    }

    /// Cancel any index build, discard the index and configuration, and
    /// return to `New`. Not allowed while a query runs.
    ///
    /// The persisted collection is deleted, so the next cycle rebuilds it.
    pub fn reset(&self) -> Result<()> {
        self.require(&RESET_ALLOWED)?;

        let fresh = attach(&Arc::downgrade(&self.inner), &self.inner.backend);
        let old = std::mem::replace(&mut *lock(&self.inner.index), fresh);
        if let Err(e) = old.subsystem.unsubscribe_to_statechange(old.subscription) {
            warn!("Index subscription already gone: {}", e);
        }
        old.subsystem.reset();

        *lock(&self.inner.exception) = None;
        *lock(&self.inner.config) = None;
        self.inner.state.set(New);
        info!("Orchestrator reset");
        Ok(())
    }

    /// Block until the index and query workers have finished.
    pub fn wait(&self) {
        self.index().join();
        let handle = lock(&self.inner.query_worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Query worker panicked");
            }
        }
    }

    fn require(&self, allowed: &[OrchestratorState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(Error::invalid_state(state, allowed))
        }
    }

    fn loaded_config(&self) -> Result<Arc<Config>> {
        self.config()
            .ok_or_else(|| Error::Config("no configuration loaded".to_string()))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("index_state", &self.index().state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn index(&self) -> Arc<IndexSubsystem> {
        Arc::clone(&lock(&self.index).subsystem)
    }

    fn on_index_statechange(&self, index: &IndexSubsystem, _old: IndexState, new: IndexState) {
        match new {
            IndexState::Error => {
                *lock(&self.exception) = index.exception();
                self.state.set(OrchestratorState::Error);
            }
            IndexState::Loading => {
                self.state.set(LoadingIndex);
            }
            IndexState::Loaded => {
                self.state.compare_and_set(LoadingIndex, Standby);
            }
            IndexState::New => {}
        }
    }

    fn run_query(
        &self,
        index: &IndexSubsystem,
        config: &Config,
        query: &str,
        handlers: &[Arc<dyn StreamHandler>],
    ) {
        debug!("Query worker started");
        let outcome = catch_unwind(AssertUnwindSafe(|| index.query(config, query, handlers)));

        match outcome {
            Ok(Ok(Some(_))) => {
                self.state.compare_and_set(Querying, Standby);
            }
            // The index is already in Error and the handler mirrored it.
            Ok(Ok(None)) => {}
            Ok(Err(e)) => self.fail(e),
            Err(payload) => self.fail(Error::Service(format!(
                "query worker panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }

    fn fail(&self, e: Error) {
        error!("Orchestrator failed: {}", e);
        *lock(&self.exception) = Some(Arc::new(e));
        self.state.set(OrchestratorState::Error);
    }
}

/// Creates a fresh index subsystem whose state changes drive `orchestrator`.
fn attach(orchestrator: &Weak<Inner>, backend: &Backend) -> AttachedIndex {
    let subsystem = Arc::new(IndexSubsystem::new(backend.clone()));
    let orchestrator = orchestrator.clone();
    let index = Arc::downgrade(&subsystem);

    let subscription = subsystem.subscribe_to_statechange(move |old, new| {
        if let (Some(inner), Some(index)) = (orchestrator.upgrade(), index.upgrade()) {
            inner.on_index_statechange(&index, old, new);
        }
    });

    AttachedIndex {
        subsystem,
        subscription,
    }
}

/// Appended to every query's handlers; returns the orchestrator to `Standby`.
struct CompletionHandler {
    inner: Weak<Inner>,
}

impl StreamHandler for CompletionHandler {
    fn on_completion(&self, _result: &QueryResult) {
        if let Some(inner) = self.inner.upgrade() {
            inner.state.compare_and_set(Querying, Standby);
        }
    }
}
