#![allow(dead_code)]

use alphageist::core::config::{CREDENTIAL, INDEX_LOCATION, SEARCH_PATHS};
use alphageist::search::llm::split_sources;
use alphageist::{
    Backend, Config, ConfigStore, Document, DocumentLoader, Embedder, FsDocumentLoader,
    IndexPool, JsonConfigStore, LanguageModel, LoadingContext, Orchestrator, OrchestratorState,
    QueryResult, Result, ScoredEntry, StreamHandler,
};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const DIM: usize = 64;

/// Deterministic bag-of-words embedding
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn embed(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; DIM];
        for word in text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in word.bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x100000001b3);
            }
            vector[(hash % DIM as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

impl Embedder for HashEmbedder {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::embed(t)).collect())
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::embed(text))
    }
}

/// Streams a canned answer citing the best-ranked source
pub struct EchoModel;

impl LanguageModel for EchoModel {
    fn answer(
        &self,
        query: &str,
        context: &[ScoredEntry],
        handlers: &[Arc<dyn StreamHandler>],
    ) -> Result<QueryResult> {
        let source = context
            .first()
            .map(|scored| scored.entry.source.clone())
            .unwrap_or_default();
        let text = format!("You asked: {}\nSOURCES: {}", query, source);

        for token in text.split_inclusive(' ') {
            for handler in handlers {
                handler.on_token(token);
            }
        }
        let result = split_sources(&text);
        for handler in handlers {
            handler.on_completion(&result);
        }
        Ok(result)
    }
}

/// Fails every query
pub struct FailingModel;

impl LanguageModel for FailingModel {
    fn answer(
        &self,
        _query: &str,
        _context: &[ScoredEntry],
        _handlers: &[Arc<dyn StreamHandler>],
    ) -> Result<QueryResult> {
        Err(alphageist::Error::Service("model unavailable".to_string()))
    }
}

/// A latch that blocks workers until the test opens it
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.changed.notify_all();
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.changed.wait(open).unwrap();
        }
    }

    /// Wait until opened or `ctx` is cancelled; true if opened
    pub fn wait_or_cancel(&self, ctx: &LoadingContext) -> bool {
        let mut open = self.open.lock().unwrap();
        while !*open {
            if ctx.is_cancelled() {
                return false;
            }
            open = self
                .changed
                .wait_timeout(open, Duration::from_millis(10))
                .unwrap()
                .0;
        }
        true
    }
}

/// Filesystem loader that holds each load until its gate opens
pub struct GatedLoader {
    pub gate: Arc<Gate>,
    /// When false the loader ignores cancellation and returns its documents anyway
    pub honor_cancel: bool,
}

impl DocumentLoader for GatedLoader {
    fn count(&self, roots: &[PathBuf]) -> Result<usize> {
        FsDocumentLoader::new().count(roots)
    }

    fn load(&self, roots: &[PathBuf], ctx: &LoadingContext) -> Result<Vec<Document>> {
        if self.honor_cancel {
            if !self.gate.wait_or_cancel(ctx) {
                return Err(alphageist::Error::LoadingCancelled);
            }
            FsDocumentLoader::new().load(roots, ctx)
        } else {
            self.gate.wait();
            FsDocumentLoader::new().load(roots, &LoadingContext::new())
        }
    }
}

/// Language model that holds each answer until its gate opens
pub struct GatedModel {
    pub gate: Arc<Gate>,
}

impl LanguageModel for GatedModel {
    fn answer(
        &self,
        query: &str,
        context: &[ScoredEntry],
        handlers: &[Arc<dyn StreamHandler>],
    ) -> Result<QueryResult> {
        self.gate.wait();
        EchoModel.answer(query, context, handlers)
    }
}

/// Records everything streamed to it
#[derive(Default)]
pub struct RecordingStream {
    pub tokens: Mutex<Vec<String>>,
    pub completions: Mutex<Vec<QueryResult>>,
}

impl StreamHandler for RecordingStream {
    fn on_token(&self, token: &str) {
        self.tokens.lock().unwrap().push(token.to_string());
    }

    fn on_completion(&self, result: &QueryResult) {
        self.completions.lock().unwrap().push(result.clone());
    }
}

pub fn test_backend() -> Backend {
    Backend {
        loader: Arc::new(FsDocumentLoader::new()),
        embedder: Arc::new(|_: &Config| -> Result<Arc<dyn Embedder>> { Ok(Arc::new(HashEmbedder)) }),
        language_model: Arc::new(|_: &Config| -> Result<Arc<dyn LanguageModel>> {
            Ok(Arc::new(EchoModel))
        }),
        pool: Arc::new(IndexPool::new()),
    }
}

pub fn with_model<M: LanguageModel + 'static>(backend: Backend, model: M) -> Backend {
    let model: Arc<dyn LanguageModel> = Arc::new(model);
    backend.with_language_model(Arc::new(move |_: &Config| -> Result<Arc<dyn LanguageModel>> {
        Ok(Arc::clone(&model))
    }))
}

/// Temporary document folder, index location and config file
pub struct Fixture {
    pub dir: TempDir,
    pub docs: PathBuf,
    pub index: PathBuf,
    pub config_path: PathBuf,
}

impl Fixture {
    /// A document folder holding one Markdown file
    pub fn new() -> Self {
        let fixture = Self::empty();
        fixture.add_document(
            "solar.md",
            "# Solar System\n\nThe sun is a star at the centre of the solar system.\n\n\
             ## Planets\n\nJupiter is the largest planet orbiting the sun.",
        );
        fixture
    }

    /// An empty document folder
    pub fn empty() -> Self {
        let dir = TempDir::new().unwrap();
        let docs = dir.path().join("docs");
        let index = dir.path().join("index");
        fs::create_dir_all(&docs).unwrap();
        let fixture = Self {
            config_path: dir.path().join("config.json"),
            dir,
            docs,
            index,
        };
        fixture.write_config(&fixture.config());
        fixture
    }

    pub fn add_document(&self, name: &str, content: impl AsRef<[u8]>) {
        fs::write(self.docs.join(name), content).unwrap();
    }

    pub fn config(&self) -> Config {
        config_for(&self.docs, &self.index)
    }

    pub fn write_config(&self, config: &Config) {
        JsonConfigStore::new(&self.config_path).save(config).unwrap();
    }

    pub fn store(&self) -> Arc<dyn ConfigStore> {
        Arc::new(JsonConfigStore::new(&self.config_path))
    }

    pub fn orchestrator(&self, backend: Backend) -> Orchestrator {
        Orchestrator::new(self.store(), backend)
    }
}

/// Zip archive holding the given parts, laid out like an Office document
pub fn office_archive(parts: Vec<(String, String)>) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in parts {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        writer.start_file(name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn pptx(slides: &[&str]) -> Vec<u8> {
    let parts = slides
        .iter()
        .enumerate()
        .map(|(i, text)| {
            (
                format!("ppt/slides/slide{}.xml", i + 1),
                format!(
                    "<p:sld xmlns:p=\"p\" xmlns:a=\"a\"><p:cSld><p:spTree><p:sp><p:txBody>\
                     <a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>",
                    text
                ),
            )
        })
        .collect();
    office_archive(parts)
}

pub fn docx(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    office_archive(vec![(
        "word/document.xml".to_string(),
        format!("<w:document xmlns:w=\"w\"><w:body>{}</w:body></w:document>", body),
    )])
}

pub fn config_for(docs: &Path, index: &Path) -> Config {
    let mut config = Config::new();
    config.set(CREDENTIAL, "sk-test");
    config.set(SEARCH_PATHS, vec![docs.to_string_lossy().into_owned()]);
    config.set(INDEX_LOCATION, index.to_string_lossy().into_owned());
    config
}

pub type Transitions<S> = Arc<Mutex<Vec<(S, S)>>>;

pub fn record_states(orchestrator: &Orchestrator) -> Transitions<OrchestratorState> {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&transitions);
    orchestrator.subscribe_to_statechange(move |old, new| sink.lock().unwrap().push((old, new)));
    transitions
}

/// Poll `condition` until it holds or ten seconds pass
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
