use super::model::LocalEmbedder;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const OPENAI_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
const BATCH_SIZE: usize = 64;
const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Turns text into vectors.
pub trait Embedder: Send + Sync {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
}

/// Builds the embedder for a configuration.
pub trait EmbedderFactory: Send + Sync {
    fn create(&self, config: &Config) -> Result<Arc<dyn Embedder>>;
}

impl<F> EmbedderFactory for F
where
    F: Fn(&Config) -> Result<Arc<dyn Embedder>> + Send + Sync,
{
    fn create(&self, config: &Config) -> Result<Arc<dyn Embedder>> {
        self(config)
    }
}

/// Picks the provider named by the `embedding_provider` config key.
#[derive(Debug, Clone)]
pub struct DefaultEmbedderFactory {
    models_dir: PathBuf,
}

impl DefaultEmbedderFactory {
    pub fn new(models_dir: PathBuf) -> Self {
        Self { models_dir }
    }
}

impl EmbedderFactory for DefaultEmbedderFactory {
    fn create(&self, config: &Config) -> Result<Arc<dyn Embedder>> {
        match config.embedding_provider() {
            "local" => Ok(Arc::new(LocalEmbedder::init(&self.models_dir)?)),
            _ => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        }
    }
}

/// Embeddings from the OpenAI HTTP API, authenticated with the configured credential.
pub struct OpenAiEmbedder {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config
            .credential()
            .ok_or_else(|| Error::Authentication("no credential configured".to_string()))?
            .to_string();

        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: OPENAI_EMBEDDING_MODEL.to_string(),
            endpoint: OPENAI_EMBEDDINGS_URL.to_string(),
        })
    }

    /// Point at a compatible endpoint instead of api.openai.com
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Retry strategy: 429 and 5xx back off exponentially, other 4xx fail at once.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1));
                debug!("Retrying embedding request in {:?}", delay);
                std::thread::sleep(delay);
            }

            let response = match self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("Embedding request failed: {}", e);
                    last_err = Some(Error::Http(e));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let json: Value = response.json()?;
                return parse_embeddings_response(&json);
            }

            let body_text = response.text().unwrap_or_default();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(Error::Authentication(body_text));
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                last_err = Some(Error::Service(format!("Embedding API error {}: {}", status, body_text)));
                continue;
            }
            return Err(Error::Service(format!("Embedding API error {}: {}", status, body_text)));
        }

        Err(last_err.unwrap_or_else(|| Error::Service("Embedding failed after retries".to_string())))
    }
}

impl Embedder for OpenAiEmbedder {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(BATCH_SIZE) {
            embeddings.extend(self.embed_batch(batch)?);
        }
        Ok(embeddings)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| Error::Service("Embedding API returned no vectors".to_string()))
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_embeddings_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Service("Invalid embedding response: missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Service("Invalid embedding response: missing embedding".to_string()))?;
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map_or(position, |i| i as usize);
        let vector: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}
