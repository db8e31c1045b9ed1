use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::storage::vectors::ScoredEntry;
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const SOURCES_MARKER: &str = "SOURCES:";

const SYSTEM_PROMPT: &str = "You answer questions using only the extracted document parts you are given. \
If the parts do not contain the answer, say that you don't know. \
End your answer with a final line of the form \"SOURCES: <source>, <source>\" \
listing the sources you used.";

/// Final answer of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub answer: String,
    /// Comma-separated source paths cited by the model
    pub sources: String,
}

impl QueryResult {
    pub fn source_list(&self) -> Vec<&str> {
        self.sources
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Receives a streamed answer.
///
/// Handlers are called on the query worker thread. `on_token` fires zero or
/// more times, then `on_completion` fires once.
pub trait StreamHandler: Send + Sync {
    fn on_token(&self, _token: &str) {}

    fn on_completion(&self, _result: &QueryResult) {}
}

/// Turns a question and retrieved context into an answer with sources.
pub trait LanguageModel: Send + Sync {
    fn answer(
        &self,
        query: &str,
        context: &[ScoredEntry],
        handlers: &[Arc<dyn StreamHandler>],
    ) -> Result<QueryResult>;
}

/// Builds the language model for a configuration.
pub trait LanguageModelFactory: Send + Sync {
    fn create(&self, config: &Config) -> Result<Arc<dyn LanguageModel>>;
}

impl<F> LanguageModelFactory for F
where
    F: Fn(&Config) -> Result<Arc<dyn LanguageModel>> + Send + Sync,
{
    fn create(&self, config: &Config) -> Result<Arc<dyn LanguageModel>> {
        self(config)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLanguageModelFactory;

impl LanguageModelFactory for DefaultLanguageModelFactory {
    fn create(&self, config: &Config) -> Result<Arc<dyn LanguageModel>> {
        Ok(Arc::new(OpenAiChat::new(config)?))
    }
}

#[derive(Deserialize, Debug)]
struct ChatStreamChunk {
    choices: Option<Vec<ChatStreamChoice>>,
}

#[derive(Deserialize, Debug)]
struct ChatStreamChoice {
    delta: Option<ChatStreamDelta>,
}

#[derive(Deserialize, Debug)]
struct ChatStreamDelta {
    content: Option<String>,
}

/// Streaming chat completions from the OpenAI API.
pub struct OpenAiChat {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    temperature: f64,
    endpoint: String,
}

impl OpenAiChat {
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
            model: config.model_name().to_string(),
            temperature: config.temperature(),
            endpoint: OPENAI_CHAT_URL.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl LanguageModel for OpenAiChat {
    fn answer(
        &self,
        query: &str,
        context: &[ScoredEntry],
        handlers: &[Arc<dyn StreamHandler>],
    ) -> Result<QueryResult> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "stream": true,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_prompt(query, context)},
            ],
        });

        debug!("Sending query to {} with {} context chunks", self.model, context.len());
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().unwrap_or_default();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(Error::Authentication(body_text));
            }
            return Err(Error::Service(format!("Chat API error {}: {}", status, body_text)));
        }

        let mut full_text = String::new();
        for line in BufReader::new(response).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line == "data: [DONE]" {
                continue;
            }

            let Some(json_str) = line.strip_prefix("data: ") else {
                continue;
            };
            let chunk = match serde_json::from_str::<ChatStreamChunk>(json_str) {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("Ignoring malformed stream chunk: {}", e);
                    continue;
                }
            };

            for content in chunk
                .choices
                .into_iter()
                .flatten()
                .filter_map(|choice| choice.delta.and_then(|d| d.content))
            {
                for handler in handlers {
                    handler.on_token(&content);
                }
                full_text.push_str(&content);
            }
        }

        let result = split_sources(&full_text);
        for handler in handlers {
            handler.on_completion(&result);
        }
        Ok(result)
    }
}

/// Render retrieved chunks and the question into the user message
pub fn build_prompt(query: &str, context: &[ScoredEntry]) -> String {
    let mut prompt = String::new();
    for scored in context {
        let entry = &scored.entry;
        prompt.push_str("Content: ");
        if !entry.context.is_empty() {
            prompt.push_str(&entry.context);
            prompt.push('\n');
        }
        prompt.push_str(&entry.text);
        prompt.push_str("\nSource: ");
        prompt.push_str(&entry.source);
        prompt.push_str("\n\n");
    }
    prompt.push_str("QUESTION: ");
    prompt.push_str(query);
    prompt
}

/// Split a model answer into the text and its trailing `SOURCES:` list
pub fn split_sources(text: &str) -> QueryResult {
    match text.rfind(SOURCES_MARKER) {
        Some(idx) => QueryResult {
            answer: text[..idx].trim().to_string(),
            sources: text[idx + SOURCES_MARKER.len()..].trim().to_string(),
        },
        None => QueryResult {
            answer: text.trim().to_string(),
            sources: String::new(),
        },
    }
}
