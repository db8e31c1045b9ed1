use super::embedding::Embedder;
use crate::core::error::{Error, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use hf_hub::api::sync::Api;
use std::path::Path;
use std::sync::Mutex;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer};
use tracing::info;

/// Default local embedding model (small, strong, good for semantic search)
/// https://huggingface.co/BAAI/bge-small-en-v1.5
const DEFAULT_MODEL: &str = "BAAI/bge-small-en-v1.5";

/// Instruction BGE models expect in front of search queries
const QUERY_INSTRUCTION: &str = "Represent this sentence for searching relevant passages: ";

const BATCH_SIZE: usize = 32;

/// BERT embedding model run locally with candle
pub struct LocalEmbedder {
    model: Mutex<BertModel>,
    tokenizer: Mutex<Tokenizer>,
    device: Device,
}

impl LocalEmbedder {
    /// Load the model from `models_dir`, downloading it first if needed
    pub fn init(models_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(models_dir)?;

        let model_path = models_dir.join("model.safetensors");
        let config_path = models_dir.join("config.json");
        let tokenizer_path = models_dir.join("tokenizer.json");

        if !(model_path.exists() && config_path.exists() && tokenizer_path.exists()) {
            Self::download_model(&model_path, &config_path, &tokenizer_path)?;
        }

        let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
        let (model, tokenizer) = Self::load_model_files(&model_path, &config_path, &tokenizer_path, &device)?;

        Ok(Self {
            model: Mutex::new(model),
            tokenizer: Mutex::new(tokenizer),
            device,
        })
    }

    /// Download model files from HuggingFace Hub into the models directory
    fn download_model(model_path: &Path, config_path: &Path, tokenizer_path: &Path) -> Result<()> {
        info!("Downloading embedding model {}", DEFAULT_MODEL);

        let api = Api::new()?;
        let repo = api.model(DEFAULT_MODEL.to_string());

        std::fs::copy(repo.get("config.json")?, config_path)?;
        std::fs::copy(repo.get("tokenizer.json")?, tokenizer_path)?;
        std::fs::copy(repo.get("model.safetensors")?, model_path)?;

        info!("Embedding model downloaded");
        Ok(())
    }

    fn load_model_files(
        model_path: &Path,
        config_path: &Path,
        tokenizer_path: &Path,
        device: &Device,
    ) -> Result<(BertModel, Tokenizer)> {
        let config_content = std::fs::read_to_string(config_path)?;
        let bert_config: BertConfig = serde_json::from_str(&config_content)
            .map_err(|e| Error::Model(format!("Failed to parse config: {}", e)))?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| Error::Tokenizer(format!("Failed to load tokenizer: {}", e)))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        // Load model weights using memory mapping
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[model_path], DTYPE, device)
                .map_err(|e| Error::Model(format!("Failed to load weights: {}", e)))?
        };

        let model = BertModel::load(vb, &bert_config)
            .map_err(|e| Error::Model(format!("Failed to load model: {}", e)))?;

        info!("Embedding model loaded from {}", model_path.display());
        Ok((model, tokenizer))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let tokens = {
            let tokenizer = self
                .tokenizer
                .lock()
                .map_err(|e| Error::Model(format!("Failed to lock tokenizer: {}", e)))?;
            tokenizer
                .encode_batch(texts.to_vec(), true)
                .map_err(|e| Error::Tokenizer(format!("Tokenization failed: {}", e)))?
        };

        let token_ids = tokens
            .iter()
            .map(|t| Tensor::new(t.get_ids(), &self.device).map_err(Error::Candle))
            .collect::<Result<Vec<Tensor>>>()?;
        let token_ids = Tensor::stack(&token_ids, 0)?;
        let token_type_ids = token_ids.zeros_like()?;

        let embeddings = {
            let model = self
                .model
                .lock()
                .map_err(|e| Error::Model(format!("Failed to lock model: {}", e)))?;
            model.forward(&token_ids, &token_type_ids)?
        };

        // CLS pooling: [batch, seq, hidden] -> [batch, hidden]
        let pooled = embeddings.narrow(1, 0, 1)?.squeeze(1)?;
        let normalized = pooled.broadcast_div(&pooled.sqr()?.sum_keepdim(1)?.sqrt()?)?;

        Ok(normalized.to_vec2::<f32>()?)
    }
}

impl Embedder for LocalEmbedder {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut result = Vec::with_capacity(texts.len());
        for batch in texts.chunks(BATCH_SIZE) {
            result.extend(self.embed_batch(batch)?);
        }
        Ok(result)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[format!("{}{}", QUERY_INSTRUCTION, text)])?
            .pop()
            .ok_or_else(|| Error::Model("Model returned no embedding".to_string()))
    }
}
