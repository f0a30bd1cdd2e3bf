//! Embedding generation using OpenAI

use async_openai::{
    config::OpenAIConfig,
    types::{CreateEmbeddingRequestArgs, EmbeddingInput},
    Client as OpenAIClient,
};
use async_trait::async_trait;
use tracing::{debug, info};

use super::EmbeddingFunc;
use crate::error::{Error, Result};

const DEFAULT_MODEL: &str = "text-embedding-3-small";
const MAX_INPUT_CHARS: usize = 8000;

/// Embedding function backed by the OpenAI embeddings API.
pub struct OpenAiEmbedding {
    client: OpenAIClient<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedding {
    /// Create from `OPENAI_API_KEY` (and `OPENAI_API_BASE` when set).
    pub fn new() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY not set".to_string()))?;
        let api_base = std::env::var("OPENAI_API_BASE").ok();
        Ok(Self::with_config(api_key, api_base, DEFAULT_MODEL))
    }

    pub fn with_config(
        api_key: impl Into<String>,
        api_base: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key.into());
        if let Some(base) = api_base {
            config = config.with_api_base(base);
        }

        Self {
            client: OpenAIClient::with_config(config),
            model: model.into(),
        }
    }

    /// Create with custom model
    pub fn with_model(model: impl Into<String>) -> Result<Self> {
        let mut service = Self::new()?;
        service.model = model.into();
        Ok(service)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl EmbeddingFunc for OpenAiEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(model = %self.model, "Generating embeddings for {} texts", texts.len());

        let input: Vec<String> = texts
            .iter()
            .map(|t| truncate_chars(t, MAX_INPUT_CHARS).to_string())
            .collect();

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(input))
            .build()
            .map_err(|err| Error::Embedding(err.to_string()))?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|err| Error::Embedding(err.to_string()))?;

        info!(
            "Generated {} embeddings, tokens used: {}",
            response.data.len(),
            response.usage.total_tokens
        );

        let mut data = response.data;
        if data.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                data.len()
            )));
        }
        data.sort_by_key(|embedding| embedding.index);

        Ok(data.into_iter().map(|e| e.embedding).collect())
    }

    /// Get the embedding dimension for the current model
    fn dimension(&self) -> usize {
        match self.model.as_str() {
            "text-embedding-3-small" => 1536,
            "text-embedding-3-large" => 3072,
            "text-embedding-ada-002" => 1536,
            _ => 1536, // default
        }
    }
}
