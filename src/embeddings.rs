use tracing::info;

use crate::config::{Provider, Settings};
use crate::constants;
use crate::error::VectorError;
use crate::gemini::GeminiClient;
use crate::openai::OpenAiClient;

/// Hosted embedding model used for conversation memory.
#[derive(Debug, Clone)]
pub enum Embedder {
    OpenAi(OpenAiClient),
    Gemini(GeminiClient),
}

impl Embedder {
    /// Pick an embedder from the configured keys, preferring `preferred` when it is available.
    pub fn from_settings(settings: &Settings, preferred: Provider) -> Option<Self> {
        let order = match preferred {
            Provider::OpenAi => [Provider::OpenAi, Provider::Gemini],
            Provider::Gemini => [Provider::Gemini, Provider::OpenAi],
        };
        let provider = order
            .into_iter()
            .find(|p| settings.is_provider_configured(*p))?;

        let embedder = match provider {
            Provider::OpenAi => Embedder::OpenAi(OpenAiClient::new(
                &settings.openai_api_key,
                &settings.openai_base_url,
            )),
            Provider::Gemini => Embedder::Gemini(GeminiClient::new(
                &settings.gemini_api_key,
                &settings.gemini_base_url,
            )),
        };
        info!(provider = %provider, model = embedder.model(), "Selected embedding model");
        Some(embedder)
    }

    pub fn provider(&self) -> Provider {
        match self {
            Embedder::OpenAi(_) => Provider::OpenAi,
            Embedder::Gemini(_) => Provider::Gemini,
        }
    }

    pub fn model(&self) -> &'static str {
        match self {
            Embedder::OpenAi(_) => constants::OPENAI_EMBEDDING_MODEL,
            Embedder::Gemini(_) => constants::GEMINI_EMBEDDING_MODEL,
        }
    }

    /// Vector length produced by the model.
    pub fn dimension(&self) -> usize {
        match self {
            Embedder::OpenAi(_) => constants::EMBEDDING_DIMENSION,
            Embedder::Gemini(_) => 768,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        let result = match self {
            Embedder::OpenAi(client) => client.embed(text, self.model()).await,
            Embedder::Gemini(client) => client.embed(text, self.model()).await,
        };
        let embedding = result.map_err(|e| VectorError::Embedding(e.to_string()))?;
        if embedding.is_empty() {
            return Err(VectorError::Embedding("empty embedding returned".to_string()));
        }
        Ok(embedding)
    }
}
