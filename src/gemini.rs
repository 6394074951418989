use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::config::Provider;
use crate::conversation::{Message, Role};
use crate::error::LlmError;
use crate::llm_interaction::{Completion, Usage};

const PROVIDER: Provider = Provider::Gemini;

// Sent when there is nothing else to say, e.g. a history holding only a system prompt.
const EMPTY_PROMPT: &str = "Hello";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiPart {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest<'a> {
    model: String,
    content: EmbedContent<'a>,
    task_type: &'static str,
}

#[derive(Debug, Serialize)]
struct EmbedContent<'a> {
    parts: [EmbedPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct EmbedPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Debug, Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

fn content(role: &str, text: impl Into<String>) -> GeminiContent {
    GeminiContent {
        role: Some(role.to_string()),
        parts: vec![GeminiPart { text: text.into() }],
    }
}

/// Convert a chat log into Gemini contents.
///
/// Gemini has no system role: system messages are dropped and the first one is
/// prepended to the opening user turn. Assistant turns become `model` turns.
pub fn to_gemini_contents(messages: &[Message]) -> Vec<GeminiContent> {
    let mut contents: Vec<GeminiContent> = messages
        .iter()
        .filter_map(|m| match m.role {
            Role::System => None,
            Role::User => Some(content("user", m.content.as_str())),
            Role::Assistant => Some(content("model", m.content.as_str())),
        })
        .collect();

    let system = messages.iter().find(|m| m.role == Role::System);
    if let (Some(system), Some(first)) = (system, contents.first_mut()) {
        if first.role.as_deref() == Some("user") {
            if let Some(part) = first.parts.first_mut() {
                part.text = format!("{}\n\n{}", system.content, part.text);
            }
        }
    }

    if contents.is_empty() {
        contents.push(content("user", EMPTY_PROMPT));
    }
    contents
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: Serialize>(
        &self,
        model: &str,
        action: &str,
        body: &T,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/models/{}:{}", self.base_url, model, action);
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await
            .map_err(|source| LlmError::Http {
                provider: PROVIDER,
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(%status, %body, "Gemini API request failed");
            return Err(LlmError::Api {
                provider: PROVIDER,
                status,
                body,
            });
        }
        Ok(response)
    }

    #[instrument(skip(self, messages), fields(history_len = messages.len()))]
    pub async fn generate(
        &self,
        messages: &[Message],
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion, LlmError> {
        let config = GenerationConfig {
            temperature,
            max_output_tokens: max_tokens,
        };
        self.generate_content(messages, model, Some(config)).await
    }

    /// Generate with the model's own defaults, sending no `generationConfig`.
    pub async fn generate_with_defaults(
        &self,
        messages: &[Message],
        model: &str,
    ) -> Result<Completion, LlmError> {
        self.generate_content(messages, model, None).await
    }

    async fn generate_content(
        &self,
        messages: &[Message],
        model: &str,
        generation_config: Option<GenerationConfig>,
    ) -> Result<Completion, LlmError> {
        let request = GenerateRequest {
            contents: to_gemini_contents(messages),
            generation_config,
        };

        let response: GenerateResponse = self
            .post(model, "generateContent", &request)
            .await?
            .json()
            .await
            .map_err(|source| LlmError::Http {
                provider: PROVIDER,
                source,
            })?;

        let content = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER,
                message: "response contained no candidates".to_string(),
            })?;
        debug!(chars = content.len(), "Received Gemini response");

        let usage = response.usage_metadata.unwrap_or_default();
        Ok(Completion {
            content,
            usage: Some(Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            }),
        })
    }

    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, LlmError> {
        let request = EmbedRequest {
            model: format!("models/{}", model),
            content: EmbedContent {
                parts: [EmbedPart { text }],
            },
            task_type: "RETRIEVAL_DOCUMENT",
        };
        let response: EmbedResponse = self
            .post(model, "embedContent", &request)
            .await?
            .json()
            .await
            .map_err(|source| LlmError::Http {
                provider: PROVIDER,
                source,
            })?;
        Ok(response.embedding.values)
    }
}
