// Provider dispatch for chat completions, streaming and connection checks.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::{ModelSettings, Provider, Settings};
use crate::constants;
use crate::conversation::{Message, Role};
use crate::error::LlmError;
use crate::gemini::GeminiClient;
use crate::openai::OpenAiClient;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub usage: Option<Usage>,
}

/// Events emitted while a response streams in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "payload")]
pub enum StreamMessage {
    Start,
    Text { text: String },
    End,
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: ConnectionState,
    pub message: String,
}

impl ConnectionStatus {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: ConnectionState::Success,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: ConnectionState::Error,
            message: message.into(),
        }
    }
}

/// Build the message list sent to a provider: the system prompt (with any
/// retrieved context appended) followed by the chat history.
pub fn build_request_messages(
    history: &[Message],
    settings: &ModelSettings,
    context: Option<&str>,
) -> Vec<Message> {
    let mut system = settings.system_prompt.clone();
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        system.push_str("\n\nRelevant context from previous conversations:\n");
        system.push_str(context);
    }

    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(Message::system(system));
    messages.extend(history.iter().filter(|m| m.role != Role::System).cloned());
    messages
}

/// Split text into pieces of at most `size` characters.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct LlmService {
    openai: Option<OpenAiClient>,
    gemini: Option<GeminiClient>,
}

impl LlmService {
    pub fn new(settings: &Settings) -> Self {
        let openai = settings
            .is_provider_configured(Provider::OpenAi)
            .then(|| OpenAiClient::new(&settings.openai_api_key, &settings.openai_base_url));
        let gemini = settings
            .is_provider_configured(Provider::Gemini)
            .then(|| GeminiClient::new(&settings.gemini_api_key, &settings.gemini_base_url));
        info!(
            openai = openai.is_some(),
            gemini = gemini.is_some(),
            "Initialized LLM service"
        );
        Self { openai, gemini }
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        match provider {
            Provider::OpenAi => self.openai.is_some(),
            Provider::Gemini => self.gemini.is_some(),
        }
    }

    pub fn get_available_models(&self, provider: Provider) -> &'static [&'static str] {
        provider.models()
    }

    fn openai(&self) -> Result<&OpenAiClient, LlmError> {
        self.openai
            .as_ref()
            .ok_or(LlmError::NotConfigured(Provider::OpenAi))
    }

    fn gemini(&self) -> Result<&GeminiClient, LlmError> {
        self.gemini
            .as_ref()
            .ok_or(LlmError::NotConfigured(Provider::Gemini))
    }

    #[instrument(skip(self, history, settings, context), fields(provider = %settings.provider, model = %settings.model))]
    pub async fn generate_response(
        &self,
        history: &[Message],
        settings: &ModelSettings,
        context: Option<&str>,
    ) -> Result<Completion, LlmError> {
        let messages = build_request_messages(history, settings, context);
        debug!(count = messages.len(), "Sending chat request");
        match settings.provider {
            Provider::OpenAi => {
                self.openai()?
                    .chat(
                        &messages,
                        &settings.model,
                        settings.temperature,
                        settings.max_tokens,
                    )
                    .await
            }
            Provider::Gemini => {
                self.gemini()?
                    .generate(
                        &messages,
                        &settings.model,
                        settings.temperature,
                        settings.max_tokens,
                    )
                    .await
            }
        }
    }

    /// Stream a response through `tx`: `Start`, any number of `Text`, then `End`
    /// on success or `Error` on failure. Returns the full text.
    #[instrument(skip(self, history, settings, context, tx), fields(provider = %settings.provider, model = %settings.model))]
    pub async fn generate_stream_response(
        &self,
        history: &[Message],
        settings: &ModelSettings,
        context: Option<&str>,
        tx: mpsc::Sender<StreamMessage>,
    ) -> Result<String, LlmError> {
        let _ = tx.send(StreamMessage::Start).await;

        let result = match settings.provider {
            Provider::OpenAi => match self.openai() {
                Ok(client) => {
                    let messages = build_request_messages(history, settings, context);
                    client
                        .chat_stream(
                            &messages,
                            &settings.model,
                            settings.temperature,
                            settings.max_tokens,
                            &tx,
                        )
                        .await
                }
                Err(e) => Err(e),
            },
            Provider::Gemini => {
                // Gemini replies arrive whole and are replayed in small pieces.
                match self.generate_response(history, settings, context).await {
                    Ok(completion) => {
                        for text in chunk_text(&completion.content, constants::SIMULATED_STREAM_CHUNK)
                        {
                            let _ = tx.send(StreamMessage::Text { text }).await;
                        }
                        Ok(completion.content)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match &result {
            Ok(_) => {
                let _ = tx.send(StreamMessage::End).await;
            }
            Err(e) => {
                warn!("Streaming response failed: {}", e);
                let _ = tx
                    .send(StreamMessage::Error {
                        error: e.to_string(),
                    })
                    .await;
            }
        }
        result
    }

    /// Send a minimal request to check that a provider's key works.
    pub async fn test_api_connection(&self, provider: Provider) -> ConnectionStatus {
        let probe = [Message::user("Hello")];
        let result = match provider {
            Provider::OpenAi => match &self.openai {
                Some(client) => client.chat(&probe, "gpt-3.5-turbo", 0.0, 5).await,
                None => return ConnectionStatus::error("OpenAI API key not configured"),
            },
            Provider::Gemini => match &self.gemini {
                Some(client) => client.generate_with_defaults(&probe, "gemini-pro").await,
                None => {
                    return ConnectionStatus::error("Gemini API key not configured or invalid")
                }
            },
        };

        match result {
            Ok(_) => ConnectionStatus::success(format!("{} API connected successfully", provider)),
            Err(e) => ConnectionStatus::error(format!("Connection test failed: {}", e)),
        }
    }
}
