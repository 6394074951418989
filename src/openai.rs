use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

use crate::config::Provider;
use crate::conversation::Message;
use crate::error::LlmError;
use crate::llm_interaction::{Completion, StreamMessage, Usage};

const PROVIDER: Provider = Provider::OpenAi;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// One parsed line of an OpenAI server-sent event stream.
#[derive(Debug, PartialEq)]
pub enum SseLine {
    Delta(String),
    Done,
    Skip,
}

/// Interpret a single SSE line. Comments, blank lines, role-only deltas and unparsable data are skipped.
pub fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .map(SseLine::Delta)
            .unwrap_or(SseLine::Skip),
        Err(e) => {
            warn!("Failed to parse stream chunk: {} - Error: {}", data, e);
            SseLine::Skip
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.api_key)
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
            error!(%status, %body, "OpenAI API request failed");
            return Err(LlmError::Api {
                provider: PROVIDER,
                status,
                body,
            });
        }
        Ok(response)
    }

    #[instrument(skip(self, messages), fields(history_len = messages.len()))]
    pub async fn chat(
        &self,
        messages: &[Message],
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion, LlmError> {
        let request = chat_request(messages, model, temperature, max_tokens, false);
        let response: ChatResponse = self
            .post("chat/completions", &request)
            .await?
            .json()
            .await
            .map_err(|source| LlmError::Http {
                provider: PROVIDER,
                source,
            })?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        debug!(chars = content.len(), "Received OpenAI completion");

        Ok(Completion {
            content,
            usage: response.usage,
        })
    }

    /// Stream a completion, forwarding each content delta as `StreamMessage::Text`.
    /// Returns the accumulated text.
    #[instrument(skip(self, messages, tx), fields(history_len = messages.len()))]
    pub async fn chat_stream(
        &self,
        messages: &[Message],
        model: &str,
        temperature: f32,
        max_tokens: u32,
        tx: &mpsc::Sender<StreamMessage>,
    ) -> Result<String, LlmError> {
        let request = chat_request(messages, model, temperature, max_tokens, true);
        let response = self.post("chat/completions", &request).await?;

        let mut stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut accumulated = String::new();

        'outer: while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|source| LlmError::Http {
                provider: PROVIDER,
                source,
            })?;
            pending.extend_from_slice(&bytes);

            // Only complete lines are parsed; a partial line waits for the next chunk.
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(&line) {
                    SseLine::Delta(text) => {
                        accumulated.push_str(&text);
                        let _ = tx.send(StreamMessage::Text { text }).await;
                    }
                    SseLine::Done => break 'outer,
                    SseLine::Skip => {}
                }
            }
        }

        Ok(accumulated)
    }

    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, LlmError> {
        let request = EmbeddingRequest { model, input: text };
        let response: EmbeddingResponse = self
            .post("embeddings", &request)
            .await?
            .json()
            .await
            .map_err(|source| LlmError::Http {
                provider: PROVIDER,
                source,
            })?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER,
                message: "embedding response contained no data".to_string(),
            })
    }
}

fn chat_request<'a>(
    messages: &'a [Message],
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
) -> ChatRequest<'a> {
    ChatRequest {
        model,
        messages: messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect(),
        temperature,
        max_tokens,
        stream,
    }
}
