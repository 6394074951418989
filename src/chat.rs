// Chat turn handling shared by the web UI and the terminal chat.

use anyhow::{Context, Result};
use chrono::Local;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ModelSettings, Provider, SettingsUpdate};
use crate::constants;
use crate::conversation::{ChatStats, Conversation};
use crate::export::{self, ExportFormat};
use crate::llm_interaction::{LlmService, StreamMessage, Usage};
use crate::vector_service::VectorService;

/// Result of one user turn. The reply has already been appended to the log.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ChatOutcome {
    pub reply: String,
    pub is_error: bool,
    pub context_used: bool,
    pub usage: Option<Usage>,
}

pub struct ChatSession {
    pub conversation: Conversation,
    llm: Arc<LlmService>,
    vector: Arc<VectorService>,
    available: Vec<Provider>,
}

impl ChatSession {
    pub fn new(llm: Arc<LlmService>, vector: Arc<VectorService>) -> Self {
        let available: Vec<Provider> = Provider::ALL
            .into_iter()
            .filter(|p| llm.is_configured(*p))
            .collect();
        let mut session = Self {
            conversation: Conversation::new(),
            llm,
            vector,
            available,
        };
        session.update_settings(&SettingsUpdate::default());
        session
    }

    pub fn llm(&self) -> &LlmService {
        &self.llm
    }

    pub fn vector(&self) -> &VectorService {
        &self.vector
    }

    pub fn available_providers(&self) -> &[Provider] {
        &self.available
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.conversation.settings
    }

    /// Apply a settings change. A provider without a key falls back to the
    /// first configured one.
    pub fn update_settings(&mut self, update: &SettingsUpdate) -> &ModelSettings {
        let mut settings = self.conversation.settings.merged(update);
        if let Some(first) = self.available.first() {
            if !self.available.contains(&settings.provider) {
                debug!(requested = %settings.provider, fallback = %first, "Provider not configured");
                settings = settings.merged(&SettingsUpdate {
                    provider: Some(first.as_str().to_string()),
                    model: None,
                    ..Default::default()
                });
            }
        }
        self.conversation.settings = settings;
        &self.conversation.settings
    }

    pub fn start_new_conversation(&mut self) {
        self.conversation.start_new();
        info!(conversation_id = %self.conversation.id, "Started new conversation");
    }

    pub fn clear_chat_history(&mut self) {
        self.conversation.clear_history();
    }

    pub fn stats(&self) -> ChatStats {
        self.conversation.stats()
    }

    async fn fetch_context(&self, input: &str) -> Option<String> {
        if !self.conversation.settings.use_context || !self.vector.is_available() {
            return None;
        }
        match self.vector.get_relevant_context(input).await {
            Ok(context) => context,
            Err(e) => {
                warn!("Failed to retrieve context: {}", e);
                None
            }
        }
    }

    async fn remember(&mut self, user_input: &str, reply: &str) {
        let chunk_index = self.conversation.take_chunk_index();
        if !self.vector.is_available() {
            return;
        }
        let conversation_id = self.conversation.id.to_string();
        if let Err(e) = self
            .vector
            .store_exchange(&conversation_id, user_input, reply, chunk_index)
            .await
        {
            warn!("Error storing conversation chunk: {}", e);
        }
    }

    fn finish_turn(&mut self, result: Result<(String, Option<Usage>), String>, context_used: bool) -> ChatOutcome {
        let (reply, usage, is_error) = match result {
            Ok((content, usage)) if !content.trim().is_empty() => (content, usage, false),
            Ok(_) => (constants::NO_RESPONSE_MESSAGE.to_string(), None, true),
            Err(e) => (format!("Error: {}", e), None, true),
        };
        self.conversation.push_assistant(reply.clone());
        ChatOutcome {
            reply,
            is_error,
            context_used,
            usage,
        }
    }

    /// Run one turn: record the input, gather context, ask the provider and record the reply.
    pub async fn process_user_input(&mut self, input: &str) -> ChatOutcome {
        self.conversation.push_user(input);
        let context = self.fetch_context(input).await;

        let result = self
            .llm
            .generate_response(
                &self.conversation.messages,
                &self.conversation.settings,
                context.as_deref(),
            )
            .await
            .map(|c| (c.content, c.usage))
            .map_err(|e| e.to_string());

        let outcome = self.finish_turn(result, context.is_some());
        if !outcome.is_error {
            self.remember(input, &outcome.reply).await;
        }
        outcome
    }

    /// Like [`process_user_input`](Self::process_user_input), forwarding reply pieces to `tx` as they arrive.
    pub async fn process_user_input_stream(
        &mut self,
        input: &str,
        tx: mpsc::Sender<StreamMessage>,
    ) -> ChatOutcome {
        self.conversation.push_user(input);
        let context = self.fetch_context(input).await;

        let result = self
            .llm
            .generate_stream_response(
                &self.conversation.messages,
                &self.conversation.settings,
                context.as_deref(),
                tx,
            )
            .await
            .map(|content| (content, None))
            .map_err(|e| e.to_string());

        let outcome = self.finish_turn(result, context.is_some());
        if !outcome.is_error {
            self.remember(input, &outcome.reply).await;
        }
        outcome
    }
}

/// A line typed into the terminal chat.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    Message(String),
    New,
    Clear,
    Stats,
    Export {
        format: String,
        path: Option<PathBuf>,
    },
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl ChatCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ChatCommand::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return ChatCommand::Message(line.to_string());
        };
        let mut words = command.split_whitespace();
        match words.next().unwrap_or_default() {
            "new" => ChatCommand::New,
            "clear" => ChatCommand::Clear,
            "stats" => ChatCommand::Stats,
            "help" => ChatCommand::Help,
            "quit" | "exit" => ChatCommand::Quit,
            "export" => ChatCommand::Export {
                format: words.next().unwrap_or("json").to_string(),
                path: words.next().map(PathBuf::from),
            },
            other => ChatCommand::Unknown(other.to_string()),
        }
    }
}

const HELP: &str = "Commands: /new, /clear, /stats, /export <json|txt|csv> [path], /help, /quit";

/// Interactive chat on stdin/stdout.
pub async fn run_terminal_chat(session: &mut ChatSession) -> Result<()> {
    let settings = session.settings();
    println!(
        "{} {} | {} - {} | vector context: {}",
        constants::APP_ICON,
        *constants::APP_TITLE,
        settings.provider.as_str(),
        settings.model,
        if session.vector().is_available() { "on" } else { "off" }
    );
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await.context("Failed to read from stdin")? else {
            break;
        };

        match ChatCommand::parse(&line) {
            ChatCommand::Empty => continue,
            ChatCommand::Quit => break,
            ChatCommand::Help => println!("{}", HELP),
            ChatCommand::New => {
                session.start_new_conversation();
                println!("Started a new conversation ({})", session.conversation.id);
            }
            ChatCommand::Clear => {
                session.clear_chat_history();
                println!("Chat history cleared");
            }
            ChatCommand::Stats => {
                let stats = session.stats();
                println!(
                    "Total messages: {} | User: {} | Assistant: {} | Total characters: {}",
                    stats.total_messages,
                    stats.user_messages,
                    stats.assistant_messages,
                    stats.total_characters
                );
            }
            ChatCommand::Export { format, path } => {
                if let Err(e) = export_to_file(&session.conversation, &format, path).await {
                    println!("{}", e);
                }
            }
            ChatCommand::Unknown(name) => println!("Unknown command '/{}'. {}", name, HELP),
            ChatCommand::Message(text) => {
                let (tx, mut rx) = mpsc::channel::<StreamMessage>(64);
                let printer = tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        if let StreamMessage::Text { text } = msg {
                            print!("{}", text);
                            std::io::stdout().flush().ok();
                        }
                    }
                });
                let outcome = session.process_user_input_stream(&text, tx).await;
                printer.await.ok();
                if outcome.is_error {
                    println!("{}", outcome.reply);
                } else {
                    println!();
                }
            }
        }
    }
    info!("Terminal chat finished");
    Ok(())
}

async fn export_to_file(
    conversation: &Conversation,
    format: &str,
    path: Option<PathBuf>,
) -> Result<()> {
    let format: ExportFormat = format.parse()?;
    let file = export::export_conversation(conversation, format, Local::now())?;
    let path = path.unwrap_or_else(|| PathBuf::from(&file.filename));
    tokio::fs::write(&path, file.content)
        .await
        .with_context(|| format!("Failed to write export to {}", path.display()))?;
    println!("Exported conversation to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn session_with(settings: &Settings) -> ChatSession {
        ChatSession::new(
            Arc::new(LlmService::new(settings)),
            Arc::new(VectorService::unavailable()),
        )
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(ChatCommand::parse("  "), ChatCommand::Empty);
        assert_eq!(
            ChatCommand::parse(" hello there "),
            ChatCommand::Message("hello there".to_string())
        );
        assert_eq!(ChatCommand::parse("/new"), ChatCommand::New);
        assert_eq!(ChatCommand::parse("/exit"), ChatCommand::Quit);
        assert_eq!(
            ChatCommand::parse("/export csv out.csv"),
            ChatCommand::Export {
                format: "csv".to_string(),
                path: Some(PathBuf::from("out.csv"))
            }
        );
        assert_eq!(
            ChatCommand::parse("/export"),
            ChatCommand::Export {
                format: "json".to_string(),
                path: None
            }
        );
        assert_eq!(
            ChatCommand::parse("/dance"),
            ChatCommand::Unknown("dance".to_string())
        );
    }

    #[test]
    fn test_settings_fall_back_to_configured_provider() {
        let settings = Settings {
            gemini_api_key: "g".to_string(),
            ..Settings::default()
        };
        let mut session = session_with(&settings);
        assert_eq!(session.settings().provider, Provider::Gemini);
        assert_eq!(session.settings().model, "gemini-pro");

        let updated = session.update_settings(&SettingsUpdate {
            provider: Some("openai".to_string()),
            ..Default::default()
        });
        assert_eq!(updated.provider, Provider::Gemini);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_records_error_reply() {
        let mut session = session_with(&Settings::default());
        let outcome = session.process_user_input("Hi").await;
        assert!(outcome.is_error);
        assert_eq!(outcome.reply, "Error: OpenAI client not initialized");
        assert_eq!(session.conversation.messages.len(), 2);
        assert_eq!(session.conversation.messages[1].content, outcome.reply);
    }
}
