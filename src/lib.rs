pub mod chat;
pub mod config;
pub mod constants;
pub mod conversation;
pub mod embeddings;
pub mod error;
pub mod export;
pub mod gemini;
pub mod llm_interaction;
pub mod openai;
pub mod vector_service;
pub mod web_server;

pub use chat::{ChatOutcome, ChatSession};
pub use config::{ModelSettings, Provider, Settings, SettingsUpdate};
pub use conversation::{Conversation, Message, Role};
pub use llm_interaction::LlmService;
pub use vector_service::VectorService;
