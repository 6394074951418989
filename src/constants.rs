// Application constants, loaded from environment where they are tunable.

use std::env;

lazy_static::lazy_static! {
    pub static ref APP_TITLE: String = env::var("APP_TITLE").unwrap_or_else(|_| "CitySense".to_string());
    pub static ref DEFAULT_MODEL: String = env::var("DEFAULT_MODEL").unwrap_or_else(|_| "gpt-3.5-turbo".to_string());
    pub static ref MAX_TOKENS: u32 = env::var("MAX_TOKENS").ok().and_then(|v| v.parse().ok()).unwrap_or(2000);
    pub static ref TEMPERATURE: f32 = env::var("TEMPERATURE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.7);
}

pub const APP_ICON: &str = "🤖";

pub const OPENAI_MODELS: &[&str] = &[
    "gpt-4-turbo-preview",
    "gpt-4",
    "gpt-3.5-turbo",
    "gpt-3.5-turbo-16k",
];

pub const GEMINI_MODELS: &[&str] = &["gemini-pro", "gemini-pro-vision"];

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const PINECONE_CONTROL_URL: &str = "https://api.pinecone.io";
pub const PINECONE_API_VERSION: &str = "2024-07";

// Vector database
pub const PINECONE_INDEX_NAME: &str = "citysense-conversations";
pub const EMBEDDING_DIMENSION: usize = 1536;
pub const SIMILARITY_THRESHOLD: f32 = 0.7;
pub const MAX_CONTEXT_CHUNKS: usize = 3;
pub const OPENAI_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const GEMINI_EMBEDDING_MODEL: &str = "embedding-001";

// Bounds applied when validating model settings
pub const MIN_TEMPERATURE: f32 = 0.0;
pub const MAX_TEMPERATURE: f32 = 2.0;
pub const MIN_MAX_TOKENS: u32 = 1;
pub const MAX_MAX_TOKENS: u32 = 4000;

pub const DEFAULT_PROMPT_KEY: &str = "default";

/// System prompt presets, in display order.
pub const SYSTEM_PROMPTS: &[(&str, &str)] = &[
    ("default", "You are a helpful AI assistant. Provide clear, accurate, and helpful responses."),
    ("creative", "You are a creative AI assistant. Think outside the box and provide imaginative, innovative responses."),
    ("analytical", "You are an analytical AI assistant. Provide detailed, logical, and well-reasoned responses with supporting evidence."),
    ("concise", "You are a concise AI assistant. Provide brief, to-the-point responses while maintaining accuracy."),
    ("friendly", "You are a friendly AI assistant. Respond in a warm, conversational, and approachable manner."),
];

pub const EXPORT_FORMATS: &[&str] = &["JSON", "TXT", "CSV"];

pub const NO_RESPONSE_MESSAGE: &str =
    "Sorry, I couldn't generate a response. Please check your API configuration.";

// Gemini has no native streaming here; responses are replayed in pieces of this many chars.
pub const SIMULATED_STREAM_CHUNK: usize = 10;

pub fn system_prompt(key: &str) -> Option<&'static str> {
    SYSTEM_PROMPTS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, prompt)| *prompt)
}

pub fn default_system_prompt() -> &'static str {
    SYSTEM_PROMPTS[0].1
}
