use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::config::ModelSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Local::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub total_characters: usize,
}

/// One chat: its id, the ordered message log and the settings it is run with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub messages: Vec<Message>,
    pub settings: ModelSettings,
    /// Index for the next stored exchange. Survives `clear_history` so stored
    /// chunk ids are never reused within one conversation.
    #[serde(default)]
    pub next_chunk_index: usize,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self::with_settings(ModelSettings::default())
    }

    pub fn with_settings(settings: ModelSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            messages: Vec::new(),
            settings,
            next_chunk_index: 0,
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    /// Drop the log and start under a fresh id. Settings carry over.
    pub fn start_new(&mut self) {
        self.messages.clear();
        self.id = Uuid::new_v4();
        self.next_chunk_index = 0;
    }

    pub fn clear_history(&mut self) {
        self.messages.clear();
    }

    /// Hand out the chunk index for a completed exchange.
    pub fn take_chunk_index(&mut self) -> usize {
        let index = self.next_chunk_index;
        self.next_chunk_index += 1;
        index
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of assistant replies so far.
    pub fn exchange_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count()
    }

    pub fn stats(&self) -> ChatStats {
        ChatStats {
            total_messages: self.messages.len(),
            user_messages: self.messages.iter().filter(|m| m.role == Role::User).count(),
            assistant_messages: self.exchange_count(),
            total_characters: self.messages.iter().map(|m| m.content.chars().count()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_new() {
        let conversation = Conversation::new();
        assert!(conversation.is_empty());
        assert_eq!(conversation.settings, ModelSettings::default());
    }

    #[test]
    fn test_push_and_stats() {
        let mut conversation = Conversation::new();
        conversation.push_user("Hello");
        conversation.push_assistant("Hi there!");
        conversation.push_user("Où est la gare?");

        let stats = conversation.stats();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.user_messages, 2);
        assert_eq!(stats.assistant_messages, 1);
        // Characters, not bytes
        assert_eq!(stats.total_characters, 5 + 9 + 15);
    }

    #[test]
    fn test_start_new_rotates_id() {
        let mut conversation = Conversation::new();
        let old_id = conversation.id;
        conversation.push_user("Hello");
        conversation.start_new();
        assert!(conversation.is_empty());
        assert_ne!(conversation.id, old_id);
    }

    #[test]
    fn test_clear_history_keeps_id() {
        let mut conversation = Conversation::new();
        let id = conversation.id;
        conversation.push_user("Hello");
        conversation.clear_history();
        assert!(conversation.is_empty());
        assert_eq!(conversation.id, id);
    }

    #[test]
    fn test_chunk_index_outlives_clear_history() {
        let mut conversation = Conversation::new();
        assert_eq!(conversation.take_chunk_index(), 0);
        conversation.clear_history();
        assert_eq!(conversation.take_chunk_index(), 1);

        conversation.start_new();
        assert_eq!(conversation.take_chunk_index(), 0);
    }

    #[test]
    fn test_role_serialization() {
        let msg = Message::assistant("ok");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"], "ok");
        assert_eq!(Role::User.title(), "User");
    }
}
