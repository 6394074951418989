//! Conversation export to JSON, plain text and CSV.
//!
//! All formatters are pure: the export time is passed in so output is
//! reproducible.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::{fmt, str::FromStr};

use crate::config::ModelSettings;
use crate::conversation::{Conversation, Message};
use crate::error::ExportError;

const TXT_RULE_WIDTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Txt,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Txt => "txt",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Txt => "text/plain",
            ExportFormat::Csv => "text/csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.extension().to_ascii_uppercase())
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "txt" => Ok(ExportFormat::Txt),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

/// A rendered export, ready to be written or served.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportFile {
    pub filename: String,
    pub mime_type: &'static str,
    pub content: String,
}

#[derive(Serialize)]
struct JsonExport<'a> {
    conversation_id: String,
    timestamp: String,
    model_settings: &'a ModelSettings,
    messages: &'a [Message],
}

pub fn export_filename(now: DateTime<Local>, format: ExportFormat) -> String {
    format!(
        "chat_export_{}.{}",
        now.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

pub fn to_json(conversation: &Conversation, now: DateTime<Local>) -> Result<String, ExportError> {
    let export = JsonExport {
        conversation_id: conversation.id.to_string(),
        timestamp: now.to_rfc3339(),
        model_settings: &conversation.settings,
        messages: &conversation.messages,
    };
    Ok(serde_json::to_string_pretty(&export)?)
}

pub fn to_txt(conversation: &Conversation, now: DateTime<Local>) -> String {
    let settings = &conversation.settings;
    let mut content = format!("Chat Export - {}\n", now.format("%Y-%m-%d %H:%M:%S"));
    content.push_str(&format!(
        "Model: {} - {}\n",
        settings.provider.as_str(),
        settings.model
    ));
    content.push_str(&"=".repeat(TXT_RULE_WIDTH));
    content.push_str("\n\n");

    for msg in &conversation.messages {
        content.push_str(&format!("{}: {}\n\n", msg.role.title(), msg.content));
    }
    content
}

pub fn to_csv(conversation: &Conversation) -> Result<String, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["Timestamp", "Role", "Content"])?;
    for msg in &conversation.messages {
        writer.write_record([
            msg.timestamp.to_rfc3339().as_str(),
            msg.role.as_str(),
            msg.content.as_str(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::CsvFlush(e.to_string()))?;
    Ok(String::from_utf8(bytes)?)
}

/// Render `conversation` in `format`. Empty conversations are rejected.
pub fn export_conversation(
    conversation: &Conversation,
    format: ExportFormat,
    now: DateTime<Local>,
) -> Result<ExportFile, ExportError> {
    if conversation.is_empty() {
        return Err(ExportError::NothingToExport);
    }
    let content = match format {
        ExportFormat::Json => to_json(conversation, now)?,
        ExportFormat::Txt => to_txt(conversation, now),
        ExportFormat::Csv => to_csv(conversation)?,
    };
    Ok(ExportFile {
        filename: export_filename(now, format),
        mime_type: format.mime_type(),
        content,
    })
}
