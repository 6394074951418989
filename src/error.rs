use thiserror::Error;

use crate::config::Provider;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("{0} client not initialized")]
    NotConfigured(Provider),
    #[error("{provider} API error: {source}")]
    Http {
        provider: Provider,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} API error: status {status}: {body}")]
    Api {
        provider: Provider,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("{provider} API error: {message}")]
    InvalidResponse { provider: Provider, message: String },
}

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("vector database not configured")]
    NotConfigured,
    #[error("Pinecone request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Pinecone API error: status {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("index {0} has no host yet")]
    IndexNotReady(String),
    #[error("error generating embedding: {0}")]
    Embedding(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("No messages to export")]
    NothingToExport,
    #[error("unknown export format: {0}")]
    UnknownFormat(String),
    #[error("failed to serialize export: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write CSV export: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV export was not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("failed to flush CSV export: {0}")]
    CsvFlush(String),
}
