//! Conversation memory backed by a Pinecone serverless index.
//!
//! Every completed exchange is embedded and upserted under the id
//! `<conversation_id>_<chunk_index>`, which lets one conversation's vectors be
//! listed by prefix and deleted without a metadata filter. The service is
//! optional: when Pinecone or an embedding provider is not configured it stays
//! unavailable and chat continues without retrieved context.

use chrono::Local;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Provider, Service, Settings};
use crate::constants;
use crate::embeddings::Embedder;
use crate::error::VectorError;

const RETRIES: u8 = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct IndexModel {
    pub name: String,
    #[serde(default)]
    pub dimension: Option<usize>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub status: Option<IndexStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexStatus {
    #[serde(default)]
    pub ready: bool,
}

impl IndexModel {
    fn usable_host(&self) -> Option<&str> {
        let ready = self.status.as_ref().map(|s| s.ready).unwrap_or(true);
        self.host.as_deref().filter(|h| ready && !h.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct IndexList {
    #[serde(default)]
    indexes: Vec<IndexModel>,
}

#[derive(Debug, Serialize)]
struct Record<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    #[serde(default)]
    namespaces: BTreeMap<String, NamespaceSummary>,
    #[serde(default)]
    dimension: usize,
    #[serde(default)]
    index_fullness: f32,
    #[serde(default)]
    total_vector_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSummary {
    #[serde(default)]
    pub vector_count: u64,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    vectors: Vec<ListedVector>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct ListedVector {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    next: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub conversation_id: String,
    pub timestamp: String,
    pub user_input: String,
    pub assistant_response: String,
    pub metadata: Map<String, Value>,
}

impl SearchResult {
    fn from_match(m: QueryMatch) -> Self {
        let field = |key: &str| {
            m.metadata
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            text: field("text"),
            conversation_id: field("conversation_id"),
            timestamp: field("timestamp"),
            user_input: field("user_input"),
            assistant_response: field("assistant_response"),
            id: m.id,
            score: m.score,
            metadata: m.metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexStats {
    pub status: String,
    pub total_vectors: u64,
    pub dimension: usize,
    pub index_fullness: f32,
    pub namespaces: BTreeMap<String, NamespaceSummary>,
}

/// Pinecone control plane: index listing, creation and description.
#[derive(Debug, Clone)]
pub struct PineconeClient {
    client: Client,
    api_key: String,
    control_url: String,
}

impl PineconeClient {
    pub fn new(api_key: impl Into<String>, control_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            control_url: control_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.control_url, path))
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", constants::PINECONE_API_VERSION)
    }

    pub async fn list_indexes(&self) -> Result<Vec<IndexModel>, VectorError> {
        let response = check(self.request(reqwest::Method::GET, "indexes").send().await?).await?;
        let list: IndexList = response.json().await?;
        Ok(list.indexes)
    }

    pub async fn describe_index(&self, name: &str) -> Result<IndexModel, VectorError> {
        let response = check(
            self.request(reqwest::Method::GET, &format!("indexes/{}", name))
                .send()
                .await?,
        )
        .await?;
        Ok(response.json().await?)
    }

    pub async fn create_index(&self, name: &str, dimension: usize) -> Result<IndexModel, VectorError> {
        info!(index = name, dimension, "Creating Pinecone index");
        let body = json!({
            "name": name,
            "dimension": dimension,
            "metric": "cosine",
            "spec": { "serverless": { "cloud": "aws", "region": "us-east-1" } },
        });
        let response = check(
            self.request(reqwest::Method::POST, "indexes")
                .json(&body)
                .send()
                .await?,
        )
        .await?;
        Ok(response.json().await?)
    }

    /// Find or create `name` and wait until it reports a host.
    pub async fn ensure_index(&self, name: &str, dimension: usize) -> Result<IndexClient, VectorError> {
        let existing = self
            .list_indexes()
            .await?
            .into_iter()
            .find(|i| i.name == name);

        let mut model = match existing {
            Some(model) => {
                if model.dimension.is_some_and(|d| d != dimension) {
                    warn!(
                        index = name,
                        expected = dimension,
                        actual = ?model.dimension,
                        "Index dimension does not match the embedding model"
                    );
                }
                model
            }
            None => self.create_index(name, dimension).await?,
        };

        let mut attempts = 0u8;
        loop {
            if let Some(host) = model.usable_host() {
                return Ok(IndexClient::new(&self.api_key, host));
            }
            attempts += 1;
            if attempts >= RETRIES {
                return Err(VectorError::IndexNotReady(name.to_string()));
            }
            debug!(index = name, attempts, "Waiting for index to become ready");
            tokio::time::sleep(Duration::from_secs(1)).await;
            model = self.describe_index(name).await?;
        }
    }
}

/// Pinecone data plane for a single index.
#[derive(Debug, Clone)]
pub struct IndexClient {
    client: Client,
    api_key: String,
    base_url: String,
}

/// Hosts come back bare from the control plane; a scheme is only present when overridden.
fn data_plane_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, VectorError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    error!(%status, %body, "Pinecone request failed");
    Err(VectorError::Api { status, body })
}

impl IndexClient {
    pub fn new(api_key: impl Into<String>, host: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: data_plane_url(host),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/{}", self.base_url, path))
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", constants::PINECONE_API_VERSION)
    }

    async fn upsert(&self, id: &str, values: &[f32], metadata: &Map<String, Value>) -> Result<(), VectorError> {
        let record = Record { id, values, metadata };
        let body = json!({ "vectors": [record] });
        check(self.post("vectors/upsert").json(&body).send().await?).await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<Value>,
    ) -> Result<Vec<QueryMatch>, VectorError> {
        let mut body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
            "includeValues": false,
        });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        let response = check(self.post("query").json(&body).send().await?).await?;
        let parsed: QueryResponse = response.json().await?;
        Ok(parsed.matches)
    }

    async fn describe_stats(&self) -> Result<StatsResponse, VectorError> {
        let response = check(self.post("describe_index_stats").json(&json!({})).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn list_ids(&self, prefix: &str) -> Result<Vec<String>, VectorError> {
        let mut ids = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(format!("{}/vectors/list", self.base_url))
                .header("Api-Key", &self.api_key)
                .header("X-Pinecone-API-Version", constants::PINECONE_API_VERSION)
                .query(&[("prefix", prefix)]);
            if let Some(token) = &token {
                request = request.query(&[("paginationToken", token.as_str())]);
            }
            let page: ListResponse = check(request.send().await?).await?.json().await?;
            ids.extend(page.vectors.into_iter().map(|v| v.id));
            token = page.pagination.and_then(|p| p.next);
            if token.is_none() {
                return Ok(ids);
            }
        }
    }

    async fn delete(&self, body: Value) -> Result<(), VectorError> {
        let response = self.post("vectors/delete").json(&body).send().await?;
        // Deleting from an empty namespace is reported as 404.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }
}

/// Text stored and embedded for one user/assistant exchange.
pub fn exchange_text(user_input: &str, assistant_response: &str) -> String {
    format!("User: {}\nAssistant: {}", user_input, assistant_response)
}

pub fn chunk_id(conversation_id: &str, chunk_index: usize) -> String {
    format!("{}_{}", conversation_id, chunk_index)
}

#[derive(Debug, Clone, Default)]
pub struct VectorService {
    index: Option<IndexClient>,
    embedder: Option<Embedder>,
}

impl VectorService {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn new(index: IndexClient, embedder: Embedder) -> Self {
        Self {
            index: Some(index),
            embedder: Some(embedder),
        }
    }

    /// Connect to Pinecone and pick an embedder. Failures are logged and leave
    /// the service unavailable.
    pub async fn setup(settings: &Settings) -> Self {
        if !settings.is_api_configured(Service::Pinecone) {
            info!("Pinecone API key not configured; vector context disabled");
            return Self::unavailable();
        }
        let Some(embedder) = Embedder::from_settings(settings, Provider::OpenAi) else {
            warn!("No embedding provider configured; vector context disabled");
            return Self::unavailable();
        };

        let control = PineconeClient::new(&settings.pinecone_api_key, &settings.pinecone_control_url);
        match control
            .ensure_index(constants::PINECONE_INDEX_NAME, embedder.dimension())
            .await
        {
            Ok(index) => {
                info!(index = constants::PINECONE_INDEX_NAME, "Connected to Pinecone");
                Self::new(index, embedder)
            }
            Err(e) => {
                error!("Error setting up Pinecone: {}", e);
                Self::unavailable()
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.index.is_some() && self.embedder.is_some()
    }

    fn parts(&self) -> Result<(&IndexClient, &Embedder), VectorError> {
        match (&self.index, &self.embedder) {
            (Some(index), Some(embedder)) => Ok((index, embedder)),
            _ => Err(VectorError::NotConfigured),
        }
    }

    #[instrument(skip(self, user_input, assistant_response))]
    pub async fn store_exchange(
        &self,
        conversation_id: &str,
        user_input: &str,
        assistant_response: &str,
        chunk_index: usize,
    ) -> Result<String, VectorError> {
        let (index, embedder) = self.parts()?;
        let text = exchange_text(user_input, assistant_response);
        let embedding = embedder.embed(&text).await?;

        let id = chunk_id(conversation_id, chunk_index);
        let mut metadata = Map::new();
        metadata.insert("conversation_id".into(), Value::from(conversation_id));
        metadata.insert("text".into(), Value::from(text));
        metadata.insert("user_input".into(), Value::from(user_input));
        metadata.insert("assistant_response".into(), Value::from(assistant_response));
        metadata.insert("timestamp".into(), Value::from(Local::now().to_rfc3339()));
        metadata.insert("chunk_index".into(), Value::from(chunk_index));

        index.upsert(&id, &embedding, &metadata).await?;
        debug!(id = %id, "Stored conversation chunk");
        Ok(id)
    }

    #[instrument(skip(self, query))]
    pub async fn search_conversations(
        &self,
        query: &str,
        top_k: usize,
        conversation_id: Option<&str>,
    ) -> Result<Vec<SearchResult>, VectorError> {
        let (index, embedder) = self.parts()?;
        let embedding = embedder.embed(query).await?;
        let filter = conversation_id.map(|id| json!({ "conversation_id": { "$eq": id } }));
        let matches = index.query(&embedding, top_k, filter).await?;
        Ok(matches.into_iter().map(SearchResult::from_match).collect())
    }

    /// Text of earlier exchanges similar enough to `query` to be worth sending as context.
    pub async fn get_relevant_context(&self, query: &str) -> Result<Option<String>, VectorError> {
        let results = self
            .search_conversations(query, constants::MAX_CONTEXT_CHUNKS, None)
            .await?;
        let relevant: Vec<String> = results
            .into_iter()
            .filter(|r| r.score >= constants::SIMILARITY_THRESHOLD && !r.text.is_empty())
            .take(constants::MAX_CONTEXT_CHUNKS)
            .map(|r| r.text)
            .collect();
        debug!(count = relevant.len(), "Retrieved context chunks");
        Ok((!relevant.is_empty()).then(|| relevant.join("\n\n")))
    }

    pub async fn get_conversation_stats(&self) -> Result<IndexStats, VectorError> {
        let (index, _) = self.parts()?;
        let stats = index.describe_stats().await?;
        Ok(IndexStats {
            status: "connected".to_string(),
            total_vectors: stats.total_vector_count,
            dimension: stats.dimension,
            index_fullness: stats.index_fullness,
            namespaces: stats.namespaces,
        })
    }

    /// Delete one conversation's vectors, or every vector when no id is given.
    /// Returns the number of ids deleted for a single conversation.
    pub async fn clear_conversation_history(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<usize, VectorError> {
        let (index, _) = self.parts()?;
        match conversation_id {
            Some(id) => {
                let ids = index.list_ids(&format!("{}_", id)).await?;
                // The delete endpoint accepts at most 1000 ids per call.
                for batch in ids.chunks(1000) {
                    index.delete(json!({ "ids": batch })).await?;
                }
                info!(conversation_id = id, count = ids.len(), "Cleared conversation vectors");
                Ok(ids.len())
            }
            None => {
                index.delete(json!({ "deleteAll": true })).await?;
                info!("Cleared all conversation vectors");
                Ok(0)
            }
        }
    }
}
