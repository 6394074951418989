use citysense::config::Settings;
use citysense::embeddings::Embedder;
use citysense::error::VectorError;
use citysense::openai::OpenAiClient;
use citysense::vector_service::{IndexClient, PineconeClient, VectorService};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mock_embeddings(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "index": 0, "embedding": [0.5, 0.25, 0.125] }]
        })))
        .mount(server)
        .await;
}

fn service_for(server: &MockServer) -> VectorService {
    VectorService::new(
        IndexClient::new("pc-test", &server.uri()),
        Embedder::OpenAi(OpenAiClient::new("sk-test", format!("{}/v1", server.uri()))),
    )
}

#[test_log::test(tokio::test)]
async fn test_setup_creates_missing_index() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/indexes"))
        .and(header("Api-Key", "pc-test"))
        .and(header("X-Pinecone-API-Version", "2024-07"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "indexes": [] })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/indexes"))
        .and(body_partial_json(json!({
            "name": "citysense-conversations",
            "dimension": 1536,
            "metric": "cosine",
            "spec": { "serverless": { "cloud": "aws", "region": "us-east-1" } }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "name": "citysense-conversations",
            "dimension": 1536,
            "host": server.uri(),
            "status": { "ready": true, "state": "Ready" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let settings = Settings {
        openai_api_key: "sk-test".to_string(),
        pinecone_api_key: "pc-test".to_string(),
        openai_base_url: format!("{}/v1", server.uri()),
        pinecone_control_url: server.uri(),
        ..Settings::default()
    };
    let service = VectorService::setup(&settings).await;
    assert!(service.is_available());
}

#[tokio::test]
async fn test_setup_without_pinecone_key_is_unavailable() {
    let settings = Settings {
        openai_api_key: "sk-test".to_string(),
        ..Settings::default()
    };
    let service = VectorService::setup(&settings).await;
    assert!(!service.is_available());
    assert!(matches!(
        service.get_conversation_stats().await,
        Err(VectorError::NotConfigured)
    ));
}

#[tokio::test]
async fn test_setup_failure_leaves_service_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/indexes"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let settings = Settings {
        openai_api_key: "sk-test".to_string(),
        pinecone_api_key: "bad".to_string(),
        pinecone_control_url: server.uri(),
        ..Settings::default()
    };
    assert!(!VectorService::setup(&settings).await.is_available());
}

#[tokio::test]
async fn test_ensure_index_reuses_existing_index() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/indexes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "indexes": [{
                "name": "citysense-conversations",
                "dimension": 1536,
                "host": server.uri(),
                "status": { "ready": true }
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/indexes"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let control = PineconeClient::new("pc-test", server.uri());
    assert!(control
        .ensure_index("citysense-conversations", 1536)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_store_exchange_upserts_chunk() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    Mock::given(method("POST"))
        .and(path("/vectors/upsert"))
        .and(header("Api-Key", "pc-test"))
        .and(body_partial_json(json!({
            "vectors": [{
                "id": "conv-1_2",
                "values": [0.5, 0.25, 0.125],
                "metadata": {
                    "conversation_id": "conv-1",
                    "text": "User: Best pizza?\nAssistant: Try Luigi's.",
                    "user_input": "Best pizza?",
                    "assistant_response": "Try Luigi's.",
                    "chunk_index": 2
                }
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "upsertedCount": 1 })))
        .expect(1)
        .mount(&server)
        .await;

    let id = service_for(&server)
        .store_exchange("conv-1", "Best pizza?", "Try Luigi's.", 2)
        .await
        .unwrap();
    assert_eq!(id, "conv-1_2");
}

#[tokio::test]
async fn test_search_filters_by_conversation() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(body_partial_json(json!({
            "topK": 4,
            "includeMetadata": true,
            "filter": { "conversation_id": { "$eq": "conv-9" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "matches": [{
                "id": "conv-9_0",
                "score": 0.91,
                "metadata": {
                    "conversation_id": "conv-9",
                    "text": "User: Bus to airport?\nAssistant: Line 100.",
                    "user_input": "Bus to airport?",
                    "assistant_response": "Line 100.",
                    "timestamp": "2024-03-09T14:05:07+00:00"
                }
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let results = service_for(&server)
        .search_conversations("airport", 4, Some("conv-9"))
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.id, "conv-9_0");
    assert_eq!(result.conversation_id, "conv-9");
    assert_eq!(result.user_input, "Bus to airport?");
    assert_eq!(result.assistant_response, "Line 100.");
    assert_eq!(result.timestamp, "2024-03-09T14:05:07+00:00");
}

#[tokio::test]
async fn test_relevant_context_applies_threshold() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(body_partial_json(json!({ "topK": 3 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "matches": [
                { "id": "a_0", "score": 0.95, "metadata": { "text": "User: a\nAssistant: A" } },
                { "id": "b_0", "score": 0.7, "metadata": { "text": "User: b\nAssistant: B" } },
                { "id": "c_0", "score": 0.69, "metadata": { "text": "User: c\nAssistant: C" } }
            ]
        })))
        .mount(&server)
        .await;

    let context = service_for(&server)
        .get_relevant_context("anything")
        .await
        .unwrap();
    assert_eq!(
        context.as_deref(),
        Some("User: a\nAssistant: A\n\nUser: b\nAssistant: B")
    );
}

#[tokio::test]
async fn test_relevant_context_none_below_threshold() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "matches": [{ "id": "a_0", "score": 0.2, "metadata": { "text": "User: a" } }]
        })))
        .mount(&server)
        .await;

    let context = service_for(&server).get_relevant_context("q").await.unwrap();
    assert!(context.is_none());
}

#[tokio::test]
async fn test_conversation_stats() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/describe_index_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "namespaces": { "": { "vectorCount": 42 } },
            "dimension": 1536,
            "indexFullness": 0.0,
            "totalVectorCount": 42
        })))
        .mount(&server)
        .await;

    let stats = service_for(&server).get_conversation_stats().await.unwrap();
    assert_eq!(stats.status, "connected");
    assert_eq!(stats.total_vectors, 42);
    assert_eq!(stats.dimension, 1536);
    assert_eq!(stats.namespaces[""].vector_count, 42);
}

#[tokio::test]
async fn test_clear_single_conversation_pages_through_ids() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vectors/list"))
        .and(query_param("prefix", "conv-3_"))
        .and(query_param_is_missing("paginationToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "vectors": [{ "id": "conv-3_0" }, { "id": "conv-3_1" }],
            "pagination": { "next": "page-2" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vectors/list"))
        .and(query_param("prefix", "conv-3_"))
        .and(query_param("paginationToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "vectors": [{ "id": "conv-3_2" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vectors/delete"))
        .and(body_partial_json(json!({ "ids": ["conv-3_0", "conv-3_1", "conv-3_2"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let deleted = service_for(&server)
        .clear_conversation_history(Some("conv-3"))
        .await
        .unwrap();
    assert_eq!(deleted, 3);
}

#[tokio::test]
async fn test_clear_all_tolerates_empty_namespace() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/vectors/delete"))
        .and(body_partial_json(json!({ "deleteAll": true })))
        .respond_with(ResponseTemplate::new(404).set_body_string("Namespace not found"))
        .expect(1)
        .mount(&server)
        .await;

    let deleted = service_for(&server)
        .clear_conversation_history(None)
        .await
        .unwrap();
    assert_eq!(deleted, 0);
}
