use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    serve, Json, Router,
};
use chrono::Local;
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::{mpsc, Mutex};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::chat::{ChatOutcome, ChatSession};
use crate::config::{Provider, Service, Settings, SettingsUpdate};
use crate::constants;
use crate::error::{ExportError, VectorError};
use crate::export::{self, ExportFormat};
use crate::llm_interaction::StreamMessage;

// Frames sent to WebSocket clients
#[derive(Clone, Debug, Serialize, Deserialize)]
struct WsFrame {
    message_type: String,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    5
}

#[derive(Debug, Default, Deserialize)]
struct ClearParams {
    conversation_id: Option<String>,
}

/// Shared application state. The UI serves a single chat session.
#[derive(Clone)]
pub struct AppState {
    templates: Arc<AutoReloader>,
    settings: Arc<Settings>,
    session: Arc<Mutex<ChatSession>>,
}

impl AppState {
    pub fn new(settings: Settings, session: ChatSession) -> Self {
        let templates = create_minijinja_env(settings.templates_dir.clone());
        Self {
            templates: Arc::new(templates),
            settings: Arc::new(settings),
            session: Arc::new(Mutex::new(session)),
        }
    }
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.0,
            Json(json!({ "status": "error", "error": self.1 })),
        )
            .into_response()
    }
}

impl From<VectorError> for ApiError {
    fn from(e: VectorError) -> Self {
        let status = match e {
            VectorError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        ApiError(status, e.to_string())
    }
}

impl From<ExportError> for ApiError {
    fn from(e: ExportError) -> Self {
        let status = match e {
            ExportError::NothingToExport | ExportError::UnknownFormat(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

fn parse_provider(raw: &str) -> Result<Provider, ApiError> {
    raw.parse().map_err(|e| ApiError(StatusCode::NOT_FOUND, e))
}

// Minijinja Environment setup
fn create_minijinja_env(dir: PathBuf) -> AutoReloader {
    AutoReloader::new(move |notifier| {
        let mut env = Environment::new();
        env.set_loader(path_loader(&dir));
        notifier.watch_path(&dir, true);
        Ok(env)
    })
}

fn api_status(settings: &Settings, vector_available: bool) -> serde_json::Value {
    json!({
        "openai": settings.is_api_configured(Service::OpenAi),
        "gemini": settings.is_api_configured(Service::Gemini),
        "pinecone": settings.is_api_configured(Service::Pinecone),
        "vector_db": vector_available,
        "providers": settings.available_providers(),
    })
}

async fn index_handler(State(state): State<AppState>) -> Result<Html<String>, Html<String>> {
    let session = state.session.lock().await;
    let vector_stats = if session.vector().is_available() {
        match session.vector().get_conversation_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Failed to load vector stats: {}", e);
                None
            }
        }
    } else {
        None
    };

    let settings = session.settings();
    let prompts: Vec<_> = constants::SYSTEM_PROMPTS
        .iter()
        .map(|(name, text)| json!({ "name": name, "text": text }))
        .collect();

    let context = minijinja::context! {
        title => constants::APP_TITLE.as_str(),
        icon => constants::APP_ICON,
        status => api_status(&state.settings, session.vector().is_available()),
        providers => session.available_providers(),
        models => settings.provider.models(),
        settings => settings,
        prompts => prompts,
        export_formats => constants::EXPORT_FORMATS,
        messages => &session.conversation.messages,
        conversation_id => session.conversation.id.to_string(),
        stats => session.stats(),
        vector_stats => vector_stats,
    };

    state
        .templates
        .acquire_env()
        .and_then(|env| env.get_template("index.html").and_then(|tmpl| tmpl.render(context)))
        .map(Html)
        .map_err(|e| {
            error!("Failed to get or render template: {}", e);
            Html(format!("Internal Server Error: {}", e))
        })
}

async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let session = state.session.lock().await;
    Json(api_status(&state.settings, session.vector().is_available()))
}

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.session.lock().await;
    Json(session.settings().clone())
}

async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> impl IntoResponse {
    let mut session = state.session.lock().await;
    let settings = session.update_settings(&update).clone();
    info!(provider = %settings.provider, model = %settings.model, "Updated model settings");
    Json(settings)
}

async fn models_handler(Path(provider): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let provider = parse_provider(&provider)?;
    Ok(Json(provider.models()))
}

async fn messages_handler(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.session.lock().await;
    Json(json!({
        "conversation_id": session.conversation.id,
        "messages": session.conversation.messages,
    }))
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let input = request.message.trim();
    if input.is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "Message is empty".to_string()));
    }
    let mut session = state.session.lock().await;
    let outcome = session.process_user_input(input).await;
    Ok(Json(json!({
        "status": if outcome.is_error { "error" } else { "success" },
        "reply": outcome.reply,
        "context_used": outcome.context_used,
        "usage": outcome.usage,
        "messages": session.conversation.messages,
    })))
}

async fn new_conversation(State(state): State<AppState>) -> impl IntoResponse {
    let mut session = state.session.lock().await;
    session.start_new_conversation();
    Json(json!({ "conversation_id": session.conversation.id }))
}

async fn clear_history(State(state): State<AppState>) -> impl IntoResponse {
    let mut session = state.session.lock().await;
    session.clear_chat_history();
    Json(json!({ "conversation_id": session.conversation.id, "messages": [] }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.session.lock().await;
    Json(session.stats())
}

async fn export_handler(
    State(state): State<AppState>,
    Path(format): Path<String>,
) -> Result<Response, ApiError> {
    let format: ExportFormat = format.parse()?;
    let session = state.session.lock().await;
    let file = export::export_conversation(&session.conversation, format, Local::now())?;
    info!(filename = %file.filename, "Exported conversation");
    Ok((
        [
            (header::CONTENT_TYPE, file.mime_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file.filename),
            ),
        ],
        file.content,
    )
        .into_response())
}

async fn vector_stats_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let session = state.session.lock().await;
    Ok(Json(session.vector().get_conversation_stats().await?))
}

async fn vector_search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.session.lock().await;
    let results = session
        .vector()
        .search_conversations(&params.q, params.limit, None)
        .await?;
    Ok(Json(results))
}

async fn vector_clear_handler(
    State(state): State<AppState>,
    params: Option<Json<ClearParams>>,
) -> Result<impl IntoResponse, ApiError> {
    let params = params.map(|Json(p)| p).unwrap_or_default();
    let session = state.session.lock().await;
    let deleted = session
        .vector()
        .clear_conversation_history(params.conversation_id.as_deref())
        .await?;
    Ok(Json(json!({ "status": "success", "deleted": deleted })))
}

async fn test_connection_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let provider = parse_provider(&provider)?;
    let llm = {
        let session = state.session.lock().await;
        session.llm().clone()
    };
    Ok(Json(llm.test_api_connection(provider).await))
}

// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_frame(socket: &mut WebSocket, frame: &WsFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json_msg) => socket.send(Message::Text(json_msg)).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize WebSocket frame: {}", e);
            true
        }
    }
}

/// `End` for a recorded reply, `Error` otherwise. Both carry the turn's outcome.
fn closing_frame(outcome: &ChatOutcome) -> WsFrame {
    let mut payload = json!(outcome);
    let message_type = if outcome.is_error {
        payload["error"] = json!(outcome.reply);
        "Error"
    } else {
        "End"
    };
    WsFrame {
        message_type: message_type.to_string(),
        payload,
    }
}

// Each text frame from the client is one chat turn; reply pieces are streamed back.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("New WebSocket connection established");

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => {
                info!("Client requested WebSocket close");
                break;
            }
            Message::Binary(_) => {
                warn!("Received unexpected binary message from client");
                continue;
            }
            // Axum answers pings itself
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let input = match serde_json::from_str::<ChatRequest>(&text) {
            Ok(request) if !request.message.trim().is_empty() => request.message.trim().to_string(),
            _ => {
                let frame = WsFrame {
                    message_type: "Error".to_string(),
                    payload: json!({ "error": "Expected {\"message\": \"...\"}" }),
                };
                if !send_frame(&mut socket, &frame).await {
                    break;
                }
                continue;
            }
        };

        let (tx, mut rx) = mpsc::channel::<StreamMessage>(64);
        let session = state.session.clone();
        let worker = tokio::spawn(async move {
            let mut session = session.lock().await;
            session.process_user_input_stream(&input, tx).await
        });

        let mut connected = true;
        while let Some(event) = rx.recv().await {
            // The turn's closing frame is sent below, once the reply is recorded.
            if matches!(event, StreamMessage::End | StreamMessage::Error { .. }) {
                continue;
            }
            let frame = match serde_json::to_value(&event) {
                Ok(value) => WsFrame {
                    message_type: value["message_type"].as_str().unwrap_or("Text").to_string(),
                    payload: value.get("payload").cloned().unwrap_or(serde_json::Value::Null),
                },
                Err(e) => {
                    error!("Failed to serialize stream event: {}", e);
                    continue;
                }
            };
            if connected && !send_frame(&mut socket, &frame).await {
                warn!("WebSocket client disconnected or send error. Finishing turn without it.");
                connected = false;
            }
        }

        match worker.await {
            Ok(outcome) if connected => {
                if !send_frame(&mut socket, &closing_frame(&outcome)).await {
                    break;
                }
            }
            Ok(_) => break,
            Err(e) => {
                error!("Chat turn task failed: {:?}", e);
                break;
            }
        }
    }
    info!("WebSocket connection closed");
}

pub fn build_router(state: AppState) -> Router {
    // Serve static files from the configured directory
    let static_files_service = ServeDir::new(&state.settings.static_dir).not_found_service(
        tower::service_fn(|_req: axum::extract::Request| async {
            Ok::<_, Infallible>((StatusCode::NOT_FOUND, "Not Found").into_response())
        }),
    );

    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/api/status", get(status_handler))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/models/:provider", get(models_handler))
        .route("/api/messages", get(messages_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/conversation/new", post(new_conversation))
        .route("/api/conversation/clear", post(clear_history))
        .route("/api/stats", get(stats_handler))
        .route("/api/export/:format", get(export_handler))
        .route("/api/vector/stats", get(vector_stats_handler))
        .route("/api/vector/search", get(vector_search_handler))
        .route("/api/vector/clear", post(vector_clear_handler))
        .route("/api/test/:provider", post(test_connection_handler))
        .nest_service("/static", static_files_service)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_web_server(port: u16, state: AppState) -> Result<()> {
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    serve(listener, app.into_make_service())
        .await
        .context("Web server failed")?;

    Ok(())
}
