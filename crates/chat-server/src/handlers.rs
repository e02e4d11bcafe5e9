//! HTTP Handlers

use std::convert::Infallible;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chat_core::{
    ChatError, TurnRequest,
    message::{Conversation, ConversationSummary, DEFAULT_TITLE, Message, ToolStep},
    provider::ProviderInfo,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub providers: usize,
    pub tools: Vec<&'static str>,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub providers: Vec<ProviderInfo>,
}

#[derive(Serialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
}

/// OpenAI-style body of a buffered chat answer
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
    pub conversation_id: String,
    pub tool_steps: Vec<ToolStep>,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoiceMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

fn not_found(id: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, "NOT_FOUND", format!("Conversation not found: {id}"))
}

impl From<ChatError> for ErrorResponse {
    fn from(err: ChatError) -> Self {
        Self {
            error: err.user_message(),
            code: error_code(&err).into(),
        }
    }
}

const fn error_code(err: &ChatError) -> &'static str {
    match err {
        ChatError::InvalidRequest(_) => "INVALID_REQUEST",
        ChatError::ConversationNotFound(_) => "NOT_FOUND",
        ChatError::Store(_) | ChatError::Io(_) => "STORE_ERROR",
        _ => "CHAT_ERROR",
    }
}

/// Map an engine error onto an HTTP error
fn chat_error(err: ChatError) -> ApiError {
    let status = match err {
        ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ChatError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
        _ => {
            tracing::error!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(err.into()))
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        providers: state.service.providers().providers().len(),
        tools: state.tool_names.to_vec(),
    })
}

/// Configured providers and their models; keys are never returned
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        providers: state.service.providers().providers(),
    })
}

pub async fn list_conversations(State(state): State<AppState>) -> Result<Json<ConversationsResponse>, ApiError> {
    let conversations = state.service.store().list().await.map_err(chat_error)?;
    Ok(Json(ConversationsResponse { conversations }))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    // An empty body creates an untitled conversation
    let payload: CreateConversationRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateConversationRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", format!("Invalid body: {e}")))?
    };
    let title = payload
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TITLE);

    let conversation = state
        .service
        .store()
        .create(title, payload.messages)
        .await
        .map_err(chat_error)?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    state
        .service
        .store()
        .get(&id)
        .await
        .map_err(chat_error)?
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

pub async fn update_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateConversationRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let title = payload.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
    state
        .service
        .store()
        .update(&id, title, payload.messages)
        .await
        .map_err(chat_error)?
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.service.store();
    if store.get(&id).await.map_err(chat_error)?.is_none() {
        return Err(not_found(&id));
    }
    store.delete(&id).await.map_err(chat_error)?;
    Ok(Json(json!({"ok": true})))
}

/// Buffered chat turn
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<TurnRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let reply = state.service.complete_turn(payload).await.map_err(chat_error)?;

    Ok(Json(ChatResponse {
        choices: vec![ChatChoice {
            message: ChatChoiceMessage {
                role: "assistant",
                content: reply.content,
            },
        }],
        conversation_id: reply.conversation_id,
        tool_steps: reply.tool_steps,
    }))
}

/// Streaming chat turn as server-sent events.
///
/// Each event is written as `data: <JSON>` plus a blank line. The stream
/// ends when the turn does; a client that disconnects cancels the turn.
pub async fn chat_stream_handler(
    State(state): State<AppState>,
    Json(payload): Json<TurnRequest>,
) -> Result<Response, ApiError> {
    let events = state.service.stream_turn(payload).await.map_err(chat_error)?;
    let body = ReceiverStream::new(events).map(|event| Ok::<_, Infallible>(event.to_sse()));

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (HeaderName::from_static("x-accel-buffering"), HeaderValue::from_static("no")),
        ],
        Body::from_stream(body),
    )
        .into_response())
}
