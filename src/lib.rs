//! Core library for Careeryzer.  This module defines the wire types, builds
//! the shared application state and exposes the axum router with the
//! `/api/chat` endpoint.

pub mod chat;
pub mod completion;
mod config;
pub mod conversation;
pub mod error;
pub mod moderation;
pub mod prompt;
pub mod tokenizer;

pub use config::{AppConfig, InterviewConfig, ProviderConfig};

use std::sync::Arc;

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    DefaultBodyLimit, State,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::chat::{ChatService, ChatSettings};
use crate::completion::{CompletionMode, OpenAiCompletionClient};
use crate::conversation::{SessionStore, DEFAULT_SESSION};
use crate::error::ChatError;
use crate::moderation::OpenAiModerator;

pub use crate::chat::ChatReply;

/// Header carrying the conversation identifier.  Takes precedence over the
/// `sessionId` body field.
pub const SESSION_HEADER: &str = "x-session-id";

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
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
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
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

/// Body of `POST /api/chat`.  `messages` is optional at the parsing level so
/// that a missing list is reported as invalid input rather than a parse error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub completion_mode: CompletionMode,
    /// Maximum accepted request body size in bytes (None => axum default)
    pub max_request_bytes: Option<usize>,
    pub cors_origin: AllowOrigin,
}

impl AppState {
    pub fn new(chat: ChatService) -> Self {
        Self {
            chat,
            completion_mode: CompletionMode::Chat,
            max_request_bytes: None,
            cors_origin: AllowOrigin::any(),
        }
    }
}

/// Build state from a loaded configuration, wiring the OpenAI-compatible
/// moderation and completion clients.
pub fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    use anyhow::Context;

    let moderator = OpenAiModerator::new(config.provider.clone())
        .context("failed to build moderation client")?;
    let completer = OpenAiCompletionClient::new(
        config.provider.clone(),
        config.completion_mode,
        config.retry,
    )
    .context("failed to build completion client")?;

    let settings = ChatSettings {
        model: config.model.clone(),
        decoding: config.decoding.clone(),
        token_budget: config.token_budget,
        upstream_timeout: config.upstream_timeout,
        prompt_policy: config.prompt_policy.clone(),
        closing_message: config.interview.closing_message.clone(),
        estimator: config.estimator,
    };
    let sessions =
        SessionStore::new(config.interview.questions.clone()).with_max_sessions(config.max_sessions);
    let chat = ChatService::new(settings, Arc::new(moderator), Arc::new(completer), sessions);

    let cors_origin = if config.cors_origin == "*" {
        AllowOrigin::any()
    } else {
        let value = HeaderValue::from_str(&config.cors_origin)
            .with_context(|| format!("invalid CAREERYZER_CORS_ORIGIN '{}'", config.cors_origin))?;
        AllowOrigin::exact(value)
    };

    Ok(AppState {
        chat,
        completion_mode: config.completion_mode,
        max_request_bytes: config.max_request_bytes,
        cors_origin,
    })
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(state.cors_origin.clone())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let router = Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/healthz", get(healthz_handler));

    let router = if let Some(limit) = state.max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.layer(cors).with_state(state)
}

fn resolve_session_id(headers: &HeaderMap, body_id: Option<&str>) -> Result<String, ChatError> {
    let from_header = match headers.get(SESSION_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| ChatError::InvalidInput("session header is not valid text".into()))?,
        ),
        None => None,
    };
    let id = from_header
        .or(body_id)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SESSION);
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(ChatError::InvalidInput("session id too long".into()));
    }
    Ok(id.to_string())
}

/// Handler for `/api/chat`.  Exactly one response is produced per request.
async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> axum::response::Response {
    let payload = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };
    let session_id = match resolve_session_id(&headers, payload.session_id.as_deref()) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    let messages = payload.messages.unwrap_or_default();

    match state.chat.handle(&session_id, &messages).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(err) => {
            if err.status().is_server_error() {
                tracing::error!(session = %session_id, error = %err, "chat turn failed");
            } else {
                tracing::info!(session = %session_id, error = %err, "chat turn rejected");
            }
            err.into_response()
        }
    }
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection) -> axum::response::Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            tracing::warn!(limit = ?state.max_request_bytes, "request body exceeded configured limit");
            (StatusCode::PAYLOAD_TOO_LARGE, "Request too large").into_response()
        }
        other => {
            tracing::info!(error = %other, "malformed chat request");
            ChatError::InvalidInput(other.body_text()).into_response()
        }
    }
}

/// Liveness endpoint reporting the active model and prompt mode.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let settings = state.chat.settings();
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "model": settings.model,
        "completionMode": state.completion_mode.as_str(),
        "promptMode": settings.prompt_policy.mode_name(),
        "questions": state.chat.sessions().questions().len(),
        "sessions": state.chat.sessions().len(),
    });
    (StatusCode::OK, Json(json)).into_response()
}
