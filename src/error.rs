//! Error kinds surfaced by the chat pipeline and the upstream clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Failure talking to the moderation or completion provider.  The detail is
/// logged server side and never returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("network error: {0}")]
    Network(String),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider request timed out")]
    Timeout,
}

impl UpstreamError {
    /// 5xx responses and transport level timeouts/connect failures are worth
    /// another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Status { status, .. } => *status >= 500,
            UpstreamError::Network(_) | UpstreamError::Timeout => true,
            UpstreamError::Malformed(_) => false,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if err.is_decode() {
            UpstreamError::Malformed(err.to_string())
        } else {
            UpstreamError::Network(err.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("Message is inappropriate")]
    ContentRejected,
    #[error("Message is too long ({tokens} tokens > {ceiling})")]
    BudgetExceeded { tokens: usize, ceiling: usize },
    #[error("upstream failure: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("{call} call exceeded {after_ms}ms")]
    Timeout { call: &'static str, after_ms: u64 },
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::InvalidInput(_)
            | ChatError::ContentRejected
            | ChatError::BudgetExceeded { .. } => StatusCode::BAD_REQUEST,
            ChatError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Fixed client-facing message for this error kind.
    pub fn public_message(&self) -> &'static str {
        match self {
            ChatError::InvalidInput(_) => "Invalid request",
            ChatError::ContentRejected => "Message is inappropriate",
            ChatError::BudgetExceeded { .. } => "Message is too long",
            ChatError::Upstream(_) => "Something went wrong",
            ChatError::Timeout { .. } => "Upstream request timed out",
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        (self.status(), self.public_message()).into_response()
    }
}
