//! The chat turn pipeline.
//!
//! A turn runs strictly in order: validate, estimate, moderate the last
//! message, build the system prompt, enforce the token budget, call the
//! completion provider, then advance the questionnaire.  Nothing touches the
//! conversation state until the completion call has succeeded.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::completion::{CompletionClient, CompletionRequest, DecodingParams};
use crate::conversation::{ConversationState, SessionStore, Turn};
use crate::error::{ChatError, UpstreamError};
use crate::moderation::Moderator;
use crate::prompt::PromptPolicy;
use crate::tokenizer::TokenEstimator;
use crate::ChatMessage;

/// Canonical response envelope.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ChatReply {
    pub reply: String,
    /// True on the turn that answered the final question.
    pub done: bool,
}

#[derive(Clone, Debug)]
pub struct ChatSettings {
    pub model: String,
    pub decoding: DecodingParams,
    pub token_budget: usize,
    pub upstream_timeout: Duration,
    pub prompt_policy: PromptPolicy,
    pub closing_message: String,
    pub estimator: TokenEstimator,
}

#[derive(Clone)]
pub struct ChatService {
    settings: Arc<ChatSettings>,
    moderator: Arc<dyn Moderator>,
    completer: Arc<dyn CompletionClient>,
    sessions: SessionStore,
}

impl ChatService {
    pub fn new(
        settings: ChatSettings,
        moderator: Arc<dyn Moderator>,
        completer: Arc<dyn CompletionClient>,
        sessions: SessionStore,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            moderator,
            completer,
            sessions,
        }
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub async fn handle(
        &self,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatReply, ChatError> {
        let last = messages
            .last()
            .ok_or_else(|| ChatError::InvalidInput("messages must not be empty".into()))?;

        let settings = &self.settings;
        let tokens = settings.estimator.estimate_messages(messages);

        // Only the newest message is moderated; history was checked on earlier turns.
        let verdict = self
            .bounded("moderation", self.moderator.check(&last.content))
            .await?;
        if verdict.flagged {
            tracing::warn!(session = %session_id, "message rejected by moderation");
            return Err(ChatError::ContentRejected);
        }

        // An unknown session is only registered once its first turn fits.
        let session = match self.sessions.existing(session_id) {
            Some(session) => session,
            None => {
                self.prompt_within_budget(session_id, tokens, &self.sessions.fresh_state())?;
                self.sessions.session(session_id)
            }
        };
        let mut state = session.lock().await;
        let system_prompt = self.prompt_within_budget(session_id, tokens, &state)?;

        let request =
            CompletionRequest::new(&settings.model, system_prompt, messages, &settings.decoding);
        let reply = self
            .bounded("completion", self.completer.complete(&request))
            .await?;

        if !settings.prompt_policy.is_stateful() {
            return Ok(ChatReply { reply, done: false });
        }

        let asked = state.current_index();
        match state.record_reply(reply.clone()) {
            Turn::Advanced { next } => {
                tracing::info!(session = %session_id, answered = asked, next, "question answered");
                Ok(ChatReply { reply, done: false })
            }
            Turn::Completed { answers } => {
                tracing::info!(session = %session_id, answers = answers.len(), "questionnaire complete");
                Ok(ChatReply {
                    reply: compose_summary(&settings.closing_message, &answers),
                    done: true,
                })
            }
        }
    }

    /// System prompt for `state`, provided it fits the budget together with
    /// `message_tokens`.
    fn prompt_within_budget(
        &self,
        session_id: &str,
        message_tokens: usize,
        state: &ConversationState,
    ) -> Result<String, ChatError> {
        let settings = &self.settings;
        let system_prompt = settings.prompt_policy.build(state);
        let tokens = message_tokens + settings.estimator.estimate(&system_prompt);
        tracing::debug!(session = %session_id, tokens, ceiling = settings.token_budget, "token estimate");
        if tokens > settings.token_budget {
            tracing::warn!(session = %session_id, tokens, ceiling = settings.token_budget, "token budget exceeded");
            return Err(ChatError::BudgetExceeded {
                tokens,
                ceiling: settings.token_budget,
            });
        }
        Ok(system_prompt)
    }

    /// Run one external call under the configured timeout.
    async fn bounded<T, F>(&self, call: &'static str, fut: F) -> Result<T, ChatError>
    where
        F: Future<Output = Result<T, UpstreamError>>,
    {
        let limit = self.settings.upstream_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(UpstreamError::Timeout)) => {
                tracing::warn!(call, "upstream request timed out");
                Err(ChatError::Timeout {
                    call,
                    after_ms: limit.as_millis() as u64,
                })
            }
            Ok(Err(err)) => {
                tracing::warn!(call, error = %err, "upstream call failed");
                Err(ChatError::Upstream(err))
            }
            Err(_) => {
                tracing::warn!(call, timeout_ms = limit.as_millis() as u64, "upstream call exceeded bound");
                Err(ChatError::Timeout {
                    call,
                    after_ms: limit.as_millis() as u64,
                })
            }
        }
    }
}

/// Closing message followed by each question and its recorded answer, in
/// question order.
pub fn compose_summary(closing: &str, answers: &[(String, String)]) -> String {
    let mut out = closing.trim().to_string();
    for (question, answer) in answers {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(question);
        out.push('\n');
        out.push_str(answer);
    }
    out
}
