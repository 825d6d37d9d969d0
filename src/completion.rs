//! Completion client for OpenAI-compatible APIs.
//!
//! Two modalities are supported.  `chat` posts the message list to
//! `/chat/completions`; `text` flattens it into a single prompt for the legacy
//! `/completions` endpoint.  Either way the caller receives the first
//! choice's text, trimmed, or an empty string when the provider sent none.

use std::time::Duration;

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::error::UpstreamError;
use crate::{ChatMessage, Role};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    Chat,
    Text,
}

impl CompletionMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "chat" => Some(CompletionMode::Chat),
            "text" => Some(CompletionMode::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionMode::Chat => "chat",
            CompletionMode::Text => "text",
        }
    }
}

/// Decoding parameters shared by every request.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodingParams {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub n: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
}

impl Default for DecodingParams {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            max_tokens: None,
            n: None,
            stop: None,
            presence_penalty: None,
            frequency_penalty: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
}

impl CompletionRequest {
    /// Build a request with `system_prompt` placed before the history.
    pub fn new(
        model: &str,
        system_prompt: String,
        history: &[ChatMessage],
        params: &DecodingParams,
    ) -> Self {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(history);
        Self {
            model: model.to_string(),
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            n: params.n,
            stop: params.stop.clone(),
            presence_penalty: params.presence_penalty,
            frequency_penalty: params.frequency_penalty,
        }
    }

    /// Prompt used by the text modality: one `role: content` line per
    /// message, ending with an open assistant turn.
    pub fn flatten_prompt(&self) -> String {
        let mut prompt = String::new();
        for msg in &self.messages {
            prompt.push_str(msg.role.as_str());
            prompt.push_str(": ");
            prompt.push_str(&msg.content);
            prompt.push('\n');
        }
        prompt.push_str(Role::Assistant.as_str());
        prompt.push(':');
        prompt
    }
}

#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, UpstreamError>;
}

/// Bounded exponential backoff for transient provider failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Serialize)]
struct TextCompletionBody<'a> {
    model: &'a str,
    prompt: String,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
}

impl<'a> From<&'a CompletionRequest> for TextCompletionBody<'a> {
    fn from(req: &'a CompletionRequest) -> Self {
        Self {
            model: &req.model,
            prompt: req.flatten_prompt(),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            n: req.n,
            stop: req.stop.as_deref(),
            presence_penalty: req.presence_penalty,
            frequency_penalty: req.frequency_penalty,
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// First choice's text from either modality, trimmed; empty when absent.
fn extract_reply(resp: CompletionResponse) -> String {
    resp.choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.and_then(|m| m.content).or(choice.text))
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

pub struct OpenAiCompletionClient {
    provider: ProviderConfig,
    mode: CompletionMode,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl OpenAiCompletionClient {
    pub fn new(
        provider: ProviderConfig,
        mode: CompletionMode,
        retry: RetryPolicy,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(provider.request_timeout)
            .build()?;
        Ok(Self {
            provider,
            mode,
            retry,
            client,
        })
    }

    fn url(&self) -> String {
        let base = self.provider.base_url.trim_end_matches('/');
        match self.mode {
            CompletionMode::Chat => format!("{}/chat/completions", base),
            CompletionMode::Text => format!("{}/completions", base),
        }
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<String, UpstreamError> {
        let rb = self
            .client
            .post(self.url())
            .bearer_auth(self.provider.api_key.expose_secret());
        let rb = match self.mode {
            CompletionMode::Chat => rb.json(request),
            CompletionMode::Text => rb.json(&TextCompletionBody::from(request)),
        };
        let resp = rb.send().await.map_err(UpstreamError::from_reqwest)?;
        let status = resp.status();
        let body = resp.text().await.map_err(UpstreamError::from_reqwest)?;
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: CompletionResponse =
            serde_json::from_str(&body).map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        Ok(extract_reply(parsed))
    }
}

#[async_trait::async_trait]
impl CompletionClient for OpenAiCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, UpstreamError> {
        let mut attempt = 0;
        loop {
            match self.send_once(request).await {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient completion failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn request() -> CompletionRequest {
        CompletionRequest::new(
            "gpt-3.5-turbo",
            "Q1\n\n".to_string(),
            &[ChatMessage::user("hola")],
            &DecodingParams::default(),
        )
    }

    #[test]
    fn system_prompt_is_prepended() {
        let req = request();
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[0].content, "Q1\n\n");
        assert_eq!(req.messages[1].content, "hola");
    }

    #[test]
    fn optional_params_are_omitted_when_unset() {
        let v = serde_json::to_value(request()).unwrap();
        assert_eq!(v.get("model"), Some(&json!("gpt-3.5-turbo")));
        assert!(v.get("max_tokens").is_none());
        assert!(v.get("stop").is_none());
        assert_eq!(v["messages"][0]["role"], json!("system"));
    }

    #[test]
    fn text_body_carries_flattened_prompt() {
        let params = DecodingParams {
            temperature: 0.7,
            max_tokens: Some(60),
            n: Some(1),
            stop: Some(vec!["###".into()]),
            ..DecodingParams::default()
        };
        let req = CompletionRequest::new(
            "text-davinci-002",
            "sys".into(),
            &[ChatMessage::user("hi")],
            &params,
        );
        let v: Value = serde_json::to_value(TextCompletionBody::from(&req)).unwrap();
        assert_eq!(v["prompt"], json!("system: sys\nuser: hi\nassistant:"));
        assert_eq!(v["max_tokens"], json!(60));
        assert_eq!(v["stop"], json!(["###"]));
        assert!(v.get("messages").is_none());
    }

    #[test]
    fn extracts_chat_and_text_choices() {
        let chat: CompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "  hola \n"}}]
        }))
        .unwrap();
        assert_eq!(extract_reply(chat), "hola");
        let text: CompletionResponse =
            serde_json::from_value(json!({"choices": [{"text": " hi"}, {"text": "other"}]}))
                .unwrap();
        assert_eq!(extract_reply(text), "hi");
    }

    #[test]
    fn missing_text_becomes_empty_string() {
        let none: CompletionResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert_eq!(extract_reply(none), "");
        let null_content: CompletionResponse =
            serde_json::from_value(json!({"choices": [{"message": {"content": null}}]})).unwrap();
        assert_eq!(extract_reply(null_content), "");
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(CompletionMode::parse(" Chat "), Some(CompletionMode::Chat));
        assert_eq!(CompletionMode::parse("text"), Some(CompletionMode::Text));
        assert_eq!(CompletionMode::parse("stream"), None);
    }
}
