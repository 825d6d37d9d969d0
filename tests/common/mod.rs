#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use careeryzer::chat::{ChatService, ChatSettings};
use careeryzer::completion::{CompletionClient, CompletionRequest, DecodingParams};
use careeryzer::conversation::SessionStore;
use careeryzer::error::UpstreamError;
use careeryzer::moderation::{ModerationVerdict, Moderator};
use careeryzer::prompt::PromptPolicy;
use careeryzer::tokenizer::TokenEstimator;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Moderator double: flags when configured to, and can simulate an outage
/// or a slow provider.
#[derive(Default)]
pub struct MockModerator {
    pub flag: bool,
    pub fail: bool,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<String>>,
}

impl MockModerator {
    pub fn allowing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn flagging() -> Arc<Self> {
        Arc::new(Self {
            flag: true,
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Moderator for MockModerator {
    async fn check(&self, text: &str) -> Result<ModerationVerdict, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(text.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(UpstreamError::Network("moderation unreachable".into()));
        }
        Ok(ModerationVerdict { flagged: self.flag })
    }
}

/// Completion double.  Scripted outcomes are consumed first; afterwards it
/// echoes the last message as `reply to: <content>`.
#[derive(Default)]
pub struct MockCompleter {
    pub script: Mutex<VecDeque<Result<String, UpstreamError>>>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl MockCompleter {
    pub fn echoing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(outcomes: Vec<Result<String, UpstreamError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
            ..Self::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait::async_trait]
impl CompletionClient for MockCompleter {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        if let Some(outcome) = scripted {
            return outcome;
        }
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(format!("reply to: {}", last))
    }
}

pub fn settings(policy: PromptPolicy) -> ChatSettings {
    ChatSettings {
        model: "gpt-test".to_string(),
        decoding: DecodingParams::default(),
        token_budget: 4000,
        upstream_timeout: Duration::from_secs(2),
        prompt_policy: policy,
        closing_message: "Gracias por responder todas las preguntas.".to_string(),
        estimator: TokenEstimator::default(),
    }
}

pub fn service_with(
    settings: ChatSettings,
    questions: &[&str],
    moderator: Arc<MockModerator>,
    completer: Arc<MockCompleter>,
) -> ChatService {
    let sessions = SessionStore::new(questions.iter().map(|q| q.to_string()).collect());
    ChatService::new(settings, moderator, completer, sessions)
}

pub fn stateful_service(
    questions: &[&str],
    moderator: Arc<MockModerator>,
    completer: Arc<MockCompleter>,
) -> ChatService {
    service_with(
        settings(PromptPolicy::Stateful),
        questions,
        moderator,
        completer,
    )
}
