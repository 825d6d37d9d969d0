use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use secrecy::Secret;
use serde::Deserialize;

use crate::completion::{CompletionMode, DecodingParams, RetryPolicy};
use crate::conversation::DEFAULT_MAX_SESSIONS;
use crate::prompt::{FixedPrompt, PromptPolicy};
use crate::tokenizer::TokenEstimator;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_SESSION_IDLE_SECS: u64 = 3600;

/// Endpoint and credential shared by the moderation and completion clients.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Secret<String>,
    /// Per HTTP attempt; the pipeline applies its own bound per call.
    pub request_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: Secret::new(api_key.into()),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Questionnaire and prompt text, optionally loaded from the JSON file named
/// by `CAREERYZER_INTERVIEW_CONFIG`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct InterviewConfig {
    #[serde(default = "default_questions")]
    pub questions: Vec<String>,
    #[serde(default = "default_closing_message", alias = "closingMessage")]
    pub closing_message: String,
    #[serde(default, alias = "fixedPrompt")]
    pub fixed_prompt: FixedPrompt,
}

fn default_questions() -> Vec<String> {
    vec![
        "Cuáles son tus hobbies e intereses?".to_owned(),
        "Cuáles son tus habilidades y fortalezas? Eres bueno con los números, con la comunicación, resolviendo problemas o en trabajos manuales?".to_owned(),
        "Prefieres trabajar solo o en equipo? Estás más interesado en trabajar en una oficina o al aire libre?".to_owned(),
        "Cuál es tu nivel más alto de estudios? Tienes algún certificado, entrenamiento o bootcamp?".to_owned(),
    ]
}

fn default_closing_message() -> String {
    "Gracias por responder todas las preguntas.".to_owned()
}

impl Default for InterviewConfig {
    fn default() -> Self {
        Self {
            questions: default_questions(),
            closing_message: default_closing_message(),
            fixed_prompt: FixedPrompt::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub port: u16,
    pub model: String,
    pub completion_mode: CompletionMode,
    pub decoding: DecodingParams,
    pub token_budget: usize,
    pub prompt_policy: PromptPolicy,
    pub interview: InterviewConfig,
    pub estimator: TokenEstimator,
    pub upstream_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_request_bytes: Option<usize>,
    pub cors_origin: String,
    pub session_idle: Option<Duration>,
    pub max_sessions: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?;
        let base_url = parse_optional_string("CAREERYZER_OPENAI_BASE_URL")?
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        let upstream_timeout_ms =
            parse_optional_u64("CAREERYZER_UPSTREAM_TIMEOUT_MS")?.unwrap_or(30_000);
        if upstream_timeout_ms == 0 {
            bail!("CAREERYZER_UPSTREAM_TIMEOUT_MS must be greater than 0");
        }
        let upstream_timeout = Duration::from_millis(upstream_timeout_ms);
        let provider = ProviderConfig {
            request_timeout: upstream_timeout,
            ..ProviderConfig::new(base_url, api_key)
        };

        let port = match parse_optional_u64("PORT")? {
            Some(p) => u16::try_from(p).map_err(|_| anyhow!("PORT must be at most 65535"))?,
            None => 8080,
        };

        let model = parse_optional_string("CAREERYZER_MODEL")?
            .unwrap_or_else(|| "gpt-3.5-turbo".to_owned());
        let completion_mode = match parse_optional_string("CAREERYZER_COMPLETION_MODE")? {
            Some(raw) => CompletionMode::parse(&raw)
                .ok_or_else(|| anyhow!("CAREERYZER_COMPLETION_MODE must be chat or text"))?,
            None => CompletionMode::Chat,
        };

        let temperature = parse_optional_f32("CAREERYZER_TEMPERATURE")?.unwrap_or(0.6);
        if !(0.0..=2.0).contains(&temperature) {
            bail!("CAREERYZER_TEMPERATURE must be between 0 and 2");
        }
        let decoding = DecodingParams {
            temperature,
            max_tokens: parse_optional_u32("CAREERYZER_MAX_TOKENS")?,
            n: parse_optional_u32("CAREERYZER_N")?,
            stop: parse_optional_list("CAREERYZER_STOP")?,
            presence_penalty: parse_optional_f32("CAREERYZER_PRESENCE_PENALTY")?,
            frequency_penalty: parse_optional_f32("CAREERYZER_FREQUENCY_PENALTY")?,
        };

        let token_budget = parse_optional_u64("CAREERYZER_TOKEN_BUDGET")?.unwrap_or(4000) as usize;

        let interview = if let Some(path) = parse_optional_string("CAREERYZER_INTERVIEW_CONFIG")? {
            let content = fs::read_to_string(&path).with_context(|| {
                format!(
                    "Failed to read CAREERYZER_INTERVIEW_CONFIG '{}': file unreadable",
                    path
                )
            })?;
            serde_json::from_str::<InterviewConfig>(&content).with_context(|| {
                format!(
                    "Failed to parse CAREERYZER_INTERVIEW_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            InterviewConfig::default()
        };

        let prompt_policy = match parse_optional_string("CAREERYZER_PROMPT_MODE")?
            .map(|s| s.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("stateful") => PromptPolicy::Stateful,
            Some("fixed") => PromptPolicy::Fixed(interview.fixed_prompt.clone()),
            Some(_) => bail!("CAREERYZER_PROMPT_MODE must be stateful or fixed"),
        };
        if prompt_policy.is_stateful() && interview.questions.is_empty() {
            bail!("stateful prompt mode requires at least one interview question");
        }

        let estimator = TokenEstimator::new(
            parse_bool_env("CAREERYZER_STRIP_DIACRITICS")?.unwrap_or(false),
            parse_bool_env("CAREERYZER_STRIP_NEWLINES")?.unwrap_or(false),
        );

        let retry = RetryPolicy {
            max_retries: parse_optional_u32("CAREERYZER_MAX_RETRIES")?.unwrap_or(2),
            base_delay: Duration::from_millis(
                parse_optional_u64("CAREERYZER_RETRY_BASE_MS")?.unwrap_or(250),
            ),
        };

        let max_request_bytes =
            parse_optional_u64("CAREERYZER_MAX_REQUEST_BYTES")?.map(|v| v as usize);
        let cors_origin =
            parse_optional_string("CAREERYZER_CORS_ORIGIN")?.unwrap_or_else(|| "*".to_owned());
        // 0 turns idle pruning off; the session cap still applies.
        let idle_secs = parse_optional_u64("CAREERYZER_SESSION_IDLE_SECS")?
            .unwrap_or(DEFAULT_SESSION_IDLE_SECS);
        let session_idle = (idle_secs > 0).then(|| Duration::from_secs(idle_secs));
        let max_sessions = parse_optional_u64("CAREERYZER_MAX_SESSIONS")?
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_SESSIONS);
        if max_sessions == 0 {
            bail!("CAREERYZER_MAX_SESSIONS must be greater than 0");
        }

        Ok(Self {
            provider,
            port,
            model,
            completion_mode,
            decoding,
            token_budget,
            prompt_policy,
            interview,
            estimator,
            upstream_timeout,
            retry,
            max_request_bytes,
            cors_origin,
            session_idle,
            max_sessions,
        })
    }
}

fn parse_optional_string(var: &str) -> Result<Option<String>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(Some(value.trim().to_owned())),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    parse_optional_string(var)?
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| anyhow!("{} must be a positive integer", var))
        })
        .transpose()
}

fn parse_optional_u32(var: &str) -> Result<Option<u32>> {
    parse_optional_u64(var)?
        .map(|v| u32::try_from(v).map_err(|_| anyhow!("{} is out of range", var)))
        .transpose()
}

fn parse_optional_f32(var: &str) -> Result<Option<f32>> {
    parse_optional_string(var)?
        .map(|value| {
            value
                .parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| anyhow!("{} must be a number", var))
        })
        .transpose()
}

fn parse_optional_list(var: &str) -> Result<Option<Vec<String>>> {
    Ok(parse_optional_string(var)?
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
        })
        .filter(|list| !list.is_empty()))
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    parse_optional_string(var)?
        .map(|value| {
            parse_bool(&value).ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var))
        })
        .transpose()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
