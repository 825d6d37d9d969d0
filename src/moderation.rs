//! Content moderation gate backed by the provider's moderation endpoint.

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::error::UpstreamError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub flagged: bool,
}

/// External content-safety check.  Implementations must not retry: a failed
/// call fails the request.
#[async_trait::async_trait]
pub trait Moderator: Send + Sync {
    async fn check(&self, text: &str) -> Result<ModerationVerdict, UpstreamError>;
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct ModerationResponse {
    #[serde(default)]
    results: Vec<ModerationVerdict>,
}

/// Calls `POST {base}/moderations` and reads the first result's `flagged`.
pub struct OpenAiModerator {
    provider: ProviderConfig,
    client: reqwest::Client,
}

impl OpenAiModerator {
    pub fn new(provider: ProviderConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(provider.request_timeout)
            .build()?;
        Ok(Self { provider, client })
    }

    fn url(&self) -> String {
        format!("{}/moderations", self.provider.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl Moderator for OpenAiModerator {
    async fn check(&self, text: &str) -> Result<ModerationVerdict, UpstreamError> {
        let resp = self
            .client
            .post(self.url())
            .bearer_auth(self.provider.api_key.expose_secret())
            .json(&ModerationRequest { input: text })
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;
        let status = resp.status();
        let body = resp.text().await.map_err(UpstreamError::from_reqwest)?;
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: ModerationResponse =
            serde_json::from_str(&body).map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        // One input yields one result; a missing result is treated as not flagged.
        Ok(parsed.results.into_iter().next().unwrap_or_default())
    }
}
