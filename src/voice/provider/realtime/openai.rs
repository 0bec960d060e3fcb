//! OpenAI realtime signaling.
//!
//! `issue` runs on the gateway with the long-lived key
//! (`POST /realtime/sessions`). `exchange_sdp` posts the offer to the
//! realtime endpoint using only the ephemeral credential.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::OpenAiConfig;
use crate::voice::provider::realtime::{
    CredentialIssuer, EphemeralCredential, RealtimeSignaling, parse_credential,
};
use crate::voice::provider::{ProviderError, ensure_success, require};

pub struct OpenAiRealtime {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiRealtime {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn session_body(&self) -> Value {
        json!({
            "model": self.config.realtime_model,
            "voice": self.config.realtime_voice,
            "modalities": ["text", "audio"],
        })
    }
}

/// POST an SDP offer and return the answer body.
pub async fn post_offer(
    client: &reqwest::Client,
    realtime_url: &str,
    model: &str,
    credential: &EphemeralCredential,
    offer_sdp: &str,
) -> Result<String, ProviderError> {
    let resp = client
        .post(realtime_url)
        .query(&[("model", model)])
        .bearer_auth(&credential.value)
        .header(reqwest::header::CONTENT_TYPE, "application/sdp")
        .body(offer_sdp.to_string())
        .send()
        .await?;
    let answer = ensure_success(resp).await?.text().await?;
    if answer.trim().is_empty() {
        return Err(ProviderError::Malformed("empty SDP answer".into()));
    }
    Ok(answer)
}

#[async_trait]
impl CredentialIssuer for OpenAiRealtime {
    async fn issue(&self) -> Result<Value, ProviderError> {
        let api_key = require(&self.config.api_key, "openai.api_key")?;
        debug!(model = %self.config.realtime_model, "Issuing realtime credential");

        let resp = self
            .client
            .post(format!(
                "{}/realtime/sessions",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(api_key)
            .json(&self.session_body())
            .send()
            .await?;
        ensure_success(resp)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl RealtimeSignaling for OpenAiRealtime {
    async fn fetch_credential(&self) -> Result<EphemeralCredential, ProviderError> {
        parse_credential(&self.issue().await?)
    }

    async fn exchange_sdp(
        &self,
        credential: &EphemeralCredential,
        offer_sdp: &str,
    ) -> Result<String, ProviderError> {
        post_offer(
            &self.client,
            &self.config.realtime_url,
            &self.config.realtime_model,
            credential,
            offer_sdp,
        )
        .await
    }

    fn name(&self) -> &str {
        "openai"
    }
}
