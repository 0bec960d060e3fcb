//! Capabilities backed by a remote `voxroom serve` gateway.
//!
//! Used by `voxroom chat --remote`: provider credentials stay on the
//! gateway, and this side only holds a session token.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use crate::auth::AuthCheck;
use crate::config::OpenAiConfig;
use crate::voice::provider::realtime::openai::post_offer;
use crate::voice::provider::realtime::{EphemeralCredential, RealtimeSignaling, parse_credential};
use crate::voice::provider::{
    AudioSegment, ProviderError, RecordedAudio, ReplyGenerator, ReplyRequest, SpeechRequest,
    SpeechSynthesizer, Transcriber, ensure_success,
};

pub struct GatewayClient {
    base: Url,
    token: String,
    client: reqwest::Client,
    realtime_url: String,
    realtime_model: String,
}

#[derive(Debug, Deserialize)]
struct TextBody {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReplyBody {
    reply: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeBody {
    #[serde(default)]
    authenticated: bool,
}

impl GatewayClient {
    pub fn new(base_url: &str, token: impl Into<String>, openai: &OpenAiConfig) -> Result<Self, ProviderError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| ProviderError::Config(format!("gateway url {base_url:?}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            token: token.into(),
            client: reqwest::Client::new(),
            realtime_url: openai.realtime_url.clone(),
            realtime_model: openai.realtime_model.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ProviderError::Config(format!("gateway path {path:?}: {e}")))
    }

    async fn post_json<B: Serialize + ?Sized + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(self.endpoint(path)?)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        ensure_success(resp).await
    }
}

#[async_trait]
impl Transcriber for GatewayClient {
    async fn transcribe(&self, audio: &RecordedAudio) -> Result<String, ProviderError> {
        let part = Part::bytes(audio.bytes.to_vec())
            .file_name(audio.file_name.clone())
            .mime_str(&audio.mime)?;
        let resp = self
            .client
            .post(self.endpoint("api/voice/transcribe")?)
            .bearer_auth(&self.token)
            .multipart(Form::new().part("audio", part))
            .send()
            .await?;
        let body: TextBody = ensure_success(resp)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(body.text.unwrap_or_default().trim().to_string())
    }

    fn name(&self) -> &str {
        "gateway"
    }
}

#[async_trait]
impl ReplyGenerator for GatewayClient {
    async fn generate(&self, request: &ReplyRequest) -> Result<String, ProviderError> {
        let body: ReplyBody = self
            .post_json("api/voice/reply-text", request)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        body.reply
            .ok_or_else(|| ProviderError::Malformed("missing reply".into()))
    }

    fn name(&self) -> &str {
        "gateway"
    }
}

#[async_trait]
impl SpeechSynthesizer for GatewayClient {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioSegment, ProviderError> {
        let resp = self.post_json("api/voice/tts", request).await?;
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(ProviderError::Malformed("empty audio body".into()));
        }
        Ok(AudioSegment::new(bytes, mime))
    }

    fn name(&self) -> &str {
        "gateway"
    }
}

#[async_trait]
impl RealtimeSignaling for GatewayClient {
    async fn fetch_credential(&self) -> Result<EphemeralCredential, ProviderError> {
        let body: Value = self
            .post_json("api/voice/realtime/session", &json!({}))
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        parse_credential(&body)
    }

    async fn exchange_sdp(
        &self,
        credential: &EphemeralCredential,
        offer_sdp: &str,
    ) -> Result<String, ProviderError> {
        post_offer(
            &self.client,
            &self.realtime_url,
            &self.realtime_model,
            credential,
            offer_sdp,
        )
        .await
    }

    fn name(&self) -> &str {
        "gateway"
    }
}

#[async_trait]
impl AuthCheck for GatewayClient {
    async fn is_authenticated(&self) -> bool {
        let Ok(url) = self.endpoint("api/me") else {
            return false;
        };
        let resp = match self.client.get(url).bearer_auth(&self.token).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(error = %e, "Auth check request failed");
                return false;
            }
        };
        match resp.json::<MeBody>().await {
            Ok(me) => me.authenticated,
            Err(e) => {
                debug!(error = %e, "Auth check returned an unexpected body");
                false
            }
        }
    }
}
