//! OpenAI audio transcription (`/audio/transcriptions`).

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use crate::config::OpenAiConfig;
use crate::voice::provider::{ProviderError, RecordedAudio, Transcriber, ensure_success, require};

pub struct WhisperTranscriber {
    config: OpenAiConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: Option<String>,
}

impl WhisperTranscriber {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/audio/transcriptions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &RecordedAudio) -> Result<String, ProviderError> {
        let api_key = require(&self.config.api_key, "openai.api_key")?;

        let file = Part::bytes(audio.bytes.to_vec())
            .file_name(audio.file_name.clone())
            .mime_str(&audio.mime)?;
        let form = Form::new()
            .part("file", file)
            .text("model", self.config.transcription_model.clone())
            .text("response_format", "json");

        debug!(
            bytes = audio.bytes.len(),
            file = %audio.file_name,
            model = %self.config.transcription_model,
            "Sending clip for transcription"
        );

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;
        let body: TranscriptionResponse = ensure_success(resp)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        Ok(body.text.unwrap_or_default().trim().to_string())
    }

    fn name(&self) -> &str {
        "whisper"
    }
}
