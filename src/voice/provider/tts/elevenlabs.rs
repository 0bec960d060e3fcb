//! ElevenLabs text-to-speech with one voice per language.
//!
//! Flow: pick the voice from the language hint (or the script of the text
//! when there is no hint), then POST `/text-to-speech/{voice_id}` and return
//! the MPEG body as-is.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::config::ElevenLabsConfig;
use crate::voice::provider::{
    AudioSegment, ProviderError, SpeechRequest, SpeechSynthesizer, ensure_success, require,
};
use crate::voice::state::Language;

pub struct ElevenLabsSynthesizer {
    config: ElevenLabsConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct TtsBody<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

/// Language to speak `text` in: the hint if known, else the script.
pub fn resolve_language(hint: Language, text: &str) -> Language {
    match hint {
        Language::Unknown => match Language::detect_script(text) {
            Language::Ru => Language::Ru,
            _ => Language::En,
        },
        known => known,
    }
}

impl ElevenLabsSynthesizer {
    pub fn new(config: ElevenLabsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Voice id for the language, or a config error naming the missing key.
    pub fn voice_id(&self, language: Language) -> Result<&str, ProviderError> {
        match language {
            Language::Ru => require(&self.config.voice_id_ru, "elevenlabs.voice_id_ru"),
            Language::En | Language::Unknown => {
                require(&self.config.voice_id_en, "elevenlabs.voice_id_en")
            }
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioSegment, ProviderError> {
        let api_key = require(&self.config.api_key, "elevenlabs.api_key")?;
        let language = resolve_language(request.language, &request.text);
        let voice_id = self.voice_id(language)?;

        debug!(%language, voice_id, chars = request.text.chars().count(), "Synthesizing reply");

        let body = TtsBody {
            text: &request.text,
            model_id: &self.config.model_id,
            voice_settings: VoiceSettings {
                stability: self.config.stability,
                similarity_boost: self.config.similarity_boost,
            },
        };

        let resp = self
            .client
            .post(format!(
                "{}/text-to-speech/{}",
                self.config.base_url.trim_end_matches('/'),
                voice_id
            ))
            .header("xi-api-key", api_key)
            .header(reqwest::header::ACCEPT, "audio/mpeg")
            .json(&body)
            .send()
            .await?;
        let bytes = ensure_success(resp).await?.bytes().await?;
        if bytes.is_empty() {
            return Err(ProviderError::Malformed("empty audio body".into()));
        }

        Ok(AudioSegment::new(bytes, "audio/mpeg"))
    }

    fn name(&self) -> &str {
        "elevenlabs"
    }
}
