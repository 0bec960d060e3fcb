//! On-device speech via `espeak-ng --stdout`.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::FallbackConfig;
use crate::utils::summarize_details;
use crate::voice::provider::{
    AudioSegment, MAX_DETAILS_BYTES, ProviderError, SpeechRequest, SpeechSynthesizer,
};
use crate::voice::provider::tts::elevenlabs::resolve_language;
use crate::voice::state::Language;

pub struct EspeakSynthesizer {
    config: FallbackConfig,
}

impl EspeakSynthesizer {
    pub fn new(config: FallbackConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &SpeechRequest) -> Command {
        let voice = match resolve_language(request.language, &request.text) {
            Language::Ru => "ru",
            _ => "en",
        };
        let mut cmd = Command::new(&self.config.program);
        cmd.arg("-v")
            .arg(voice)
            .arg("-s")
            .arg(self.config.words_per_minute.to_string())
            .arg("--stdout")
            .arg("--")
            .arg(&request.text)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SpeechSynthesizer for EspeakSynthesizer {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioSegment, ProviderError> {
        debug!(program = %self.config.program, lang = %request.language, "Local synthesis");

        let output = self.command(request).output().await.map_err(|e| {
            ProviderError::Local(format!("failed to run {}: {e}", self.config.program))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Local(format!(
                "{} exited with {}: {}",
                self.config.program,
                output.status,
                summarize_details(&stderr, MAX_DETAILS_BYTES)
            )));
        }
        if output.stdout.is_empty() {
            return Err(ProviderError::Local(format!(
                "{} produced no audio",
                self.config.program
            )));
        }

        Ok(AudioSegment::new(output.stdout, "audio/wav"))
    }

    fn name(&self) -> &str {
        "espeak"
    }
}
