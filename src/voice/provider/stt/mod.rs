//! Transcription implementations.

pub mod mock;
pub mod whisper;

use std::sync::Arc;

use crate::config::Config;
use crate::voice::provider::Transcriber;

/// Build the upstream transcriber from configuration. A missing API key is
/// reported when the first clip is transcribed, not here.
pub fn create_transcriber(config: &Config) -> Arc<dyn Transcriber> {
    Arc::new(whisper::WhisperTranscriber::new(config.openai.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_whisper() {
        let transcriber = create_transcriber(&Config::default());
        assert_eq!(transcriber.name(), "whisper");
    }
}
