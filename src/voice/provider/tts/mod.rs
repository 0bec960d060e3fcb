//! Speech synthesis implementations.

pub mod elevenlabs;
pub mod espeak;
pub mod mock;

use std::sync::Arc;

use crate::config::Config;
use crate::voice::provider::SpeechSynthesizer;

/// The networked multi-voice synthesizer.
pub fn create_synthesizer(config: &Config) -> Arc<dyn SpeechSynthesizer> {
    Arc::new(elevenlabs::ElevenLabsSynthesizer::new(config.elevenlabs.clone()))
}

/// The on-device synthesizer used as the terminal fallback, if enabled.
pub fn create_local_synthesizer(config: &Config) -> Option<Arc<dyn SpeechSynthesizer>> {
    config
        .fallback
        .enabled
        .then(|| Arc::new(espeak::EspeakSynthesizer::new(config.fallback.clone())) as Arc<dyn SpeechSynthesizer>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_can_be_disabled() {
        let mut config = Config::default();
        assert_eq!(create_local_synthesizer(&config).unwrap().name(), "espeak");
        config.fallback.enabled = false;
        assert!(create_local_synthesizer(&config).is_none());
    }
}
