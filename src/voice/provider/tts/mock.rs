//! Mock speech synthesizer for testing.
//!
//! Produces deterministic "audio" (the UTF-8 text prefixed with a tag) and
//! can be scripted to fail, either always or for the first N calls.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::voice::provider::{AudioSegment, ProviderError, SpeechRequest, SpeechSynthesizer};

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MockSynthConfig {
    /// Prefix written before the text in every segment.
    pub tag: String,
    pub mime: String,
    /// Fail this many calls before succeeding.
    pub fail_first: usize,
    /// Fail every call.
    pub always_fail: bool,
    pub fail_status: u16,
    pub latency: Duration,
}

impl Default for MockSynthConfig {
    fn default() -> Self {
        Self {
            tag: "mock".to_string(),
            mime: "audio/mpeg".to_string(),
            fail_first: 0,
            always_fail: false,
            fail_status: 500,
            latency: Duration::ZERO,
        }
    }
}

// ── Provider ─────────────────────────────────────────────────────

pub struct MockSynthesizer {
    config: MockSynthConfig,
    calls: AtomicUsize,
    requests: Mutex<Vec<SpeechRequest>>,
}

impl MockSynthesizer {
    pub fn new(config: MockSynthConfig) -> Self {
        Self {
            config,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn working(tag: &str) -> Self {
        Self::new(MockSynthConfig {
            tag: tag.to_string(),
            ..Default::default()
        })
    }

    /// Every call fails with an upstream `status`.
    pub fn failing(status: u16) -> Self {
        Self::new(MockSynthConfig {
            always_fail: true,
            fail_status: status,
            ..Default::default()
        })
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.config.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SpeechRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioSegment, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        if !self.config.latency.is_zero() {
            sleep(self.config.latency).await;
        }

        if self.config.always_fail || call < self.config.fail_first {
            return Err(ProviderError::Upstream {
                status: self.config.fail_status,
                body: "synthesis unavailable".to_string(),
            });
        }

        let payload = format!("{}:{}", self.config.tag, request.text);
        Ok(AudioSegment::new(payload.into_bytes(), self.config.mime.clone()))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::state::Language;

    fn req(text: &str) -> SpeechRequest {
        SpeechRequest {
            text: text.into(),
            language: Language::En,
        }
    }

    #[tokio::test]
    async fn payload_is_tagged_text() {
        let synth = MockSynthesizer::working("el");
        let audio = synth.synthesize(&req("Hi there")).await.unwrap();
        assert_eq!(&audio.bytes[..], b"el:Hi there");
        assert_eq!(audio.mime, "audio/mpeg");
    }

    #[tokio::test]
    async fn fail_first_then_recover() {
        let synth = MockSynthesizer::new(MockSynthConfig {
            fail_first: 1,
            ..Default::default()
        });
        assert!(synth.synthesize(&req("a")).await.is_err());
        assert!(synth.synthesize(&req("a")).await.is_ok());
        assert_eq!(synth.calls(), 2);
    }

    #[tokio::test]
    async fn always_failing() {
        let synth = MockSynthesizer::failing(503);
        let err = synth.synthesize(&req("a")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Upstream { status: 503, .. }));
    }
}
