//! Mock transcriber for testing.
//!
//! Replays scripted transcripts in order and records how many clips it saw.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::voice::provider::{ProviderError, RecordedAudio, Transcriber};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum MockTranscript {
    Text(String),
    Fail { status: u16, body: String },
}

pub struct MockTranscriber {
    script: Mutex<VecDeque<MockTranscript>>,
    latency: Duration,
    calls: AtomicUsize,
}

impl MockTranscriber {
    pub fn new(script: Vec<MockTranscript>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answers with `text`.
    pub fn fixed(text: &str) -> Self {
        Self::new(vec![MockTranscript::Text(text.to_string())])
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _audio: &RecordedAudio) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        // The last entry repeats once the script is exhausted.
        let next = {
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };

        match next {
            Some(MockTranscript::Text(text)) => Ok(text),
            Some(MockTranscript::Fail { status, body }) => {
                Err(ProviderError::Upstream { status, body })
            }
            None => Ok(String::new()),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
