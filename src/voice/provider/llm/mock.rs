//! Mock reply generator for testing.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::voice::provider::{ProviderError, ReplyGenerator, ReplyRequest};

#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with this text.
    Text(String),
    /// Echo the request text back, prefixed.
    Echo(String),
    Fail { status: u16, body: String },
}

pub struct MockReplyGenerator {
    reply: MockReply,
    latency: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<ReplyRequest>>,
}

impl MockReplyGenerator {
    pub fn new(reply: MockReply) -> Self {
        Self {
            reply,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn fixed(text: &str) -> Self {
        Self::new(MockReply::Text(text.to_string()))
    }

    pub fn echo() -> Self {
        Self::new(MockReply::Echo("You said: ".to_string()))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<ReplyRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ReplyGenerator for MockReplyGenerator {
    async fn generate(&self, request: &ReplyRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        match &self.reply {
            MockReply::Text(text) => Ok(text.clone()),
            MockReply::Echo(prefix) => Ok(format!("{prefix}{}", request.text)),
            MockReply::Fail { status, body } => Err(ProviderError::Upstream {
                status: *status,
                body: body.clone(),
            }),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
