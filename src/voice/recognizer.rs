//! Recognizer implementations that live in-process.

use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::debug;

use super::capture::Recognizer;

// ── Console ──────────────────────────────────────────────────────

/// Typed lines stand in for speech. Starting only records the locale so
/// the prompt can show whether input is being accepted.
pub struct ConsoleRecognizer {
    locale: Arc<Mutex<Option<String>>>,
}

/// Read side of a [`ConsoleRecognizer`].
#[derive(Clone)]
pub struct ConsoleListening {
    locale: Arc<Mutex<Option<String>>>,
}

impl ConsoleListening {
    /// The active locale, or `None` while capture is suspended or stopped.
    pub fn locale(&self) -> Option<String> {
        self.locale.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ConsoleRecognizer {
    pub fn new() -> (Self, ConsoleListening) {
        let locale = Arc::new(Mutex::new(None));
        (
            Self {
                locale: locale.clone(),
            },
            ConsoleListening { locale },
        )
    }
}

#[async_trait]
impl Recognizer for ConsoleRecognizer {
    async fn start(&mut self, locale: &str, generation: u64) -> Result<()> {
        debug!(locale, generation, "Console input accepted");
        *self.locale.lock().unwrap_or_else(|e| e.into_inner()) = Some(locale.to_string());
        Ok(())
    }

    async fn stop(&mut self) {
        *self.locale.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

// ── Recording (tests) ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerCall {
    Start(String, u64),
    Stop,
}

#[derive(Clone, Default)]
pub struct RecognizerLog(Arc<Mutex<Vec<RecognizerCall>>>);

impl RecognizerLog {
    pub fn snapshot(&self) -> Vec<RecognizerCall> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, call: RecognizerCall) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    /// Locale of the most recent start.
    pub fn last_locale(&self) -> Option<String> {
        self.snapshot().into_iter().rev().find_map(|c| match c {
            RecognizerCall::Start(locale, _) => Some(locale),
            RecognizerCall::Stop => None,
        })
    }
}

/// Logs every start/stop; can be told to refuse the microphone, always or
/// on one particular start.
#[derive(Default)]
pub struct RecordingRecognizer {
    log: RecognizerLog,
    deny: bool,
    refuse_attempt: Option<usize>,
    attempts: usize,
}

impl RecordingRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Refuse the `nth` start attempt (1-based) and accept the others.
    pub fn refusing_start(nth: usize) -> Self {
        Self {
            refuse_attempt: Some(nth),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> RecognizerLog {
        self.log.clone()
    }
}

#[async_trait]
impl Recognizer for RecordingRecognizer {
    async fn start(&mut self, locale: &str, generation: u64) -> Result<()> {
        self.attempts += 1;
        if self.deny || self.refuse_attempt == Some(self.attempts) {
            bail!("microphone permission denied");
        }
        self.log.push(RecognizerCall::Start(locale.to_string(), generation));
        Ok(())
    }

    async fn stop(&mut self) {
        self.log.push(RecognizerCall::Stop);
    }
}
