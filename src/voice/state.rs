//! Observable conversation state.
//!
//! One [`StateHandle`] exists per session. Components mutate it through the
//! named transitions below; observers (the WebSocket writer, the console
//! status line, tests) hold a `watch::Receiver`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Language tag attached to utterances and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Ru,
    Unknown,
}

impl Language {
    /// Parse a loose tag such as `"ru"`, `"ru-RU"` or `"EN"`.
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim().to_ascii_lowercase();
        if tag.starts_with("ru") {
            Self::Ru
        } else if tag.starts_with("en") {
            Self::En
        } else {
            Self::Unknown
        }
    }

    /// Guess from the script: any Cyrillic letter means Russian, otherwise
    /// any Latin letter means English.
    pub fn detect_script(text: &str) -> Self {
        if text.chars().any(|c| ('\u{0400}'..='\u{04FF}').contains(&c)) {
            Self::Ru
        } else if text.chars().any(|c| c.is_ascii_alphabetic()) {
            Self::En
        } else {
            Self::Unknown
        }
    }

    /// Recognizer locale. `Unknown` falls back to English.
    pub fn locale(self) -> &'static str {
        match self {
            Self::Ru => "ru-RU",
            Self::En | Self::Unknown => "en-US",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Ru => "ru",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Busy,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub connection_status: ConnectionStatus,
    pub current_language: Language,
    pub current_voice_id: String,
    pub last_error_message: Option<String>,
    /// Single human-readable status line.
    pub status_text: String,
}

impl ConversationState {
    pub fn new(language: Language, voice_id: impl Into<String>) -> Self {
        Self {
            connection_status: ConnectionStatus::Disconnected,
            current_language: language,
            current_voice_id: voice_id.into(),
            last_error_message: None,
            status_text: "Disconnected".to_string(),
        }
    }
}

/// Shared writer for a session's [`ConversationState`].
#[derive(Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<ConversationState>>,
}

impl StateHandle {
    pub fn new(initial: ConversationState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ConversationState {
        self.tx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.tx.borrow().connection_status
    }

    /// Move to `status` with a fresh status line. Clears the last error
    /// unless the new status is `Error` or `Disconnected`.
    pub fn transition(&self, status: ConnectionStatus, text: impl Into<String>) {
        let text = text.into();
        self.tx.send_modify(|state| {
            state.connection_status = status;
            state.status_text = text;
            if !matches!(status, ConnectionStatus::Error | ConnectionStatus::Disconnected) {
                state.last_error_message = None;
            }
        });
    }

    /// Record a user-visible failure and move to `status`.
    pub fn fail(&self, status: ConnectionStatus, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|state| {
            state.connection_status = status;
            state.status_text = message.clone();
            state.last_error_message = Some(message);
        });
    }

    /// Move to `status` and keep `message` as the last error, in one update.
    pub fn transition_with_error(
        &self,
        status: ConnectionStatus,
        text: impl Into<String>,
        message: impl Into<String>,
    ) {
        let text = text.into();
        let message = message.into();
        self.tx.send_modify(|state| {
            state.connection_status = status;
            state.status_text = text;
            state.last_error_message = Some(message);
        });
    }

    /// Update the status line without changing the connection status.
    pub fn set_status_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.tx.send_modify(|state| state.status_text = text);
    }

    /// Report a problem that did not change the connection status.
    pub fn note_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|state| {
            state.status_text = message.clone();
            state.last_error_message = Some(message);
        });
    }

    pub fn set_language(&self, language: Language, voice_id: impl Into<String>) {
        let voice_id = voice_id.into();
        self.tx.send_modify(|state| {
            state.current_language = language;
            state.current_voice_id = voice_id;
        });
    }
}
