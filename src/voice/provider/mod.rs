//! Capability traits (transcription, reply generation, speech synthesis,
//! realtime signaling) and their implementations.
//!
//! The conversation core only sees these traits. HTTP implementations talk
//! to the upstream services directly; [`gateway`] implementations talk to a
//! `voxroom serve` instance using the same request/response contracts.

pub mod gateway;
pub mod llm;
pub mod realtime;
pub mod stt;
pub mod tts;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::summarize_details;
use crate::voice::state::Language;

/// Upstream error text shown to users is cut to this many bytes.
pub const MAX_DETAILS_BYTES: usize = 300;

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProviderError {
    /// A required credential or setting is absent.
    #[error("missing configuration: {0}")]
    Config(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("local synthesis failed: {0}")]
    Local(String),
}

impl ProviderError {
    /// Short form for status lines and JSON `details`.
    pub fn user_message(&self) -> String {
        summarize_details(&self.to_string(), MAX_DETAILS_BYTES)
    }
}

/// Turn a non-success response into [`ProviderError::Upstream`] carrying
/// the response body.
pub(crate) async fn ensure_success(
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::Upstream {
        status: status.as_u16(),
        body: summarize_details(&body, MAX_DETAILS_BYTES),
    })
}

pub(crate) fn require<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ProviderError> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ProviderError::Config(name.to_string()))
}

// ── STT ──────────────────────────────────────────────────────────

/// A recorded clip submitted for transcription.
#[derive(Debug, Clone)]
pub struct RecordedAudio {
    pub bytes: Bytes,
    pub file_name: String,
    pub mime: String,
}

impl RecordedAudio {
    pub fn new(bytes: impl Into<Bytes>, file_name: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            file_name: file_name.into(),
            mime: mime.into(),
        }
    }

    /// Guess the MIME type from the file extension.
    pub fn mime_for(file_name: &str) -> &'static str {
        let ext = file_name.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
        match ext.as_str() {
            "wav" => "audio/wav",
            "mp3" | "mpeg" => "audio/mpeg",
            "ogg" | "oga" => "audio/ogg",
            "m4a" | "mp4" => "audio/mp4",
            "flac" => "audio/flac",
            _ => "audio/webm",
        }
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Returns the transcript; an empty string means nothing was said.
    async fn transcribe(&self, audio: &RecordedAudio) -> Result<String, ProviderError>;

    fn name(&self) -> &str;
}

// ── LLM ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub text: String,
    #[serde(rename = "lang")]
    pub language: Language,
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, request: &ReplyRequest) -> Result<String, ProviderError>;

    fn name(&self) -> &str;
}

// ── TTS ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    #[serde(rename = "lang")]
    pub language: Language,
}

/// Synthesized audio, opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSegment {
    pub bytes: Bytes,
    pub mime: String,
}

impl AudioSegment {
    pub fn new(bytes: impl Into<Bytes>, mime: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime: mime.into(),
        }
    }

    /// File extension matching the MIME type.
    pub fn extension(&self) -> &'static str {
        match self.mime.as_str() {
            "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
            "audio/ogg" => "ogg",
            _ => "mp3",
        }
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioSegment, ProviderError>;

    fn name(&self) -> &str;
}
