//! Capability routes.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::error::ApiError;
use super::{AppState, AuthUser};
use crate::voice::provider::{RecordedAudio, ReplyRequest, SpeechRequest};
use crate::voice::state::Language;

/// `{ text, lang? }` as sent by clients.
#[derive(Debug, Deserialize)]
pub struct TextBody {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub lang: Option<String>,
}

impl TextBody {
    fn text(&self) -> Result<&str, ApiError> {
        let text = self.text.trim();
        if text.is_empty() {
            return Err(ApiError::BadRequest("No text".into()));
        }
        Ok(text)
    }

    fn language(&self) -> Language {
        self.lang.as_deref().map(Language::from_tag).unwrap_or(Language::Unknown)
    }
}

fn parse_body(body: Result<Json<TextBody>, JsonRejection>) -> Result<TextBody, ApiError> {
    body.map(|Json(b)| b)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Json<MeResponse> {
    let user = state.authenticate(&headers);
    Json(MeResponse {
        authenticated: user.is_some(),
        user,
    })
}

/// Multipart upload with an `audio` field → `{ text }`.
pub async fn transcribe(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut audio = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("audio") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("audio.webm").to_string();
        let mime = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| RecordedAudio::mime_for(&file_name).to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        audio = Some(RecordedAudio::new(bytes, file_name, mime));
        break;
    }

    let Some(audio) = audio.filter(|a| !a.bytes.is_empty()) else {
        return Err(ApiError::BadRequest("No file".into()));
    };
    debug!(%user, bytes = audio.bytes.len(), mime = %audio.mime, "Transcribe request");

    let text = state
        .capabilities
        .transcriber
        .transcribe(&audio)
        .await
        .map_err(|e| ApiError::from_provider("Transcription failed", e))?;
    Ok(Json(json!({ "text": text })))
}

/// `{ text, lang? }` → `{ reply }`.
pub async fn reply_text(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    body: Result<Json<TextBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let body = parse_body(body)?;
    let request = ReplyRequest {
        text: body.text()?.to_string(),
        language: body.language(),
    };
    debug!(%user, language = %request.language, "Reply request");

    let reply = state
        .capabilities
        .generator
        .generate(&request)
        .await
        .map_err(|e| ApiError::from_provider("Reply generation failed", e))?;
    Ok(Json(json!({ "reply": reply })))
}

/// `{ text, lang? }` → audio bytes.
pub async fn tts(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    body: Result<Json<TextBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let body = parse_body(body)?;
    let request = SpeechRequest {
        text: body.text()?.to_string(),
        language: body.language(),
    };

    let audio = state
        .capabilities
        .synthesizer
        .synthesize(&request)
        .await
        .map_err(|e| ApiError::from_provider("TTS failed", e))?;
    info!(%user, bytes = audio.bytes.len(), "Speech synthesized");
    Ok(([(CONTENT_TYPE, audio.mime.clone())], audio.bytes).into_response())
}

/// Mint an ephemeral realtime credential. The upstream body is passed
/// through unchanged.
pub async fn realtime_session(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .issuer
        .issue()
        .await
        .map_err(|e| ApiError::from_provider("Failed to create realtime session", e))?;
    info!(%user, "Realtime credential issued");
    Ok(Json(session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::{mock_capabilities, state};
    use crate::voice::pipeline::Capabilities;
    use crate::voice::provider::tts::mock::MockSynthesizer;
    use axum::http::StatusCode;
    use std::sync::Arc;

    fn body(text: &str, lang: Option<&str>) -> Result<Json<TextBody>, JsonRejection> {
        Ok(Json(TextBody {
            text: text.into(),
            lang: lang.map(str::to_string),
        }))
    }

    fn user() -> AuthUser {
        AuthUser("ana".into())
    }

    #[test]
    fn language_hint_parsing() {
        let with = |lang: Option<&str>| TextBody {
            text: "x".into(),
            lang: lang.map(str::to_string),
        };
        assert_eq!(with(Some("ru-RU")).language(), Language::Ru);
        assert_eq!(with(Some("en")).language(), Language::En);
        assert_eq!(with(None).language(), Language::Unknown);
    }

    #[tokio::test]
    async fn reply_text_echoes_through_generator() {
        let Json(value) = reply_text(user(), State(state(mock_capabilities())), body("Hello", Some("en")))
            .await
            .unwrap();
        assert_eq!(value["reply"], "You said: Hello");
    }

    #[tokio::test]
    async fn empty_text_is_bad_request() {
        let err = reply_text(user(), State(state(mock_capabilities())), body("   ", None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "No text");
    }

    #[tokio::test]
    async fn tts_returns_audio_with_content_type() {
        let resp = tts(user(), State(state(mock_capabilities())), body("Привет", Some("ru")))
            .await
            .unwrap();
        assert_eq!(resp.headers()[CONTENT_TYPE], "audio/mpeg");
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 16).await.unwrap();
        assert_eq!(&bytes[..], "el:Привет".as_bytes());
    }

    #[tokio::test]
    async fn tts_failure_is_500_with_details() {
        let caps = Capabilities {
            synthesizer: Arc::new(MockSynthesizer::failing(500)),
            ..mock_capabilities()
        };
        let err = tts(user(), State(state(caps)), body("Hello", None))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "TTS failed");
    }

    #[tokio::test]
    async fn realtime_session_passes_upstream_body() {
        let Json(value) = realtime_session(user(), State(state(mock_capabilities())))
            .await
            .unwrap();
        assert_eq!(value["client_secret"]["value"], "ek_test");
    }

    #[tokio::test]
    async fn me_reports_anonymous_callers() {
        let Json(me) = me(State(state(mock_capabilities())), HeaderMap::new()).await;
        assert!(!me.authenticated);
        assert!(me.user.is_none());

        let Json(me) = super::me(
            State(state(mock_capabilities())),
            crate::server::test_support::bearer("ana"),
        )
        .await;
        assert_eq!(me.user.as_deref(), Some("ana"));
    }
}
