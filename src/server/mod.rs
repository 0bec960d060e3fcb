//! HTTP gateway
//!
//! Exposes the transcription, reply, speech and realtime-credential
//! capabilities over HTTP, plus a WebSocket endpoint that runs a whole
//! conversation session server-side. Provider keys never leave this
//! process; clients only ever see ephemeral realtime credentials.

pub mod error;
pub mod media;
pub mod routes;
pub mod websocket;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{DefaultBodyLimit, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{SessionSigner, extract_token};
use crate::config::Config;
use crate::voice::pipeline::Capabilities;
use crate::voice::provider::realtime::{CredentialIssuer, RealtimeSignaling};
use crate::voice::provider::realtime::openai::OpenAiRealtime;
use crate::voice::provider::{SpeechSynthesizer, llm, stt, tts};
use error::ApiError;
use websocket::SessionRegistry;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub signer: Option<SessionSigner>,
    pub capabilities: Capabilities,
    pub local_voice: Option<Arc<dyn SpeechSynthesizer>>,
    pub issuer: Arc<dyn CredentialIssuer>,
    /// Signaling for realtime sessions run over the WebSocket.
    pub signaling: Arc<dyn RealtimeSignaling>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn from_config(config: Config) -> Self {
        let realtime = Arc::new(OpenAiRealtime::new(config.openai.clone()));
        Self {
            signer: config.auth.secret.as_deref().map(SessionSigner::new),
            capabilities: Capabilities {
                transcriber: stt::create_transcriber(&config),
                generator: llm::create_reply_generator(&config),
                synthesizer: tts::create_synthesizer(&config),
            },
            local_voice: tts::create_local_synthesizer(&config),
            issuer: realtime.clone(),
            signaling: realtime,
            sessions: Arc::new(SessionRegistry::default()),
            config: Arc::new(config),
        }
    }

    /// The user named by a valid token in `headers`, if any.
    pub fn authenticate(&self, headers: &HeaderMap) -> Option<String> {
        let signer = self.signer.as_ref()?;
        let token = extract_token(headers, &self.config.auth.cookie_name)?;
        match signer.verify(&token, chrono::Utc::now().timestamp()) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::debug!(error = %e, "Rejected session token");
                None
            }
        }
    }
}

/// A request carrying a valid session token.
pub struct AuthUser(pub String);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        state
            .authenticate(&parts.headers)
            .map(AuthUser)
            .ok_or(ApiError::Unauthorized)
    }
}

pub fn router(state: AppState) -> Router {
    let max_body = state.config.server.max_body_bytes;
    let cors = state.config.server.cors;

    let app = Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/me", get(routes::me))
        .route("/api/voice/transcribe", post(routes::transcribe))
        .route("/api/voice/reply-text", post(routes::reply_text))
        .route("/api/voice/tts", post(routes::tts))
        .route("/api/tts", post(routes::tts))
        .route("/api/voice/realtime/session", post(routes::realtime_session))
        .route("/api/voice/ws", get(websocket::ws_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(TraceLayer::new_for_http());

    if cors { app.layer(CorsLayer::permissive()) } else { app }
}

/// Bind and serve until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let bind = config.server.bind.clone();
    if config.auth.secret.is_none() {
        warn!("auth.secret is not set; every protected route will answer 401");
    }

    let app = router(AppState::from_config(config));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::http::HeaderValue;
    use axum::http::header::COOKIE;

    #[test]
    fn bearer_and_cookie_tokens_authenticate() {
        let state = state(mock_capabilities());
        assert_eq!(state.authenticate(&bearer("ana")).as_deref(), Some("ana"));

        let token = SessionSigner::new(SECRET)
            .issue("ivan", chrono::Utc::now().timestamp() + 60)
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("theme=dark; voxroom-session={token}")).unwrap(),
        );
        assert_eq!(state.authenticate(&headers).as_deref(), Some("ivan"));
    }

    #[test]
    fn no_secret_means_nobody_is_authenticated() {
        let mut state = state(mock_capabilities());
        state.signer = None;
        assert!(state.authenticate(&bearer("ana")).is_none());
    }

    #[test]
    fn forged_token_is_rejected() {
        let state = state(mock_capabilities());
        let token = SessionSigner::new("other-secret")
            .issue("ana", chrono::Utc::now().timestamp() + 60)
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        assert!(state.authenticate(&headers).is_none());
    }
}
