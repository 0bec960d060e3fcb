//! Voice conversation core
//!
//! A session listens (capture), stabilizes the spoken language, runs one
//! turn at a time through transcribe → reply → speak, and plays replies in
//! order. The realtime transport is the low-latency alternative to the
//! chained HTTP calls; the fallback coordinator covers both.

pub mod capture;
pub mod error;
pub mod events;
pub mod fallback;
pub mod language;
pub mod pipeline;
pub mod playback;
pub mod provider;
pub mod realtime;
pub mod recognizer;
pub mod session;
pub mod sink;
pub mod state;


pub use capture::{CaptureController, Recognizer, Utterance};
pub use error::ConversationError;
pub use pipeline::{Capabilities, ConversationTurn, TurnOutcome, TurnPipeline};
pub use playback::{AudioSink, PlaybackQueue};
pub use realtime::{RealtimeOptions, RealtimeSession};
pub use session::{ConversationSession, SessionEvent, SessionHandle};
pub use state::{ConnectionStatus, ConversationState, Language, StateHandle};

use std::sync::Arc;

use crate::auth::AuthCheck;
use crate::concurrency::TurnGate;
use crate::config::Config;
use fallback::FallbackCoordinator;
use language::LanguageStabilizer;
use provider::realtime::{MediaDevices, RealtimeSignaling};

/// Collaborators for the realtime transport.
pub struct RealtimeParts {
    pub media: Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn RealtimeSignaling>,
}

/// Everything a session needs besides its recognizer. With `realtime` set
/// the session streams over a peer connection instead of running chained
/// turns from recognized speech.
pub struct SessionParts {
    pub capabilities: Capabilities,
    pub local_voice: Option<Arc<dyn provider::SpeechSynthesizer>>,
    pub sink: Arc<dyn AudioSink>,
    pub auth: Arc<dyn AuthCheck>,
    pub realtime: Option<RealtimeParts>,
}

/// Wire a conversation session from config.
pub fn build_session<R: Recognizer + 'static>(
    config: &Config,
    recognizer: R,
    parts: SessionParts,
    transcript: Option<tokio::sync::mpsc::UnboundedSender<ConversationTurn>>,
) -> (ConversationSession<R>, SessionHandle) {
    let conversation = &config.conversation;
    let language = config.default_language();
    let voices = if parts.realtime.is_some() {
        &conversation.realtime_voices
    } else {
        &conversation.voices
    };
    let state = StateHandle::new(ConversationState::new(
        language,
        voices.for_language(language),
    ));

    let mut pipeline = TurnPipeline::new(
        parts.capabilities,
        PlaybackQueue::new(parts.sink).with_play_timeout(config.playback_timeout()),
        FallbackCoordinator::new(parts.local_voice, state.clone(), config.stage_timeout()),
        state.clone(),
        conversation.voices.clone(),
        config.stage_timeout(),
    );
    if let Some(tx) = transcript {
        pipeline = pipeline.with_transcript(tx);
    }
    let pipeline = Arc::new(pipeline);

    let capture = CaptureController::new(
        recognizer,
        LanguageStabilizer::new(conversation.history_capacity, language),
        TurnGate::new(),
        config.settle_delay(),
    );

    let (session, handle) = ConversationSession::new(
        capture,
        pipeline.clone(),
        parts.auth,
        state.clone(),
        conversation.voices.clone(),
    );
    let Some(realtime) = parts.realtime else {
        return (session, handle);
    };

    let realtime = RealtimeSession::new(
        realtime.media,
        realtime.signaling,
        pipeline,
        state,
        RealtimeOptions {
            instructions: conversation.realtime_instructions.clone(),
            voices: conversation.realtime_voices.clone(),
            language,
            history_capacity: conversation.history_capacity,
            timeout: config.stage_timeout(),
        },
    );
    (session.with_realtime(realtime), handle)
}
