//! Capture controller: recognizer lifecycle and the one-turn-at-a-time rule.
//!
//! States: `Idle → Listening ⇄ Suspended → Idle`. A final utterance heard
//! while `Listening` takes the session's [`TurnGate`] permit, stops the
//! recognizer and moves to `Suspended` until [`CaptureController::resume`].
//! Finals heard while suspended are dropped, not queued.
//!
//! Each recognizer start gets a fresh generation number. End-of-stream
//! notifications carry the generation they belong to, so a stale one (from
//! a recognizer we stopped ourselves) never triggers a restart.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::error::ConversationError;
use super::language::LanguageStabilizer;
use super::provider::RecordedAudio;
use super::state::Language;
use crate::concurrency::{TurnGate, TurnPermit};

/// Continuous speech recognizer (browser, remote client, console).
#[async_trait]
pub trait Recognizer: Send {
    /// Begin continuous recognition in `locale`. Fails if the microphone is
    /// unavailable or permission is denied.
    async fn start(&mut self, locale: &str, generation: u64) -> anyhow::Result<()>;

    async fn stop(&mut self);
}

/// One recognition result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    pub is_final: bool,
    pub detected_language: Language,
}

impl Utterance {
    /// Build from recognizer text, detecting the language from the script.
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        let text = text.into().trim().to_string();
        let detected_language = Language::detect_script(&text);
        Self {
            text,
            is_final,
            detected_language,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Listening,
    Suspended,
}

/// What a turn starts from.
#[derive(Debug, Clone)]
pub enum TurnInput {
    Text(String),
    Audio(RecordedAudio),
}

/// An accepted turn. Holding it means capture is suspended; dropping the
/// permit lets the next turn in.
#[derive(Debug)]
pub struct TurnTicket {
    pub input: TurnInput,
    pub language: Language,
    pub permit: TurnPermit,
}

#[derive(Debug)]
pub enum CaptureAction {
    Ignored,
    /// The recognizer was restarted with a new locale; the utterance that
    /// triggered the switch is consumed.
    LanguageSwitched { from: Language, to: Language },
    /// A final arrived while a turn was in flight.
    Dropped,
    Accepted(TurnTicket),
    /// The language switched but the recognizer would not start again in
    /// the new locale. Capture is `Idle`.
    RestartFailed {
        to: Language,
        error: ConversationError,
    },
}

pub struct CaptureController<R> {
    recognizer: R,
    state: CaptureState,
    stabilizer: LanguageStabilizer,
    gate: TurnGate,
    generation: u64,
    settle_delay: Duration,
}

impl<R: Recognizer> CaptureController<R> {
    pub fn new(
        recognizer: R,
        stabilizer: LanguageStabilizer,
        gate: TurnGate,
        settle_delay: Duration,
    ) -> Self {
        Self {
            recognizer,
            state: CaptureState::Idle,
            stabilizer,
            gate,
            generation: 0,
            settle_delay,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn language(&self) -> Language {
        self.stabilizer.current()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn recognizer(&self) -> &R {
        &self.recognizer
    }

    async fn start_recognizer(&mut self) -> Result<(), ConversationError> {
        self.generation += 1;
        let locale = self.language().locale();
        match self.recognizer.start(locale, self.generation).await {
            Ok(()) => {
                self.state = CaptureState::Listening;
                debug!(locale, generation = self.generation, "Recognizer started");
                Ok(())
            }
            Err(e) => {
                self.state = CaptureState::Idle;
                Err(ConversationError::Device(e.to_string()))
            }
        }
    }

    /// `Idle → Listening`. A no-op in any other state.
    pub async fn start(&mut self) -> Result<(), ConversationError> {
        if self.state != CaptureState::Idle {
            return Ok(());
        }
        self.start_recognizer().await
    }

    /// Release the recognizer. Legal from every state.
    pub async fn stop(&mut self) {
        if self.state != CaptureState::Idle {
            self.recognizer.stop().await;
        }
        self.state = CaptureState::Idle;
        // Late end-of-stream events from the stopped recognizer are stale.
        self.generation += 1;
    }

    pub async fn on_utterance(&mut self, utterance: Utterance) -> CaptureAction {
        if utterance.text.is_empty() {
            return CaptureAction::Ignored;
        }
        match self.state {
            CaptureState::Idle => return CaptureAction::Ignored,
            CaptureState::Suspended => {
                if utterance.is_final {
                    debug!(text = %utterance.text, "Final utterance dropped: turn in flight");
                    return CaptureAction::Dropped;
                }
                return CaptureAction::Ignored;
            }
            CaptureState::Listening => {}
        }

        let stable = self.stabilizer.observe(utterance.detected_language);
        if stable.switched {
            info!(from = %stable.previous, to = %stable.language, "Language switched, restarting recognizer");
            if let Err(error) = self.restart_for_language().await {
                warn!(%error, locale = stable.language.locale(), "Recognizer restart after language switch failed");
                return CaptureAction::RestartFailed {
                    to: stable.language,
                    error,
                };
            }
            return CaptureAction::LanguageSwitched {
                from: stable.previous,
                to: stable.language,
            };
        }

        if !utterance.is_final {
            return CaptureAction::Ignored;
        }
        self.begin_turn(TurnInput::Text(utterance.text)).await
    }

    /// Start a turn from a recorded clip instead of recognized text.
    pub async fn on_recorded_audio(&mut self, audio: RecordedAudio) -> CaptureAction {
        match self.state {
            CaptureState::Idle => CaptureAction::Ignored,
            CaptureState::Suspended => CaptureAction::Dropped,
            CaptureState::Listening => self.begin_turn(TurnInput::Audio(audio)).await,
        }
    }

    async fn begin_turn(&mut self, input: TurnInput) -> CaptureAction {
        let Some(permit) = self.gate.try_acquire() else {
            debug!("Turn gate busy, dropping input");
            return CaptureAction::Dropped;
        };
        // Do not hear our own reply.
        self.recognizer.stop().await;
        self.state = CaptureState::Suspended;
        CaptureAction::Accepted(TurnTicket {
            input,
            language: self.language(),
            permit,
        })
    }

    /// Stop, let the recognizer settle, then start again in the new locale.
    async fn restart_for_language(&mut self) -> Result<(), ConversationError> {
        self.recognizer.stop().await;
        tokio::time::sleep(self.settle_delay).await;
        if self.state != CaptureState::Listening {
            return Ok(());
        }
        self.start_recognizer().await
    }

    /// The recognizer stopped on its own. Restart it if we still expect to
    /// be listening and the notification is for the current generation.
    pub async fn on_recognizer_ended(&mut self, generation: u64) -> Result<bool, ConversationError> {
        if self.state != CaptureState::Listening || generation != self.generation {
            debug!(generation, current = self.generation, state = ?self.state, "Ignoring recognizer end");
            return Ok(false);
        }
        debug!(generation, "Recognizer ended unexpectedly, restarting");
        self.start_recognizer().await.map(|()| true)
    }

    /// `Suspended → Listening` once a turn has finished. Returns whether the
    /// recognizer was restarted.
    pub async fn resume(&mut self) -> Result<bool, ConversationError> {
        if self.state != CaptureState::Suspended {
            return Ok(false);
        }
        self.start_recognizer().await.map(|()| true)
    }
}
