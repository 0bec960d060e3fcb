//! One conversation session: the event loop that ties capture, the turn
//! pipeline and connection state together.
//!
//! Recognizer callbacks, recorded clips, turn completions and stop requests
//! all arrive as [`SessionEvent`]s on one channel and are handled in order.
//! Turns run as spawned tasks; their completion comes back through the same
//! channel, so capture state is only ever touched by the loop.
//!
//! A session built with a [`RealtimeSession`] streams over the peer
//! connection instead and never starts capture. A failed negotiation leaves
//! it `Disconnected` with the reason shown until a [`SessionEvent::Reconnect`].

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capture::{
    CaptureAction, CaptureController, CaptureState, Recognizer, TurnTicket, Utterance,
};
use super::error::ConversationError;
use super::fallback::TurnCompletion;
use super::pipeline::{TurnOutcome, TurnPipeline};
use super::provider::RecordedAudio;
use super::realtime::RealtimeSession;
use super::state::{ConnectionStatus, ConversationState, StateHandle};
use crate::auth::AuthCheck;
use crate::config::VoiceMap;

#[derive(Debug)]
pub enum SessionEvent {
    Utterance(Utterance),
    /// The recognizer stopped on its own.
    RecognizerEnded { generation: u64 },
    RecognizerFailed(String),
    Audio(RecordedAudio),
    TurnFinished { turn_id: u64, outcome: TurnOutcome },
    /// User-requested retry after a failed connection or capture restart.
    Reconnect,
    Stop,
}

/// Feeds a running session and watches its state.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<ConversationState>,
}

impl SessionHandle {
    /// Returns false once the session has ended.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn utterance(&self, text: &str, is_final: bool) -> bool {
        self.send(SessionEvent::Utterance(Utterance::new(text, is_final)))
    }

    pub fn stop(&self) {
        let _ = self.tx.send(SessionEvent::Stop);
    }

    pub fn state(&self) -> ConversationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct ConversationSession<R> {
    capture: CaptureController<R>,
    realtime: Option<RealtimeSession>,
    pipeline: Arc<TurnPipeline>,
    auth: Arc<dyn AuthCheck>,
    state: StateHandle,
    voices: VoiceMap,
    cancel: CancellationToken,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    // Weak, so dropping every handle ends the loop.
    completions: mpsc::WeakUnboundedSender<SessionEvent>,
    active_turn: Option<u64>,
    next_turn: u64,
}

impl<R: Recognizer + 'static> ConversationSession<R> {
    pub fn new(
        capture: CaptureController<R>,
        pipeline: Arc<TurnPipeline>,
        auth: Arc<dyn AuthCheck>,
        state: StateHandle,
        voices: VoiceMap,
    ) -> (Self, SessionHandle) {
        let (tx, events) = mpsc::unbounded_channel();
        let session = Self {
            capture,
            realtime: None,
            pipeline,
            auth,
            state: state.clone(),
            voices,
            cancel: CancellationToken::new(),
            events,
            completions: tx.downgrade(),
            active_turn: None,
            next_turn: 1,
        };
        let handle = SessionHandle {
            tx,
            state: state.subscribe(),
        };
        (session, handle)
    }

    /// Stream through `realtime` instead of chained turns.
    pub fn with_realtime(mut self, realtime: RealtimeSession) -> Self {
        self.realtime = Some(realtime);
        self
    }

    /// Connect, then handle events until stopped or every handle is gone.
    pub async fn run(mut self) -> Result<(), ConversationError> {
        self.connect().await?;

        while let Some(event) = self.events.recv().await {
            if !self.handle(event).await {
                break;
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), ConversationError> {
        self.state
            .transition(ConnectionStatus::Connecting, "Connecting...");
        if !self.auth.is_authenticated().await {
            self.state
                .fail(ConnectionStatus::Disconnected, "Please sign in to talk");
            return Err(ConversationError::Unauthenticated);
        }

        if let Some(realtime) = &mut self.realtime {
            // The failure is already on the status line.
            if let Err(e) = realtime.connect().await {
                warn!(error = %e, "Realtime transport not connected");
            }
            return Ok(());
        }

        self.state.transition(ConnectionStatus::Connected, "Connected");

        if let Err(e) = self.capture.start().await {
            warn!(error = %e, "Capture failed to start");
            self.state.fail(ConnectionStatus::Error, e.to_string());
            return Err(e);
        }
        self.state.transition(ConnectionStatus::Ready, "Listening");
        info!(language = %self.capture.language(), "Conversation session ready");
        Ok(())
    }

    /// Returns false when the loop should end.
    async fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Utterance(utterance) => {
                let action = self.capture.on_utterance(utterance).await;
                self.apply(action);
            }
            SessionEvent::Audio(clip) => {
                let action = self.capture.on_recorded_audio(clip).await;
                self.apply(action);
            }
            SessionEvent::RecognizerEnded { generation } => {
                if let Err(e) = self.capture.on_recognizer_ended(generation).await {
                    self.state.fail(ConnectionStatus::Error, e.to_string());
                }
            }
            SessionEvent::RecognizerFailed(message) => {
                warn!(%message, "Recognizer error");
                self.state.note_error(format!("Recognizer error: {message}"));
            }
            SessionEvent::TurnFinished { turn_id, outcome } => {
                self.finish_turn(turn_id, outcome).await;
            }
            SessionEvent::Reconnect => self.reconnect().await,
            SessionEvent::Stop => return false,
        }
        true
    }

    async fn reconnect(&mut self) {
        if let Some(realtime) = &mut self.realtime {
            if let Err(e) = realtime.connect().await {
                warn!(error = %e, "Realtime reconnect failed");
            }
            return;
        }
        if self.active_turn.is_some() || self.capture.state() != CaptureState::Idle {
            debug!("Reconnect ignored: capture is running");
            return;
        }
        match self.capture.start().await {
            Ok(()) => {
                self.state.transition(ConnectionStatus::Ready, "Listening");
                info!(language = %self.capture.language(), "Capture restarted");
            }
            Err(e) => self.state.fail(ConnectionStatus::Error, e.to_string()),
        }
    }

    fn apply(&mut self, action: CaptureAction) {
        match action {
            CaptureAction::Accepted(ticket) => self.begin_turn(ticket),
            CaptureAction::LanguageSwitched { from, to } => {
                debug!(%from, %to, "Stabilized language changed");
                self.state.set_language(to, self.voices.for_language(to));
            }
            CaptureAction::RestartFailed { to, error } => {
                self.state.set_language(to, self.voices.for_language(to));
                self.state.fail(ConnectionStatus::Error, error.to_string());
            }
            CaptureAction::Dropped => debug!("Input dropped while a turn is in flight"),
            CaptureAction::Ignored => {}
        }
    }

    fn begin_turn(&mut self, ticket: TurnTicket) {
        let TurnTicket {
            input,
            language,
            permit,
        } = ticket;
        let turn_id = self.next_turn;
        self.next_turn += 1;
        self.active_turn = Some(turn_id);
        self.state.transition(ConnectionStatus::Busy, "Processing...");

        let completions = self.completions.clone();
        let completion = TurnCompletion::new(permit, move |outcome| {
            if let Some(tx) = completions.upgrade() {
                let _ = tx.send(SessionEvent::TurnFinished { turn_id, outcome });
            }
        });

        let pipeline = self.pipeline.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let outcome = pipeline.process(input, language, &cancel).await;
            completion.complete(outcome);
        });
    }

    async fn finish_turn(&mut self, turn_id: u64, outcome: TurnOutcome) {
        if self.active_turn != Some(turn_id) {
            debug!(turn_id, "Stale turn completion ignored");
            return;
        }
        self.active_turn = None;
        info!(turn_id, ?outcome, "Turn finished");

        match self.capture.resume().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.state.fail(ConnectionStatus::Error, e.to_string());
                return;
            }
        }

        match outcome {
            TurnOutcome::Completed | TurnOutcome::Skipped | TurnOutcome::Cancelled => {
                self.state.transition(ConnectionStatus::Ready, "Listening");
            }
            TurnOutcome::Degraded(reason) => {
                self.state.transition_with_error(
                    ConnectionStatus::Ready,
                    "Listening (local voice)",
                    reason,
                );
            }
            TurnOutcome::Failed(reason) => {
                self.state
                    .transition_with_error(ConnectionStatus::Ready, "Listening", reason);
            }
        }
    }

    /// Cancel the turn in flight, drop queued audio and release capture.
    /// A late turn completion is never acted on after this.
    async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.active_turn = None;
        let aborted = self.pipeline.playback().clear();
        self.capture.stop().await;
        if let Some(realtime) = &mut self.realtime {
            realtime.disconnect().await;
        }
        self.state
            .transition(ConnectionStatus::Disconnected, "Disconnected");
        info!(aborted, "Conversation session stopped");
    }
}
