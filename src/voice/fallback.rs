//! Degraded paths when a preferred step fails, and the guarantee that a
//! turn always hands its permit back.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::error::{ConversationError, Stage};
use super::pipeline::TurnOutcome;
use super::provider::{AudioSegment, SpeechRequest, SpeechSynthesizer};
use super::state::{ConnectionStatus, StateHandle};
use crate::concurrency::TurnPermit;

#[derive(Debug)]
pub enum SynthesisRecovery {
    /// Local voice produced audio for the same text.
    Recovered(AudioSegment),
    /// No local voice, or it failed too.
    Exhausted(ConversationError),
}

pub struct FallbackCoordinator {
    local: Option<Arc<dyn SpeechSynthesizer>>,
    state: StateHandle,
    timeout: Duration,
}

impl FallbackCoordinator {
    pub fn new(
        local: Option<Arc<dyn SpeechSynthesizer>>,
        state: StateHandle,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            state,
            timeout,
        }
    }

    pub fn has_local_voice(&self) -> bool {
        self.local.is_some()
    }

    /// Speak `request` with the on-device voice after `cause` made the
    /// preferred path unusable.
    pub async fn recover_synthesis(
        &self,
        request: &SpeechRequest,
        cause: &ConversationError,
    ) -> SynthesisRecovery {
        let Some(local) = &self.local else {
            warn!(error = %cause, "No local voice configured");
            return SynthesisRecovery::Exhausted(cause.clone());
        };

        warn!(error = %cause, fallback = local.name(), "Falling back to local voice");
        self.state.set_status_text("Voice service unavailable, using local voice...");

        match tokio::time::timeout(self.timeout, local.synthesize(request)).await {
            Ok(Ok(audio)) => SynthesisRecovery::Recovered(audio),
            Ok(Err(e)) => {
                error!(error = %e, "Local voice failed");
                SynthesisRecovery::Exhausted(ConversationError::Synthesis(format!(
                    "{}; local voice: {}",
                    cause_reason(cause),
                    e.user_message()
                )))
            }
            Err(_) => SynthesisRecovery::Exhausted(Stage::Synthesize.timed_out()),
        }
    }

    /// Realtime negotiation failed: report it and stay disconnected. No
    /// automatic retry; the user reconnects explicitly.
    pub fn negotiation_failed(&self, err: &ConversationError) {
        error!(stage = err.stage(), error = %err, "Realtime connection failed");
        self.state
            .fail(ConnectionStatus::Disconnected, err.to_string());
    }
}

fn cause_reason(cause: &ConversationError) -> String {
    match cause {
        ConversationError::Synthesis(reason) => reason.clone(),
        other => other.to_string(),
    }
}

type Notify = Box<dyn FnOnce(TurnOutcome) + Send>;

/// Carries a turn's permit and its completion signal.
///
/// [`TurnCompletion::complete`] releases the permit and reports the outcome.
/// If the guard is dropped without completing (the turn task panicked or
/// was aborted) it still releases the permit and reports a failure.
pub struct TurnCompletion {
    permit: Option<TurnPermit>,
    notify: Option<Notify>,
}

impl TurnCompletion {
    pub fn new(permit: TurnPermit, notify: impl FnOnce(TurnOutcome) + Send + 'static) -> Self {
        Self {
            permit: Some(permit),
            notify: Some(Box::new(notify)),
        }
    }

    pub fn complete(mut self, outcome: TurnOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: TurnOutcome) {
        drop(self.permit.take());
        if let Some(notify) = self.notify.take() {
            notify(outcome);
        }
    }
}

impl Drop for TurnCompletion {
    fn drop(&mut self) {
        if self.notify.is_some() {
            info!("Turn ended without an outcome, releasing capture");
            self.finish(TurnOutcome::Failed("turn aborted".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::TurnGate;
    use crate::voice::provider::tts::mock::MockSynthesizer;
    use crate::voice::state::{ConversationState, Language};
    use std::sync::Mutex;

    fn state() -> StateHandle {
        StateHandle::new(ConversationState::new(Language::En, "EN"))
    }

    fn request() -> SpeechRequest {
        SpeechRequest {
            text: "Hi there".into(),
            language: Language::En,
        }
    }

    #[tokio::test]
    async fn local_voice_recovers() {
        let local = Arc::new(MockSynthesizer::working("local"));
        let fallback = FallbackCoordinator::new(Some(local.clone()), state(), Duration::from_secs(5));
        let cause = ConversationError::Synthesis("upstream returned 500".into());

        match fallback.recover_synthesis(&request(), &cause).await {
            SynthesisRecovery::Recovered(audio) => assert_eq!(&audio.bytes[..], b"local:Hi there"),
            other => panic!("expected Recovered, got {other:?}"),
        }
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_without_local_voice() {
        let fallback = FallbackCoordinator::new(None, state(), Duration::from_secs(5));
        let cause = ConversationError::Synthesis("down".into());
        assert!(matches!(
            fallback.recover_synthesis(&request(), &cause).await,
            SynthesisRecovery::Exhausted(ConversationError::Synthesis(ref r)) if r == "down"
        ));
    }

    #[tokio::test]
    async fn exhausted_when_local_fails() {
        let local = Arc::new(MockSynthesizer::failing(500));
        let fallback = FallbackCoordinator::new(Some(local), state(), Duration::from_secs(5));
        let cause = ConversationError::Synthesis("down".into());
        let SynthesisRecovery::Exhausted(err) = fallback.recover_synthesis(&request(), &cause).await else {
            panic!("expected Exhausted");
        };
        assert!(err.to_string().contains("local voice"));
    }

    #[test]
    fn negotiation_failure_leaves_disconnected_with_message() {
        let state = state();
        let fallback = FallbackCoordinator::new(None, state.clone(), Duration::from_secs(5));
        fallback.negotiation_failed(&ConversationError::Negotiation("SDP exchange failed".into()));
        let snap = state.snapshot();
        assert_eq!(snap.connection_status, ConnectionStatus::Disconnected);
        assert!(snap.last_error_message.unwrap().contains("SDP exchange failed"));
    }

    #[tokio::test]
    async fn completion_releases_permit_and_reports() {
        let gate = TurnGate::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let completion = TurnCompletion::new(gate.try_acquire().unwrap(), move |o| {
            *sink.lock().unwrap() = Some(o);
        });
        assert!(gate.is_busy());

        completion.complete(TurnOutcome::Completed);
        assert!(!gate.is_busy());
        assert_eq!(*seen.lock().unwrap(), Some(TurnOutcome::Completed));
    }

    #[tokio::test]
    async fn dropped_completion_still_releases() {
        let gate = TurnGate::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let completion = TurnCompletion::new(gate.try_acquire().unwrap(), move |o| {
            *sink.lock().unwrap() = Some(o);
        });

        let task = tokio::spawn(async move {
            let _completion = completion;
            panic!("turn task crashed");
        });
        assert!(task.await.is_err());

        assert!(!gate.is_busy());
        assert!(matches!(*seen.lock().unwrap(), Some(TurnOutcome::Failed(_))));
    }
}
