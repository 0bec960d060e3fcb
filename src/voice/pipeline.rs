//! Turn pipeline: transcribe → generate → synthesize → play.
//!
//! Every stage is bounded by the stage timeout and may fail on its own. A
//! synthesis or playback failure goes through the fallback coordinator; any
//! other failure ends the turn with [`TurnOutcome::Failed`]. The caller owns
//! the turn permit and always gets an outcome back, so capture can resume.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capture::TurnInput;
use super::error::{ConversationError, Stage};
use super::fallback::{FallbackCoordinator, SynthesisRecovery};
use super::playback::{PlaybackQueue, PlaybackResult, PlaybackTicket};
use super::provider::{
    AudioSegment, ProviderError, ReplyGenerator, ReplyRequest, SpeechRequest, SpeechSynthesizer,
    Transcriber,
};
use super::state::{Language, StateHandle};
use crate::config::VoiceMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// The reply was delivered through a fallback path.
    Degraded(String),
    Failed(String),
    /// Nothing to say: empty transcript or empty reply.
    Skipped,
    /// The session stopped while the turn was in flight.
    Cancelled,
}

/// One finished exchange, for display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationTurn {
    pub user_text: String,
    pub assistant_text: String,
    pub language: Language,
    #[serde(skip)]
    pub audio_segments: Vec<AudioSegment>,
}

/// The remote capabilities a turn calls.
#[derive(Clone)]
pub struct Capabilities {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Audio queued for a reply and whether a fallback produced it.
struct Spoken {
    ticket: PlaybackTicket,
    audio: AudioSegment,
    degraded: Option<String>,
}

pub struct TurnPipeline {
    caps: Capabilities,
    playback: PlaybackQueue,
    fallback: FallbackCoordinator,
    state: StateHandle,
    voices: VoiceMap,
    stage_timeout: Duration,
    transcript_tx: Option<mpsc::UnboundedSender<ConversationTurn>>,
}

impl TurnPipeline {
    pub fn new(
        caps: Capabilities,
        playback: PlaybackQueue,
        fallback: FallbackCoordinator,
        state: StateHandle,
        voices: VoiceMap,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            caps,
            playback,
            fallback,
            state,
            voices,
            stage_timeout,
            transcript_tx: None,
        }
    }

    /// Emit every completed turn on `tx`.
    pub fn with_transcript(mut self, tx: mpsc::UnboundedSender<ConversationTurn>) -> Self {
        self.transcript_tx = Some(tx);
        self
    }

    pub fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }

    pub fn fallback(&self) -> &FallbackCoordinator {
        &self.fallback
    }

    async fn stage<T>(
        &self,
        stage: Stage,
        fut: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ConversationError> {
        match tokio::time::timeout(self.stage_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ConversationError::from_provider(stage, e)),
            Err(_) => Err(stage.timed_out()),
        }
    }

    fn failed(&self, err: ConversationError) -> TurnOutcome {
        error!(stage = err.stage(), error = %err, "Turn failed");
        TurnOutcome::Failed(err.to_string())
    }

    pub async fn process(
        &self,
        input: TurnInput,
        language: Language,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        // 1. Transcribe (recorded audio only)
        let (user_text, language) = match input {
            TurnInput::Text(text) => (text, language),
            TurnInput::Audio(audio) => {
                self.state.set_status_text("Transcribing...");
                let text = match self
                    .stage(Stage::Transcribe, self.caps.transcriber.transcribe(&audio))
                    .await
                {
                    Ok(text) => text,
                    Err(e) => return self.failed(e),
                };
                let detected = Language::detect_script(&text);
                let language = if detected.is_known() { detected } else { language };
                (text, language)
            }
        };
        let user_text = user_text.trim().to_string();
        if user_text.is_empty() {
            self.state.set_status_text("Didn't catch that");
            return TurnOutcome::Skipped;
        }
        if cancel.is_cancelled() {
            return TurnOutcome::Cancelled;
        }

        // 2. Generate reply
        info!(%language, text = %user_text, "User turn");
        self.state.set_status_text("Thinking...");
        let reply = match self
            .stage(
                Stage::Generate,
                self.caps.generator.generate(&ReplyRequest {
                    text: user_text.clone(),
                    language,
                }),
            )
            .await
        {
            Ok(reply) => reply.trim().to_string(),
            Err(e) => return self.failed(e),
        };
        if reply.is_empty() {
            self.state.set_status_text("No assistant response");
            return TurnOutcome::Skipped;
        }
        if cancel.is_cancelled() {
            return TurnOutcome::Cancelled;
        }

        // 3. Synthesize (with fallback) and 4. enqueue
        let spoken = match self.speak(&reply, language).await {
            Ok(spoken) => spoken,
            Err(e) => return self.failed(e),
        };
        if cancel.is_cancelled() {
            self.playback.clear();
            return TurnOutcome::Cancelled;
        }

        self.state.set_status_text("Speaking...");
        let result = tokio::select! {
            result = spoken.ticket.finished() => result,
            _ = cancel.cancelled() => return TurnOutcome::Cancelled,
        };

        let mut degraded = spoken.degraded;
        // Only audio that actually reached the listener.
        let played = match result {
            PlaybackResult::Played => spoken.audio,
            PlaybackResult::Aborted => return TurnOutcome::Cancelled,
            PlaybackResult::Failed(reason) => {
                match self.replay_locally(&reply, language, &reason, degraded.is_some(), cancel).await {
                    Ok(audio) => {
                        degraded = Some(format!("playback failed, used local voice: {reason}"));
                        audio
                    }
                    Err(outcome) => return outcome,
                }
            }
        };

        self.emit(ConversationTurn {
            user_text,
            assistant_text: reply,
            language,
            audio_segments: vec![played],
        });

        match degraded {
            Some(reason) => TurnOutcome::Degraded(reason),
            None => TurnOutcome::Completed,
        }
    }

    /// Synthesize `text` (falling back to the local voice) and queue it.
    async fn speak(&self, text: &str, language: Language) -> Result<Spoken, ConversationError> {
        self.state.set_status_text("Synthesizing speech...");
        self.state
            .set_language(language, self.voices.for_language(language));

        let request = SpeechRequest {
            text: text.to_string(),
            language,
        };
        let (audio, degraded) = match self
            .stage(Stage::Synthesize, self.caps.synthesizer.synthesize(&request))
            .await
        {
            Ok(audio) => (audio, None),
            Err(cause) => match self.fallback.recover_synthesis(&request, &cause).await {
                SynthesisRecovery::Recovered(audio) => (audio, Some(cause.to_string())),
                SynthesisRecovery::Exhausted(err) => return Err(err),
            },
        };

        let ticket = self.playback.enqueue(audio.clone());
        debug!(seq = ticket.seq, degraded = degraded.is_some(), "Reply queued");
        Ok(Spoken {
            ticket,
            audio,
            degraded,
        })
    }

    /// The sink refused the segment: try once more with the local voice,
    /// unless the segment already came from it.
    async fn replay_locally(
        &self,
        text: &str,
        language: Language,
        reason: &str,
        already_local: bool,
        cancel: &CancellationToken,
    ) -> Result<AudioSegment, TurnOutcome> {
        let cause = ConversationError::Playback(reason.to_string());
        if already_local {
            return Err(self.failed(cause));
        }
        warn!(error = %cause, "Playback failed, retrying with local voice");

        let request = SpeechRequest {
            text: text.to_string(),
            language,
        };
        let audio = match self.fallback.recover_synthesis(&request, &cause).await {
            SynthesisRecovery::Recovered(audio) => audio,
            SynthesisRecovery::Exhausted(err) => return Err(self.failed(err)),
        };

        let ticket = self.playback.enqueue(audio.clone());
        let result = tokio::select! {
            result = ticket.finished() => result,
            _ = cancel.cancelled() => return Err(TurnOutcome::Cancelled),
        };
        match result {
            PlaybackResult::Played => Ok(audio),
            PlaybackResult::Aborted => Err(TurnOutcome::Cancelled),
            PlaybackResult::Failed(again) => {
                Err(self.failed(ConversationError::Playback(again)))
            }
        }
    }

    /// Speak an assistant reply produced elsewhere (the realtime channel)
    /// without waiting for playback.
    pub async fn voice_reply(&self, text: &str, language: Language) -> Result<(), ConversationError> {
        let spoken = self.speak(text, language).await?;
        if let Some(reason) = spoken.degraded {
            self.state.note_error(format!("Using local voice: {reason}"));
        }
        Ok(())
    }

    fn emit(&self, turn: ConversationTurn) {
        if let Some(tx) = &self.transcript_tx {
            let _ = tx.send(turn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConversationConfig;
    use crate::voice::provider::RecordedAudio;
    use crate::voice::provider::llm::mock::{MockReply, MockReplyGenerator};
    use crate::voice::provider::stt::mock::MockTranscriber;
    use crate::voice::provider::tts::mock::MockSynthesizer;
    use crate::voice::sink::RecordingSink;
    use crate::voice::state::ConversationState;

    struct Harness {
        pipeline: TurnPipeline,
        sink: Arc<RecordingSink>,
        synth: Arc<MockSynthesizer>,
        local: Arc<MockSynthesizer>,
        transcript: mpsc::UnboundedReceiver<ConversationTurn>,
    }

    fn harness(
        transcriber: MockTranscriber,
        generator: MockReplyGenerator,
        synth: MockSynthesizer,
        sink: RecordingSink,
    ) -> Harness {
        let state = StateHandle::new(ConversationState::new(Language::En, "EN"));
        let sink = Arc::new(sink);
        let synth = Arc::new(synth);
        let local = Arc::new(MockSynthesizer::working("local"));
        let (tx, transcript) = mpsc::unbounded_channel();
        let pipeline = TurnPipeline::new(
            Capabilities {
                transcriber: Arc::new(transcriber),
                generator: Arc::new(generator),
                synthesizer: synth.clone(),
            },
            PlaybackQueue::new(sink.clone()),
            FallbackCoordinator::new(Some(local.clone()), state.clone(), Duration::from_secs(5)),
            state,
            ConversationConfig::default().voices,
            Duration::from_secs(5),
        )
        .with_transcript(tx);
        Harness {
            pipeline,
            sink,
            synth,
            local,
            transcript,
        }
    }

    fn text(t: &str) -> TurnInput {
        TurnInput::Text(t.to_string())
    }

    #[tokio::test]
    async fn happy_path_plays_one_segment() {
        let mut h = harness(
            MockTranscriber::new(vec![]),
            MockReplyGenerator::fixed("Hi there"),
            MockSynthesizer::working("el"),
            RecordingSink::new(),
        );
        let outcome = h
            .pipeline
            .process(text("Hello"), Language::En, &CancellationToken::new())
            .await;
        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(h.sink.played_texts(), vec!["el:Hi there"]);

        let turn = h.transcript.try_recv().unwrap();
        assert_eq!(turn.user_text, "Hello");
        assert_eq!(turn.assistant_text, "Hi there");
        assert_eq!(turn.audio_segments.len(), 1);
    }

    #[tokio::test]
    async fn synthesis_error_degrades_to_local_voice() {
        let h = harness(
            MockTranscriber::new(vec![]),
            MockReplyGenerator::fixed("Hi there"),
            MockSynthesizer::failing(500),
            RecordingSink::new(),
        );
        let outcome = h
            .pipeline
            .process(text("Hello"), Language::En, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, TurnOutcome::Degraded(_)));
        assert_eq!(h.sink.played_texts(), vec!["local:Hi there"]);
        assert_eq!(h.local.calls(), 1);
    }

    #[tokio::test]
    async fn generation_error_fails_turn() {
        let h = harness(
            MockTranscriber::new(vec![]),
            MockReplyGenerator::new(MockReply::Fail {
                status: 502,
                body: "bad gateway".into(),
            }),
            MockSynthesizer::working("el"),
            RecordingSink::new(),
        );
        let outcome = h
            .pipeline
            .process(text("Hello"), Language::En, &CancellationToken::new())
            .await;
        let TurnOutcome::Failed(reason) = outcome else {
            panic!("expected Failed");
        };
        assert!(reason.contains("reply generation failed"));
        assert_eq!(h.synth.calls(), 0);
    }

    #[tokio::test]
    async fn empty_transcript_skips_turn() {
        let h = harness(
            MockTranscriber::fixed("   "),
            MockReplyGenerator::fixed("unused"),
            MockSynthesizer::working("el"),
            RecordingSink::new(),
        );
        let clip = RecordedAudio::new(vec![0u8; 4], "a.webm", "audio/webm");
        let outcome = h
            .pipeline
            .process(TurnInput::Audio(clip), Language::En, &CancellationToken::new())
            .await;
        assert_eq!(outcome, TurnOutcome::Skipped);
        assert_eq!(h.synth.calls(), 0);
    }

    #[tokio::test]
    async fn transcript_language_overrides_hint() {
        let h = harness(
            MockTranscriber::fixed("Привет"),
            MockReplyGenerator::echo(),
            MockSynthesizer::working("el"),
            RecordingSink::new(),
        );
        let clip = RecordedAudio::new(vec![0u8; 4], "a.webm", "audio/webm");
        h.pipeline
            .process(TurnInput::Audio(clip), Language::En, &CancellationToken::new())
            .await;
        assert_eq!(h.synth.requests()[0].language, Language::Ru);
    }

    #[tokio::test]
    async fn playback_failure_retries_with_local_voice() {
        let mut h = harness(
            MockTranscriber::new(vec![]),
            MockReplyGenerator::fixed("Hi there"),
            MockSynthesizer::working("el"),
            RecordingSink::new().failing_on("el:Hi there"),
        );
        let outcome = h
            .pipeline
            .process(text("Hello"), Language::En, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, TurnOutcome::Degraded(ref r) if r.contains("playback failed")));
        assert_eq!(h.sink.played_texts(), vec!["local:Hi there"]);

        let turn = h.transcript.try_recv().unwrap();
        assert_eq!(turn.audio_segments.len(), 1);
        assert_eq!(&turn.audio_segments[0].bytes[..], b"local:Hi there");
    }

    #[tokio::test]
    async fn playback_that_never_finishes_fails_the_turn() {
        let state = StateHandle::new(ConversationState::new(Language::En, "EN"));
        let sink = Arc::new(RecordingSink::new().with_delay(Duration::from_secs(3600)));
        let local = Arc::new(MockSynthesizer::working("local"));
        let pipeline = TurnPipeline::new(
            Capabilities {
                transcriber: Arc::new(MockTranscriber::new(vec![])),
                generator: Arc::new(MockReplyGenerator::fixed("Hi there")),
                synthesizer: Arc::new(MockSynthesizer::working("el")),
            },
            PlaybackQueue::new(sink.clone()).with_play_timeout(Duration::from_millis(40)),
            FallbackCoordinator::new(Some(local.clone()), state.clone(), Duration::from_secs(5)),
            state,
            ConversationConfig::default().voices,
            Duration::from_secs(5),
        );

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.process(text("Hello"), Language::En, &CancellationToken::new()),
        )
        .await
        .expect("turn must end");
        let TurnOutcome::Failed(reason) = outcome else {
            panic!("expected Failed, got {outcome:?}");
        };
        assert!(reason.contains("timed out"));
        // The local voice was tried once and stalled too.
        assert_eq!(local.calls(), 1);
        assert!(sink.played().is_empty());
        assert!(!pipeline.playback().is_playing());
    }

    #[tokio::test]
    async fn cancelled_before_generation() {
        let h = harness(
            MockTranscriber::new(vec![]),
            MockReplyGenerator::fixed("Hi"),
            MockSynthesizer::working("el"),
            RecordingSink::new(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            h.pipeline.process(text("Hello"), Language::En, &cancel).await,
            TurnOutcome::Cancelled
        );
        assert!(h.sink.played().is_empty());
    }

    #[tokio::test]
    async fn slow_stage_times_out() {
        let state = StateHandle::new(ConversationState::new(Language::En, "EN"));
        let pipeline = TurnPipeline::new(
            Capabilities {
                transcriber: Arc::new(MockTranscriber::new(vec![])),
                generator: Arc::new(
                    MockReplyGenerator::fixed("late").with_latency(Duration::from_secs(30)),
                ),
                synthesizer: Arc::new(MockSynthesizer::working("el")),
            },
            PlaybackQueue::new(Arc::new(RecordingSink::new())),
            FallbackCoordinator::new(None, state.clone(), Duration::from_secs(5)),
            state,
            ConversationConfig::default().voices,
            Duration::from_millis(50),
        );
        let outcome = pipeline
            .process(text("Hello"), Language::En, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            TurnOutcome::Failed("reply generation failed: timed out".into())
        );
    }
}
