//! Realtime transport session.
//!
//! `connect` acquires the microphone, builds a peer connection with a
//! control data channel, exchanges SDP with the remote model endpoint using
//! an ephemeral credential and starts the control loop. Every failure on
//! the way releases what was acquired so far and leaves the session
//! `Disconnected`; there is no automatic retry.
//!
//! The control loop decodes side-channel events, re-sends `session.update`
//! when the assistant's language changes, and hands each finished reply to
//! the chained synthesizer for playback.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::{ConversationError, Stage};
use super::events::{ControlEvent, decode_control_event, session_update};
use super::language::LanguageStabilizer;
use super::pipeline::TurnPipeline;
use super::provider::realtime::{
    ChannelEvent, DataChannel, EphemeralCredential, LocalAudioTrack, MediaDevices,
    PeerConnection, RealtimeSignaling,
};
use super::state::{ConnectionStatus, Language, StateHandle};
use crate::config::VoiceMap;

pub const CONTROL_CHANNEL_LABEL: &str = "oai-events";

struct Link {
    peer: Box<dyn PeerConnection>,
    mic: Box<dyn LocalAudioTrack>,
    credential: EphemeralCredential,
}

type SharedLink = Arc<Mutex<Option<Link>>>;

/// Close the peer and stop the microphone, once.
async fn release(link: &SharedLink) -> bool {
    let taken = link.lock().await.take();
    match taken {
        Some(mut link) => {
            link.peer.close().await;
            link.mic.stop();
            true
        }
        None => false,
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub instructions: String,
    pub voices: VoiceMap,
    pub language: Language,
    pub history_capacity: usize,
    pub timeout: Duration,
}

pub struct RealtimeSession {
    media: Arc<dyn MediaDevices>,
    signaling: Arc<dyn RealtimeSignaling>,
    pipeline: Arc<TurnPipeline>,
    state: StateHandle,
    options: RealtimeOptions,
    link: SharedLink,
    cancel: Option<CancellationToken>,
    control: Option<JoinHandle<()>>,
}

impl RealtimeSession {
    pub fn new(
        media: Arc<dyn MediaDevices>,
        signaling: Arc<dyn RealtimeSignaling>,
        pipeline: Arc<TurnPipeline>,
        state: StateHandle,
        options: RealtimeOptions,
    ) -> Self {
        Self {
            media,
            signaling,
            pipeline,
            state,
            options,
            link: Arc::new(Mutex::new(None)),
            cancel: None,
            control: None,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    /// Credential used for the current connection, if any.
    pub async fn credential(&self) -> Option<EphemeralCredential> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.credential.clone())
    }

    pub async fn connect(&mut self) -> Result<(), ConversationError> {
        if self.is_connected().await {
            return Ok(());
        }
        // A loop left over from a channel that closed on its own.
        self.stop_control().await;

        self.state
            .transition(ConnectionStatus::Connecting, "Connecting...");
        match self.negotiate().await {
            Ok(channel) => {
                self.state.transition(ConnectionStatus::Connected, "Connected");
                self.start_control(channel);
                info!(signaling = self.signaling.name(), "Realtime session connected");
                Ok(())
            }
            Err(e) => {
                self.pipeline.fallback().negotiation_failed(&e);
                Err(e)
            }
        }
    }

    async fn negotiate(&mut self) -> Result<DataChannel, ConversationError> {
        let mut mic = self
            .media
            .open_microphone()
            .await
            .map_err(|e| ConversationError::Device(e.to_string()))?;

        let mut peer = match self.media.create_peer_connection().await {
            Ok(peer) => peer,
            Err(e) => {
                mic.stop();
                return Err(ConversationError::Negotiation(e.to_string()));
            }
        };

        match self.establish(peer.as_mut(), mic.as_ref()).await {
            Ok((channel, credential)) => {
                *self.link.lock().await = Some(Link {
                    peer,
                    mic,
                    credential,
                });
                Ok(channel)
            }
            Err(e) => {
                peer.close().await;
                mic.stop();
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        peer: &mut dyn PeerConnection,
        mic: &dyn LocalAudioTrack,
    ) -> Result<(DataChannel, EphemeralCredential), ConversationError> {
        let negotiation = |e: anyhow::Error| ConversationError::Negotiation(e.to_string());

        peer.add_track(mic).await.map_err(negotiation)?;
        let channel = peer
            .create_data_channel(CONTROL_CHANNEL_LABEL)
            .await
            .map_err(negotiation)?;
        let offer = peer.create_offer().await.map_err(negotiation)?;

        let credential = self.signaling_stage(self.signaling.fetch_credential()).await?;
        debug!(expires_at = ?credential.expires_at, "Ephemeral credential issued");
        let answer = self
            .signaling_stage(self.signaling.exchange_sdp(&credential, &offer))
            .await?;

        peer.set_remote_answer(&answer).await.map_err(negotiation)?;
        Ok((channel, credential))
    }

    async fn signaling_stage<T>(
        &self,
        fut: impl Future<Output = Result<T, super::provider::ProviderError>>,
    ) -> Result<T, ConversationError> {
        match tokio::time::timeout(self.options.timeout, fut).await {
            Ok(result) => result.map_err(|e| ConversationError::from_provider(Stage::Negotiate, e)),
            Err(_) => Err(Stage::Negotiate.timed_out()),
        }
    }

    fn start_control(&mut self, channel: DataChannel) {
        let cancel = CancellationToken::new();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        tokio::spawn(speak_replies(
            self.pipeline.clone(),
            self.state.clone(),
            replies_rx,
            cancel.clone(),
        ));

        let control = ControlLoop {
            outbound: channel.outbound,
            state: self.state.clone(),
            instructions: self.options.instructions.clone(),
            voices: self.options.voices.clone(),
            stabilizer: LanguageStabilizer::new(
                self.options.history_capacity,
                self.options.language,
            ),
            buffer: String::new(),
            replies: replies_tx,
            link: self.link.clone(),
        };
        self.control = Some(tokio::spawn(control.run(channel.inbound, cancel.clone())));
        self.cancel = Some(cancel);
    }

    async fn stop_control(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(control) = self.control.take() {
            let _ = control.await;
        }
    }

    /// Tear everything down. Safe from any state and safe to repeat.
    pub async fn disconnect(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        self.pipeline.playback().clear();
        let released = release(&self.link).await;
        self.stop_control().await;
        self.state
            .transition(ConnectionStatus::Disconnected, "Disconnected");
        if released {
            info!("Realtime session disconnected");
        }
    }
}

struct ControlLoop {
    outbound: mpsc::UnboundedSender<String>,
    state: StateHandle,
    instructions: String,
    voices: VoiceMap,
    stabilizer: LanguageStabilizer,
    buffer: String,
    replies: mpsc::UnboundedSender<(String, Language)>,
    link: SharedLink,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<ChannelEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = inbound.recv() => event,
            };
            match event {
                Some(ChannelEvent::Open) => {
                    self.configure(self.stabilizer.current());
                    self.state.transition(ConnectionStatus::Ready, "Listening");
                }
                Some(ChannelEvent::Message(raw)) => self.on_message(&raw),
                Some(ChannelEvent::Closed) | None => {
                    if !cancel.is_cancelled() {
                        warn!("Realtime control channel closed");
                        cancel.cancel();
                        release(&self.link).await;
                        self.state
                            .fail(ConnectionStatus::Disconnected, "Realtime connection closed");
                    }
                    break;
                }
            }
        }
    }

    fn configure(&self, language: Language) {
        let voice = self.voices.for_language(language);
        debug!(%language, voice, "Sending session.update");
        if self
            .outbound
            .send(session_update(&self.instructions, voice))
            .is_err()
        {
            warn!("Control channel gone, session.update not sent");
        }
    }

    fn on_message(&mut self, raw: &str) {
        match decode_control_event(raw) {
            ControlEvent::TextDelta(delta) => {
                let detected = Language::detect_script(&delta);
                self.buffer.push_str(&delta);
                let stable = self.stabilizer.observe(detected);
                if stable.switched {
                    info!(from = %stable.previous, to = %stable.language, "Assistant language changed");
                    self.configure(stable.language);
                    self.state.set_language(
                        stable.language,
                        self.voices.for_language(stable.language),
                    );
                }
            }
            ControlEvent::ResponseDone => {
                let text = std::mem::take(&mut self.buffer).trim().to_string();
                if text.is_empty() {
                    return;
                }
                let detected = Language::detect_script(&text);
                let language = if detected.is_known() {
                    detected
                } else {
                    self.stabilizer.current()
                };
                let _ = self.replies.send((text, language));
            }
            ControlEvent::SessionUpdated => debug!("Realtime session configured"),
            ControlEvent::Error(message) => {
                warn!(%message, "Realtime error event");
                self.state.note_error(message);
            }
            ControlEvent::Unrecognized => trace!(raw, "Ignoring control message"),
        }
    }
}

/// Speak finished replies one after another.
async fn speak_replies(
    pipeline: Arc<TurnPipeline>,
    state: StateHandle,
    mut replies: mpsc::UnboundedReceiver<(String, Language)>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = replies.recv() => next,
        };
        let Some((text, language)) = next else { break };
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = pipeline.voice_reply(&text, language) => {
                if let Err(e) = result {
                    warn!(error = %e, "Realtime reply not spoken");
                    state.note_error(e.to_string());
                }
            }
        }
    }
}
