//! WebSocket conversation endpoint
//!
//! The browser owns the microphone recognizer and the speaker; the server
//! runs the conversation session. Recognizer start/stop requests and reply
//! audio go out as JSON frames (audio is followed by one binary frame);
//! recognition results and playback acknowledgements come back in.
//!
//! `?transport=realtime` (or `conversation.transport`) runs the realtime
//! transport instead: the browser's peer connection is driven through
//! `media` requests, see [`super::media`].
//!
//! One live session per user: a new socket stops the previous one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::media::{BrowserMedia, MediaReply, MediaRequest};
use super::{AppState, AuthUser};
use crate::auth::VerifiedUser;
use crate::config::Transport;
use crate::voice::capture::Recognizer;
use crate::voice::playback::AudioSink;
use crate::voice::provider::AudioSegment;
use crate::voice::provider::realtime::ChannelEvent;
use crate::voice::session::{SessionEvent, SessionHandle};
use crate::voice::state::{ConversationState, Language};
use crate::voice::{RealtimeParts, SessionParts, build_session};

// ── Protocol ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Recognized {
        text: String,
        #[serde(default)]
        is_final: bool,
    },
    RecognizerEnded {
        generation: u64,
    },
    RecognizerError {
        message: String,
    },
    PlaybackEnded {
        segment: u64,
    },
    /// Answer to a `media` request; `error` set means it failed.
    MediaResult {
        id: u64,
        #[serde(default)]
        sdp: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    ChannelOpen,
    ChannelMessage {
        data: String,
    },
    ChannelClosed,
    Reconnect,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    State(ConversationState),
    RecognizerStart {
        locale: String,
        generation: u64,
    },
    RecognizerStop,
    /// Announces the binary frame that follows.
    Audio {
        segment: u64,
        mime: String,
    },
    Transcript {
        user_text: String,
        assistant_text: String,
        language: Language,
    },
    Media {
        id: u64,
        request: MediaRequest,
    },
    /// Send `data` on the control data channel.
    ChannelSend {
        data: String,
    },
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Json(ServerMessage),
    Binary(Bytes),
}

pub(crate) type Outbox = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub transport: Option<Transport>,
}

// ── Remote recognizer ────────────────────────────────────────────

/// Asks the client to start or stop its recognizer. A denied microphone
/// comes back later as a `recognizer_error` frame.
pub struct RemoteRecognizer {
    out: Outbox,
}

#[async_trait]
impl Recognizer for RemoteRecognizer {
    async fn start(&mut self, locale: &str, generation: u64) -> Result<()> {
        let msg = ServerMessage::RecognizerStart {
            locale: locale.to_string(),
            generation,
        };
        if self.out.send(Outbound::Json(msg)).is_err() {
            bail!("client disconnected");
        }
        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self.out.send(Outbound::Json(ServerMessage::RecognizerStop));
    }
}

// ── Remote audio sink ────────────────────────────────────────────

type Acks = Arc<DashMap<u64, oneshot::Sender<()>>>;

/// Sends each segment to the client and waits for `playback_ended`, or the
/// ack timeout, whichever comes first.
pub struct RemoteAudioSink {
    out: Outbox,
    acks: Acks,
    next_segment: AtomicU64,
    ack_timeout: Duration,
}

/// Forgets the pending ack if playback is abandoned.
struct PendingAck<'a> {
    acks: &'a Acks,
    segment: u64,
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        self.acks.remove(&self.segment);
    }
}

impl RemoteAudioSink {
    fn new(out: Outbox, acks: Acks, ack_timeout: Duration) -> Self {
        Self {
            out,
            acks,
            next_segment: AtomicU64::new(1),
            ack_timeout,
        }
    }
}

#[async_trait]
impl AudioSink for RemoteAudioSink {
    async fn play(&self, segment: &AudioSegment) -> Result<()> {
        let id = self.next_segment.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.acks.insert(id, tx);
        let _pending = PendingAck {
            acks: &self.acks,
            segment: id,
        };

        let header = ServerMessage::Audio {
            segment: id,
            mime: segment.mime.clone(),
        };
        if self.out.send(Outbound::Json(header)).is_err()
            || self.out.send(Outbound::Binary(segment.bytes.clone())).is_err()
        {
            bail!("client disconnected");
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => bail!("client disconnected before playback finished"),
            Err(_) => {
                warn!(segment = id, "No playback acknowledgement, continuing");
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

// ── Session registry ─────────────────────────────────────────────

/// Live sessions by user.
#[derive(Default)]
pub struct SessionRegistry {
    live: DashMap<String, (Uuid, SessionHandle)>,
}

impl SessionRegistry {
    /// Record `handle` as the user's live session, stopping any previous one.
    pub fn register(&self, user: &str, id: Uuid, handle: SessionHandle) {
        if let Some((old_id, old)) = self.live.insert(user.to_string(), (id, handle)) {
            info!(%user, session = %old_id, "Replacing existing session");
            old.stop();
        }
    }

    /// Forget the session unless it was already replaced.
    pub fn unregister(&self, user: &str, id: Uuid) {
        self.live.remove_if(user, |_, (live_id, _)| *live_id == id);
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

// ── Socket ───────────────────────────────────────────────────────

pub async fn ws_handler(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let transport = params.transport.unwrap_or(state.config.conversation.transport);
    ws.on_upgrade(move |socket| handle_socket(socket, state, user, transport))
}

/// Apply one client frame. Returns false when the client asked to stop.
fn dispatch(msg: ClientMessage, handle: &SessionHandle, acks: &Acks, media: &BrowserMedia) -> bool {
    match msg {
        ClientMessage::Recognized { text, is_final } => {
            handle.utterance(&text, is_final);
        }
        ClientMessage::RecognizerEnded { generation } => {
            handle.send(SessionEvent::RecognizerEnded { generation });
        }
        ClientMessage::RecognizerError { message } => {
            handle.send(SessionEvent::RecognizerFailed(message));
        }
        ClientMessage::PlaybackEnded { segment } => {
            if let Some((_, tx)) = acks.remove(&segment) {
                let _ = tx.send(());
            }
        }
        ClientMessage::MediaResult { id, sdp, error } => {
            media.resolve(id, MediaReply { sdp, error });
        }
        ClientMessage::ChannelOpen => {
            media.channel_event(ChannelEvent::Open);
        }
        ClientMessage::ChannelMessage { data } => {
            media.channel_event(ChannelEvent::Message(data));
        }
        ClientMessage::ChannelClosed => {
            media.channel_event(ChannelEvent::Closed);
        }
        ClientMessage::Reconnect => {
            handle.send(SessionEvent::Reconnect);
        }
        ClientMessage::Stop => {
            handle.stop();
            return false;
        }
    }
    true
}

async fn handle_socket(socket: WebSocket, state: AppState, user: String, transport: Transport) {
    let session_id = Uuid::new_v4();
    info!(%user, session = %session_id, ?transport, "WebSocket session opened");

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let acks: Acks = Arc::new(DashMap::new());
    let (transcript_tx, mut transcript_rx) = mpsc::unbounded_channel();
    let media = BrowserMedia::new(out_tx.clone(), state.config.stage_timeout());
    let realtime = (transport == Transport::Realtime).then(|| RealtimeParts {
        media: Arc::new(media.clone()),
        signaling: state.signaling.clone(),
    });

    let (session, handle) = build_session(
        &state.config,
        RemoteRecognizer { out: out_tx.clone() },
        SessionParts {
            capabilities: state.capabilities.clone(),
            local_voice: state.local_voice.clone(),
            sink: Arc::new(RemoteAudioSink::new(
                out_tx.clone(),
                acks.clone(),
                state.config.playback_ack_timeout(),
            )),
            auth: Arc::new(VerifiedUser(user.clone())),
            realtime,
        },
        Some(transcript_tx),
    );
    state.sessions.register(&user, session_id, handle.clone());

    let writer = tokio::spawn(async move {
        while let Some(item) = out_rx.recv().await {
            let frame = match item {
                Outbound::Json(msg) => match serde_json::to_string(&msg) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        warn!(error = %e, "Failed to encode frame");
                        continue;
                    }
                },
                Outbound::Binary(bytes) => Message::Binary(bytes),
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut forward = {
        let out = out_tx.clone();
        let mut states = handle.subscribe();
        tokio::spawn(async move {
            let initial = states.borrow_and_update().clone();
            let _ = out.send(Outbound::Json(ServerMessage::State(initial)));
            loop {
                tokio::select! {
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = states.borrow_and_update().clone();
                        if out.send(Outbound::Json(ServerMessage::State(snapshot))).is_err() {
                            break;
                        }
                    }
                    turn = transcript_rx.recv() => {
                        let Some(turn) = turn else { break };
                        let msg = ServerMessage::Transcript {
                            user_text: turn.user_text,
                            assistant_text: turn.assistant_text,
                            language: turn.language,
                        };
                        if out.send(Outbound::Json(msg)).is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let mut session_task = tokio::spawn(session.run());
    let mut session_done = false;

    loop {
        tokio::select! {
            result = &mut session_task => {
                session_done = true;
                match result {
                    Ok(Err(e)) => warn!(%user, error = %e, "Session ended with error"),
                    Err(e) => warn!(%user, error = %e, "Session task failed"),
                    Ok(Ok(())) => {}
                }
                break;
            }
            frame = receiver.next() => {
                let keep_going = match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(msg) => dispatch(msg, &handle, &acks, &media),
                        Err(e) => {
                            debug!(error = %e, "Ignoring unrecognized client frame");
                            true
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => false,
                    Some(Ok(_)) => true,
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error");
                        false
                    }
                };
                if !keep_going {
                    break;
                }
            }
        }
    }

    handle.stop();
    media.close();
    if !session_done {
        let _ = session_task.await;
    }
    // Let the final state frame out before closing.
    if tokio::time::timeout(Duration::from_millis(100), &mut forward)
        .await
        .is_err()
    {
        forward.abort();
    }
    drop(out_tx);
    drop(handle);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;

    state.sessions.unregister(&user, session_id);
    info!(%user, session = %session_id, "WebSocket session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::state::ConnectionStatus;
    use serde_json::{Value, json};

    #[test]
    fn client_frames_decode() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"recognized","text":"Привет","is_final":true}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Recognized {
                text: "Привет".into(),
                is_final: true
            }
        );
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"playback_ended","segment":3}"#).unwrap();
        assert_eq!(msg, ClientMessage::PlaybackEnded { segment: 3 });
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"stop"}"#).unwrap(),
            ClientMessage::Stop
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn state_frame_is_flat() {
        let state = ConversationState::new(Language::Ru, "RU");
        let value: Value = serde_json::to_value(ServerMessage::State(state)).unwrap();
        assert_eq!(value["type"], "state");
        assert_eq!(value["connection_status"], "disconnected");
        assert_eq!(value["current_language"], "ru");
    }

    #[test]
    fn recognizer_start_frame() {
        let value = serde_json::to_value(ServerMessage::RecognizerStart {
            locale: "en-US".into(),
            generation: 2,
        })
        .unwrap();
        assert_eq!(value, json!({ "type": "recognizer_start", "locale": "en-US", "generation": 2 }));
    }

    #[tokio::test]
    async fn sink_waits_for_ack() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let acks: Acks = Arc::new(DashMap::new());
        let sink = Arc::new(RemoteAudioSink::new(tx, acks.clone(), Duration::from_secs(5)));

        let playing = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.play(&AudioSegment::new(vec![1u8, 2], "audio/mpeg")).await })
        };

        let Some(Outbound::Json(ServerMessage::Audio { segment, mime })) = rx.recv().await else {
            panic!("expected audio header");
        };
        assert_eq!(mime, "audio/mpeg");
        assert!(matches!(rx.recv().await, Some(Outbound::Binary(b)) if &b[..] == [1, 2]));
        assert!(!playing.is_finished());

        if let Some((_, done)) = acks.remove(&segment) {
            done.send(()).unwrap();
        }
        playing.await.unwrap().unwrap();
        assert!(acks.is_empty());
    }

    #[tokio::test]
    async fn sink_gives_up_after_timeout() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let acks: Acks = Arc::new(DashMap::new());
        let sink = RemoteAudioSink::new(tx, acks.clone(), Duration::from_millis(20));
        sink.play(&AudioSegment::new(vec![0u8], "audio/mpeg")).await.unwrap();
        assert!(acks.is_empty());
    }

    #[tokio::test]
    async fn sink_fails_when_client_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = RemoteAudioSink::new(tx, Arc::new(DashMap::new()), Duration::from_secs(1));
        assert!(sink.play(&AudioSegment::new(vec![0u8], "audio/mpeg")).await.is_err());
    }

    #[tokio::test]
    async fn recognizer_requests_go_to_client() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut recognizer = RemoteRecognizer { out: tx };
        recognizer.start("ru-RU", 4).await.unwrap();
        recognizer.stop().await;
        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Json(ServerMessage::RecognizerStart { ref locale, generation: 4 })) if locale == "ru-RU"
        ));
        assert!(matches!(rx.recv().await, Some(Outbound::Json(ServerMessage::RecognizerStop))));
    }

    #[tokio::test]
    async fn second_session_stops_the_first() {
        let config = crate::config::Config::default();
        let registry = SessionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();

        let start = |out: Outbox| {
            build_session(
                &config,
                RemoteRecognizer { out },
                SessionParts {
                    capabilities: crate::server::test_support::mock_capabilities(),
                    local_voice: None,
                    sink: Arc::new(crate::voice::sink::RecordingSink::new()),
                    auth: Arc::new(VerifiedUser("ana".into())),
                    realtime: None,
                },
                None,
            )
        };

        let (first, first_handle) = start(tx.clone());
        let first_task = tokio::spawn(first.run());
        let first_id = Uuid::new_v4();
        registry.register("ana", first_id, first_handle.clone());

        let (_second, second_handle) = start(tx);
        let second_id = Uuid::new_v4();
        registry.register("ana", second_id, second_handle);

        first_task.await.unwrap().unwrap();
        assert_eq!(first_handle.state().connection_status, ConnectionStatus::Disconnected);

        registry.unregister("ana", first_id);
        assert_eq!(registry.len(), 1);
        registry.unregister("ana", second_id);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dispatch_acknowledges_playback() {
        let acks: Acks = Arc::new(DashMap::new());
        let (ack_tx, mut ack_rx) = oneshot::channel();
        acks.insert(7, ack_tx);

        let config = crate::config::Config::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_session, handle) = build_session(
            &config,
            RemoteRecognizer { out: tx },
            SessionParts {
                capabilities: crate::server::test_support::mock_capabilities(),
                local_voice: None,
                sink: Arc::new(crate::voice::sink::RecordingSink::new()),
                auth: Arc::new(VerifiedUser("ana".into())),
                realtime: None,
            },
            None,
        );
        let (media_tx, _media_rx) = mpsc::unbounded_channel();
        let media = BrowserMedia::new(media_tx, Duration::from_secs(1));

        assert!(dispatch(ClientMessage::PlaybackEnded { segment: 7 }, &handle, &acks, &media));
        assert!(ack_rx.try_recv().is_ok());
        assert!(!dispatch(ClientMessage::Stop, &handle, &acks, &media));
    }

    #[test]
    fn media_frames_decode() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"media_result","id":4,"sdp":"v=0"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::MediaResult {
                id: 4,
                sdp: Some("v=0".into()),
                error: None
            }
        );
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"media_result","id":5,"error":"NotAllowedError"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::MediaResult { error: Some(_), .. }));
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"channel_open"}"#).unwrap(),
            ClientMessage::ChannelOpen
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"reconnect"}"#).unwrap(),
            ClientMessage::Reconnect
        );

        let value = serde_json::to_value(ServerMessage::ChannelSend { data: "{}".into() }).unwrap();
        assert_eq!(value, json!({ "type": "channel_send", "data": "{}" }));
    }

    #[test]
    fn transport_query_parses() {
        let params: ConnectParams = serde_json::from_value(json!({ "transport": "realtime" })).unwrap();
        assert_eq!(params.transport, Some(Transport::Realtime));
        let params: ConnectParams = serde_json::from_value(json!({})).unwrap();
        assert_eq!(params.transport, None);
    }

    /// A browser-driven realtime session: every media request the server
    /// sends is answered through `dispatch`, and the control channel opens.
    #[tokio::test]
    async fn realtime_session_negotiates_through_the_socket() {
        use crate::voice::provider::realtime::mock::MockSignaling;

        let config = crate::config::Config::default();
        let (out, mut frames) = mpsc::unbounded_channel();
        let media = BrowserMedia::new(out.clone(), Duration::from_secs(2));
        let acks: Acks = Arc::new(DashMap::new());
        let (session, handle) = build_session(
            &config,
            RemoteRecognizer { out },
            SessionParts {
                capabilities: crate::server::test_support::mock_capabilities(),
                local_voice: None,
                sink: Arc::new(crate::voice::sink::RecordingSink::new()),
                auth: Arc::new(VerifiedUser("ana".into())),
                realtime: Some(RealtimeParts {
                    media: Arc::new(media.clone()),
                    signaling: Arc::new(MockSignaling::working()),
                }),
            },
            None,
        );
        let task = tokio::spawn(session.run());

        let mut answer = None;
        let mut updates = Vec::new();
        let mut states = handle.subscribe();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
                .await
                .expect("negotiation stalled")
                .expect("outbox closed");
            match frame {
                Outbound::Json(ServerMessage::Media { id, request }) => {
                    let sdp = match request {
                        MediaRequest::CreateOffer => Some("v=0 browser".to_string()),
                        MediaRequest::SetRemoteAnswer { sdp } => {
                            answer = Some(sdp);
                            None
                        }
                        _ => None,
                    };
                    dispatch(ClientMessage::MediaResult { id, sdp, error: None }, &handle, &acks, &media);
                    if answer.is_some() {
                        break;
                    }
                }
                Outbound::Json(ServerMessage::RecognizerStart { .. }) => {
                    panic!("realtime sessions never start the recognizer")
                }
                _ => {}
            }
        }
        assert_eq!(answer.as_deref(), Some("answer-for:ek_mock:v=0 browser"));

        states
            .wait_for(|s| s.connection_status == ConnectionStatus::Connected)
            .await
            .unwrap();
        dispatch(ClientMessage::ChannelOpen, &handle, &acks, &media);
        while updates.is_empty() {
            if let Some(Outbound::Json(ServerMessage::ChannelSend { data })) = frames.recv().await {
                updates.push(data);
            }
        }
        assert!(updates[0].contains("session.update"));
        states
            .wait_for(|s| s.connection_status == ConnectionStatus::Ready)
            .await
            .unwrap();

        handle.stop();
        task.await.unwrap().unwrap();
        assert_eq!(handle.state().connection_status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn realtime_negotiation_error_reaches_the_status_line() {
        use crate::voice::provider::realtime::mock::{MockSignaling, MockSignalingConfig};

        let config = crate::config::Config::default();
        let (out, mut frames) = mpsc::unbounded_channel();
        let media = BrowserMedia::new(out.clone(), Duration::from_secs(2));
        let acks: Acks = Arc::new(DashMap::new());
        let (session, handle) = build_session(
            &config,
            RemoteRecognizer { out },
            SessionParts {
                capabilities: crate::server::test_support::mock_capabilities(),
                local_voice: None,
                sink: Arc::new(crate::voice::sink::RecordingSink::new()),
                auth: Arc::new(VerifiedUser("ana".into())),
                realtime: Some(RealtimeParts {
                    media: Arc::new(media.clone()),
                    signaling: Arc::new(MockSignaling::new(MockSignalingConfig {
                        fail_exchange: Some(502),
                        ..Default::default()
                    })),
                }),
            },
            None,
        );
        let task = tokio::spawn(session.run());

        let mut released = Vec::new();
        let mut states = handle.subscribe();
        let failed = states.wait_for(|s| {
            s.connection_status == ConnectionStatus::Disconnected && s.last_error_message.is_some()
        });
        tokio::pin!(failed);
        loop {
            tokio::select! {
                result = &mut failed => {
                    result.unwrap();
                    break;
                }
                frame = frames.recv() => {
                    if let Some(Outbound::Json(ServerMessage::Media { id, request })) = frame {
                        let sdp = (request == MediaRequest::CreateOffer).then(|| "v=0 browser".to_string());
                        if matches!(request, MediaRequest::ClosePeer | MediaRequest::StopMicrophone) {
                            released.push(request);
                        }
                        dispatch(ClientMessage::MediaResult { id, sdp, error: None }, &handle, &acks, &media);
                    }
                }
            }
        }
        let message = handle.state().last_error_message.unwrap();
        assert!(message.contains("realtime negotiation failed"), "{message}");

        // Teardown requests were queued before the failure was reported.
        while let Ok(frame) = frames.try_recv() {
            if let Outbound::Json(ServerMessage::Media { request, .. }) = frame {
                if matches!(request, MediaRequest::ClosePeer | MediaRequest::StopMicrophone) {
                    released.push(request);
                }
            }
        }
        assert_eq!(released, vec![MediaRequest::ClosePeer, MediaRequest::StopMicrophone]);

        // The session is still up and waits for an explicit reconnect.
        assert!(!task.is_finished());
        handle.stop();
        task.await.unwrap().unwrap();
    }
}
