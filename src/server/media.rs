//! Browser-owned media for the realtime transport.
//!
//! The browser holds the microphone and the `RTCPeerConnection`. The server
//! drives negotiation by sending `media` requests over the conversation
//! socket and waiting for the matching `media_result`; the control data
//! channel is relayed frame by frame in both directions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::websocket::{Outbound, Outbox, ServerMessage};
use crate::voice::provider::realtime::{
    ChannelEvent, DataChannel, LocalAudioTrack, MediaDevices, PeerConnection,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MediaRequest {
    OpenMicrophone,
    StopMicrophone,
    CreatePeer,
    AddTrack,
    CreateDataChannel { label: String },
    /// The reply carries the local SDP offer.
    CreateOffer,
    SetRemoteAnswer { sdp: String },
    ClosePeer,
}

/// The client's answer to one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaReply {
    pub sdp: Option<String>,
    pub error: Option<String>,
}

struct Bridge {
    out: Outbox,
    pending: DashMap<u64, oneshot::Sender<MediaReply>>,
    next_id: AtomicU64,
    channel: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    timeout: Duration,
}

impl Bridge {
    fn post(&self, id: u64, request: MediaRequest) -> bool {
        self.out
            .send(Outbound::Json(ServerMessage::Media { id, request }))
            .is_ok()
    }

    async fn request(&self, request: MediaRequest) -> Result<Option<String>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        debug!(id, ?request, "Media request");

        if !self.post(id, request) {
            self.pending.remove(&id);
            bail!("client disconnected");
        }
        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => bail!("client disconnected"),
            Err(_) => {
                self.pending.remove(&id);
                bail!("client did not answer within {}ms", self.timeout.as_millis());
            }
        };
        match reply.error {
            Some(error) => Err(anyhow!(error)),
            None => Ok(reply.sdp),
        }
    }

    /// Fire and forget; used on teardown paths.
    fn notify(&self, request: MediaRequest) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.post(id, request);
    }

    fn set_channel(&self, tx: Option<mpsc::UnboundedSender<ChannelEvent>>) {
        *self.channel.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }
}

/// [`MediaDevices`] backed by the peer connection of the client on the
/// other end of a conversation socket.
#[derive(Clone)]
pub struct BrowserMedia {
    bridge: Arc<Bridge>,
}

impl BrowserMedia {
    pub(crate) fn new(out: Outbox, timeout: Duration) -> Self {
        Self {
            bridge: Arc::new(Bridge {
                out,
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
                channel: Mutex::new(None),
                timeout,
            }),
        }
    }

    /// Hand a `media_result` to the request waiting for it. Returns false
    /// for an unknown or already answered id.
    pub fn resolve(&self, id: u64, reply: MediaReply) -> bool {
        match self.bridge.pending.remove(&id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => {
                debug!(id, "Unmatched media result");
                false
            }
        }
    }

    /// Relay a data channel event from the client. Returns false when no
    /// channel is open.
    pub fn channel_event(&self, event: ChannelEvent) -> bool {
        let channel = self.bridge.channel.lock().unwrap_or_else(|e| e.into_inner());
        channel.as_ref().is_some_and(|tx| tx.send(event).is_ok())
    }

    /// The socket is gone: fail every waiting request now.
    pub fn close(&self) {
        self.bridge.pending.clear();
        self.bridge.set_channel(None);
    }
}

#[async_trait]
impl MediaDevices for BrowserMedia {
    async fn open_microphone(&self) -> Result<Box<dyn LocalAudioTrack>> {
        self.bridge.request(MediaRequest::OpenMicrophone).await?;
        Ok(Box::new(BrowserTrack {
            bridge: self.bridge.clone(),
            stopped: false,
        }))
    }

    async fn create_peer_connection(&self) -> Result<Box<dyn PeerConnection>> {
        self.bridge.request(MediaRequest::CreatePeer).await?;
        Ok(Box::new(BrowserPeer {
            bridge: self.bridge.clone(),
            closed: false,
        }))
    }
}

struct BrowserTrack {
    bridge: Arc<Bridge>,
    stopped: bool,
}

impl LocalAudioTrack for BrowserTrack {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.bridge.notify(MediaRequest::StopMicrophone);
        }
    }
}

struct BrowserPeer {
    bridge: Arc<Bridge>,
    closed: bool,
}

#[async_trait]
impl PeerConnection for BrowserPeer {
    async fn add_track(&mut self, _track: &dyn LocalAudioTrack) -> Result<()> {
        self.bridge.request(MediaRequest::AddTrack).await.map(drop)
    }

    async fn create_data_channel(&mut self, label: &str) -> Result<DataChannel> {
        let (events, inbound) = mpsc::unbounded_channel();
        self.bridge.set_channel(Some(events));
        self.bridge
            .request(MediaRequest::CreateDataChannel {
                label: label.to_string(),
            })
            .await?;

        let (outbound, mut relay) = mpsc::unbounded_channel::<String>();
        let out = self.bridge.out.clone();
        tokio::spawn(async move {
            while let Some(data) = relay.recv().await {
                if out
                    .send(Outbound::Json(ServerMessage::ChannelSend { data }))
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(DataChannel { outbound, inbound })
    }

    async fn create_offer(&mut self) -> Result<String> {
        self.bridge
            .request(MediaRequest::CreateOffer)
            .await?
            .filter(|sdp| !sdp.trim().is_empty())
            .ok_or_else(|| anyhow!("client returned no SDP offer"))
    }

    async fn set_remote_answer(&mut self, sdp: &str) -> Result<()> {
        self.bridge
            .request(MediaRequest::SetRemoteAnswer {
                sdp: sdp.to_string(),
            })
            .await
            .map(drop)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.bridge.notify(MediaRequest::ClosePeer);
            self.bridge.set_channel(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    type Seen = Arc<Mutex<Vec<MediaRequest>>>;

    /// Answers every media request like a cooperative browser and records
    /// the operations it saw.
    fn browser(media: BrowserMedia, mut rx: mpsc::UnboundedReceiver<Outbound>, deny_microphone: bool) -> Seen {
        let seen = Seen::default();
        let log = seen.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let Outbound::Json(ServerMessage::Media { id, request }) = item else {
                    continue;
                };
                let reply = match &request {
                    MediaRequest::OpenMicrophone if deny_microphone => MediaReply {
                        error: Some("NotAllowedError: Permission denied".into()),
                        ..Default::default()
                    },
                    MediaRequest::CreateOffer => MediaReply {
                        sdp: Some("v=0 browser-offer".into()),
                        ..Default::default()
                    },
                    _ => MediaReply::default(),
                };
                log.lock().unwrap().push(request);
                media.resolve(id, reply);
            }
        });
        seen
    }

    async fn wait_seen(seen: &Seen, count: usize) -> Vec<MediaRequest> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = seen.lock().unwrap().clone();
                if snapshot.len() >= count {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn request_frame_shape() {
        let value: Value = serde_json::to_value(ServerMessage::Media {
            id: 3,
            request: MediaRequest::SetRemoteAnswer { sdp: "v=0".into() },
        })
        .unwrap();
        assert_eq!(
            value,
            json!({ "type": "media", "id": 3, "request": { "op": "set_remote_answer", "sdp": "v=0" } })
        );
    }

    #[tokio::test]
    async fn negotiation_runs_through_the_client() {
        let (tx, rx) = mpsc::unbounded_channel();
        let media = BrowserMedia::new(tx, Duration::from_secs(2));
        let client = browser(media.clone(), rx, false);

        let mut mic = media.open_microphone().await.unwrap();
        let mut peer = media.create_peer_connection().await.unwrap();
        peer.add_track(mic.as_ref()).await.unwrap();
        let mut channel = peer.create_data_channel("oai-events").await.unwrap();
        assert_eq!(peer.create_offer().await.unwrap(), "v=0 browser-offer");
        peer.set_remote_answer("v=0 answer").await.unwrap();

        assert!(media.channel_event(ChannelEvent::Open));
        assert_eq!(channel.inbound.recv().await, Some(ChannelEvent::Open));

        peer.close().await;
        peer.close().await;
        mic.stop();
        mic.stop();
        assert!(!media.channel_event(ChannelEvent::Open));

        assert_eq!(
            wait_seen(&client, 8).await,
            vec![
                MediaRequest::OpenMicrophone,
                MediaRequest::CreatePeer,
                MediaRequest::AddTrack,
                MediaRequest::CreateDataChannel {
                    label: "oai-events".into()
                },
                MediaRequest::CreateOffer,
                MediaRequest::SetRemoteAnswer {
                    sdp: "v=0 answer".into()
                },
                MediaRequest::ClosePeer,
                MediaRequest::StopMicrophone,
            ]
        );
    }

    #[tokio::test]
    async fn client_error_fails_the_request() {
        let (tx, rx) = mpsc::unbounded_channel();
        let media = BrowserMedia::new(tx, Duration::from_secs(2));
        let _client = browser(media.clone(), rx, true);

        let err = media.open_microphone().await.err().unwrap();
        assert!(err.to_string().contains("Permission denied"));
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let media = BrowserMedia::new(tx, Duration::from_millis(20));
        let err = media.create_peer_connection().await.err().unwrap();
        assert!(err.to_string().contains("did not answer"));
        assert!(media.bridge.pending.is_empty());
    }

    #[tokio::test]
    async fn close_fails_waiting_requests() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let media = BrowserMedia::new(tx, Duration::from_secs(30));
        let waiting = {
            let media = media.clone();
            tokio::spawn(async move { media.open_microphone().await.err() })
        };
        while media.bridge.pending.is_empty() {
            tokio::task::yield_now().await;
        }
        media.close();

        let err = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(err.to_string().contains("client disconnected"));
    }

    #[tokio::test]
    async fn control_messages_are_relayed_to_the_client() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let media = BrowserMedia::new(tx, Duration::from_secs(2));
        let mut peer = BrowserPeer {
            bridge: media.bridge.clone(),
            closed: false,
        };

        let create = tokio::spawn(async move {
            let channel = peer.create_data_channel("oai-events").await;
            (peer, channel)
        });
        let Some(Outbound::Json(ServerMessage::Media { id, .. })) = rx.recv().await else {
            panic!("expected a media request");
        };
        media.resolve(id, MediaReply::default());
        let (_peer, channel) = create.await.unwrap();
        let channel = channel.unwrap();

        channel.outbound.send(r#"{"type":"session.update"}"#.into()).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Json(ServerMessage::ChannelSend { ref data })) if data.contains("session.update")
        ));
    }
}
