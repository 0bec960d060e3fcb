//! Mock signaling and media engine for testing.
//!
//! [`MockMedia`] hands out a peer connection whose data channel is wired to
//! a [`MockMediaProbe`], so tests can push inbound control events and read
//! what the session sent, and can check that every acquired resource was
//! released.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::voice::provider::ProviderError;
use crate::voice::provider::realtime::{
    ChannelEvent, DataChannel, EphemeralCredential, LocalAudioTrack, MediaDevices,
    PeerConnection, RealtimeSignaling,
};

// ── Signaling ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MockSignalingConfig {
    pub fail_credential: bool,
    /// Upstream status returned by the SDP exchange, if it should fail.
    pub fail_exchange: Option<u16>,
}

pub struct MockSignaling {
    config: MockSignalingConfig,
    credentials: AtomicUsize,
    exchanges: AtomicUsize,
}

impl MockSignaling {
    pub fn new(config: MockSignalingConfig) -> Self {
        Self {
            config,
            credentials: AtomicUsize::new(0),
            exchanges: AtomicUsize::new(0),
        }
    }

    pub fn working() -> Self {
        Self::new(MockSignalingConfig::default())
    }

    pub fn credentials_issued(&self) -> usize {
        self.credentials.load(Ordering::SeqCst)
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeSignaling for MockSignaling {
    async fn fetch_credential(&self) -> Result<EphemeralCredential, ProviderError> {
        self.credentials.fetch_add(1, Ordering::SeqCst);
        if self.config.fail_credential {
            return Err(ProviderError::Upstream {
                status: 401,
                body: "Unauthorized".into(),
            });
        }
        Ok(EphemeralCredential {
            value: "ek_mock".into(),
            expires_at: None,
        })
    }

    async fn exchange_sdp(
        &self,
        credential: &EphemeralCredential,
        offer_sdp: &str,
    ) -> Result<String, ProviderError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.config.fail_exchange {
            return Err(ProviderError::Upstream {
                status,
                body: "SDP exchange failed".into(),
            });
        }
        Ok(format!("answer-for:{}:{offer_sdp}", credential.value))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ── Media ────────────────────────────────────────────────────────

/// Shared view of everything the mock media engine handed out.
#[derive(Default)]
pub struct MockMediaProbe {
    pub microphones_opened: AtomicUsize,
    pub microphones_stopped: AtomicUsize,
    pub peers_created: AtomicUsize,
    pub peers_closed: AtomicUsize,
    pub remote_answer: Mutex<Option<String>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    sent: Mutex<Vec<String>>,
}

impl MockMediaProbe {
    /// Deliver an event on the current data channel. Returns false if no
    /// channel is open.
    pub fn push(&self, event: ChannelEvent) -> bool {
        let guard = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Every message the session sent so far.
    pub fn sent(&self) -> Vec<String> {
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rx) = self
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            while let Ok(msg) = rx.try_recv() {
                sent.push(msg);
            }
        }
        sent.clone()
    }

    /// Every opened microphone has been stopped and every peer closed.
    pub fn all_released(&self) -> bool {
        self.microphones_opened.load(Ordering::SeqCst)
            == self.microphones_stopped.load(Ordering::SeqCst)
            && self.peers_created.load(Ordering::SeqCst) == self.peers_closed.load(Ordering::SeqCst)
    }
}

/// Where the mock media engine should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFailure {
    MicrophoneDenied,
    PeerConnection,
    RemoteAnswer,
}

pub struct MockMedia {
    probe: Arc<MockMediaProbe>,
    failure: Option<MediaFailure>,
}

impl MockMedia {
    pub fn new() -> Self {
        Self {
            probe: Arc::new(MockMediaProbe::default()),
            failure: None,
        }
    }

    pub fn failing(failure: MediaFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new()
        }
    }

    pub fn probe(&self) -> Arc<MockMediaProbe> {
        self.probe.clone()
    }
}

impl Default for MockMedia {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for MockMedia {
    async fn open_microphone(&self) -> Result<Box<dyn LocalAudioTrack>> {
        if self.failure == Some(MediaFailure::MicrophoneDenied) {
            bail!("permission denied");
        }
        self.probe.microphones_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTrack {
            probe: self.probe.clone(),
            stopped: AtomicBool::new(false),
        }))
    }

    async fn create_peer_connection(&self) -> Result<Box<dyn PeerConnection>> {
        if self.failure == Some(MediaFailure::PeerConnection) {
            bail!("peer connection unavailable");
        }
        self.probe.peers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPeer {
            probe: self.probe.clone(),
            fail_answer: self.failure == Some(MediaFailure::RemoteAnswer),
            closed: false,
        }))
    }
}

struct MockTrack {
    probe: Arc<MockMediaProbe>,
    stopped: AtomicBool,
}

impl LocalAudioTrack for MockTrack {
    fn stop(&mut self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.probe.microphones_stopped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MockPeer {
    probe: Arc<MockMediaProbe>,
    fail_answer: bool,
    closed: bool,
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn add_track(&mut self, _track: &dyn LocalAudioTrack) -> Result<()> {
        Ok(())
    }

    async fn create_data_channel(&mut self, _label: &str) -> Result<DataChannel> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        *self.probe.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(out_rx);
        *self.probe.inbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(in_tx);
        Ok(DataChannel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    async fn create_offer(&mut self) -> Result<String> {
        Ok("v=0 mock-offer".to_string())
    }

    async fn set_remote_answer(&mut self, sdp: &str) -> Result<()> {
        if self.fail_answer {
            bail!("remote description rejected");
        }
        *self.probe.remote_answer.lock().unwrap_or_else(|e| e.into_inner()) = Some(sdp.to_string());
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.probe.peers_closed.fetch_add(1, Ordering::SeqCst);
            // Closing the peer closes its channel.
            let tx = self.probe.inbound.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(tx) = tx {
                let _ = tx.send(ChannelEvent::Closed);
            }
        }
    }
}
