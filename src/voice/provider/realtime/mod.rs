//! Realtime transport collaborators: credential issuance, SDP signaling,
//! and the platform media engine (microphone + peer connection).

pub mod mock;
pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::voice::provider::ProviderError;

// ── Signaling ────────────────────────────────────────────────────

/// Short-lived credential for one SDP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralCredential {
    pub value: String,
    pub expires_at: Option<i64>,
}

/// Read `client_secret.value` (and `expires_at` if present).
pub fn parse_credential(body: &Value) -> Result<EphemeralCredential, ProviderError> {
    let value = body
        .pointer("/client_secret/value")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProviderError::Malformed("missing client_secret.value".into()))?;
    Ok(EphemeralCredential {
        value: value.to_string(),
        expires_at: body.pointer("/client_secret/expires_at").and_then(Value::as_i64),
    })
}

/// Trusted intermediary that mints ephemeral credentials with the
/// long-lived provider key. Returns the upstream body unchanged.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self) -> Result<Value, ProviderError>;
}

#[async_trait]
pub trait RealtimeSignaling: Send + Sync {
    async fn fetch_credential(&self) -> Result<EphemeralCredential, ProviderError>;

    /// Send the local offer, return the remote answer.
    async fn exchange_sdp(
        &self,
        credential: &EphemeralCredential,
        offer_sdp: &str,
    ) -> Result<String, ProviderError>;

    fn name(&self) -> &str;
}

// ── Media ────────────────────────────────────────────────────────

/// Events surfaced by a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Closed,
}

/// Both directions of a control side-channel.
pub struct DataChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<ChannelEvent>,
}

pub trait LocalAudioTrack: Send + Sync {
    /// Release the capture device. Must tolerate repeated calls.
    fn stop(&mut self);
}

#[async_trait]
pub trait PeerConnection: Send {
    async fn add_track(&mut self, track: &dyn LocalAudioTrack) -> Result<()>;

    async fn create_data_channel(&mut self, label: &str) -> Result<DataChannel>;

    /// Create an offer and apply it as the local description.
    async fn create_offer(&mut self) -> Result<String>;

    async fn set_remote_answer(&mut self, sdp: &str) -> Result<()>;

    /// Must tolerate repeated calls.
    async fn close(&mut self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self) -> Result<Box<dyn LocalAudioTrack>>;

    async fn create_peer_connection(&self) -> Result<Box<dyn PeerConnection>>;
}
