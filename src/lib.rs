//! voxroom - a bilingual (English/Russian) voice conversation orchestrator
//!
//! This crate provides:
//! - The conversation core: language stabilization, capture, the
//!   transcribe → reply → speak turn pipeline, ordered playback, fallback
//!   and the realtime peer-connection transport
//! - Capability providers (Whisper, chat completions, ElevenLabs, espeak-ng)
//! - An HTTP/WebSocket gateway that keeps provider keys server-side
//! - HMAC-signed session tokens

pub mod auth;
pub mod concurrency;
pub mod config;
pub mod server;
pub mod utils;
pub mod voice;

pub use config::Config;
