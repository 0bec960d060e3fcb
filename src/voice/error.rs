//! Conversation error taxonomy.

use thiserror::Error;

use crate::voice::provider::ProviderError;

/// A failure in one stage of the conversation. Every variant carries a
/// short human-readable reason suitable for the status line.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("microphone unavailable: {0}")]
    Device(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("reply generation failed: {0}")]
    Generation(String),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("realtime negotiation failed: {0}")]
    Negotiation(String),

    #[error("configuration missing: {0}")]
    Config(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("playback failed: {0}")]
    Playback(String),
}

impl ConversationError {
    /// Stage name used in logs.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Device(_) => "capture",
            Self::Transcription(_) => "transcribe",
            Self::Generation(_) => "generate",
            Self::Synthesis(_) => "synthesize",
            Self::Negotiation(_) => "negotiate",
            Self::Config(_) => "config",
            Self::Unauthenticated => "auth",
            Self::Playback(_) => "playback",
        }
    }

    /// Wrap a provider failure for the given stage. Missing configuration
    /// keeps its own kind so callers can tell it apart from upstream errors.
    pub fn from_provider(stage: Stage, err: ProviderError) -> Self {
        if let ProviderError::Config(reason) = err {
            return Self::Config(reason);
        }
        let reason = err.user_message();
        match stage {
            Stage::Transcribe => Self::Transcription(reason),
            Stage::Generate => Self::Generation(reason),
            Stage::Synthesize => Self::Synthesis(reason),
            Stage::Negotiate => Self::Negotiation(reason),
        }
    }
}

/// Network-bound stages that call a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transcribe,
    Generate,
    Synthesize,
    Negotiate,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::Generate => "generate",
            Self::Synthesize => "synthesize",
            Self::Negotiate => "negotiate",
        }
    }

    /// Error reported when the stage exceeds its time budget.
    pub fn timed_out(self) -> ConversationError {
        let reason = "timed out".to_string();
        match self {
            Self::Transcribe => ConversationError::Transcription(reason),
            Self::Generate => ConversationError::Generation(reason),
            Self::Synthesize => ConversationError::Synthesis(reason),
            Self::Negotiate => ConversationError::Negotiation(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_map_to_stage() {
        let err = ConversationError::from_provider(
            Stage::Synthesize,
            ProviderError::Upstream {
                status: 500,
                body: "boom".into(),
            },
        );
        assert!(matches!(err, ConversationError::Synthesis(_)));
        assert_eq!(err.stage(), "synthesize");
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn missing_config_stays_config() {
        let err = ConversationError::from_provider(
            Stage::Generate,
            ProviderError::Config("chat.api_key".into()),
        );
        assert_eq!(err, ConversationError::Config("chat.api_key".into()));
    }

    #[test]
    fn timeouts_name_the_stage() {
        assert_eq!(
            Stage::Transcribe.timed_out(),
            ConversationError::Transcription("timed out".into())
        );
    }
}
