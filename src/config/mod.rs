//! Configuration loading for voxroom.
//!
//! The file lives at `~/.voxroom/config.toml` by default. Every section is
//! optional; missing values fall back to the defaults below. Provider
//! credentials may also come from the environment, which wins over the file.

pub mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use schema::{parse_duration, validate_base_url};

use crate::voice::state::Language;

const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PLAYBACK_ACK_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_PLAYBACK_TIMEOUT: Duration = Duration::from_secs(150);
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(12 * 3600);
const MAX_SETTLE_DELAY: Duration = Duration::from_secs(5);

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful bilingual assistant who understands both Russian and English.
You must reply in the same mix of languages as the user used in their message.
If the user speaks only Russian, answer fully in Russian using Cyrillic script.
If the user speaks only English, answer fully in English using the Latin alphabet.
If the user mixes Russian and English, answer in a natural code-switching style, preserving the same language mix and always using the correct alphabet for each word.";

pub const DEFAULT_REALTIME_INSTRUCTIONS: &str = "You are a helpful assistant. Always reply in the same language the user is speaking. If the user speaks English, use native, neutral (accent-free) English. If the user speaks Russian, speak natural Russian.";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub openai: OpenAiConfig,
    pub chat: ChatConfig,
    pub elevenlabs: ElevenLabsConfig,
    pub conversation: ConversationConfig,
    pub fallback: FallbackConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_body_bytes: usize,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            max_body_bytes: 10 * 1024 * 1024,
            cors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for session tokens. Required by `serve` and `token`.
    pub secret: Option<String>,
    pub token_ttl: String,
    pub cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl: "12h".to_string(),
            cookie_name: "voxroom-session".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub transcription_model: String,
    pub realtime_model: String,
    pub realtime_voice: String,
    /// SDP exchange endpoint; the model is appended as a query parameter.
    pub realtime_url: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            transcription_model: "whisper-1".to_string(),
            realtime_model: "gpt-4o-realtime-preview".to_string(),
            realtime_voice: "verse".to_string(),
            realtime_url: "https://api.openai.com/v1/realtime".to_string(),
        }
    }
}

/// OpenAI-compatible chat completions endpoint (Groq by default).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.3-70b-versatile".to_string(),
            temperature: 0.7,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevenLabsConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model_id: String,
    pub voice_id_en: Option<String>,
    pub voice_id_ru: Option<String>,
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            model_id: "eleven_multilingual_v2".to_string(),
            voice_id_en: None,
            voice_id_ru: None,
            stability: 0.5,
            similarity_boost: 0.75,
        }
    }
}

/// Per-language voice names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceMap {
    pub en: String,
    pub ru: String,
}

impl VoiceMap {
    pub fn for_language(&self, language: Language) -> &str {
        match language {
            Language::Ru => &self.ru,
            Language::En | Language::Unknown => &self.en,
        }
    }
}

/// How a session talks to the assistant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Transcribe, generate and synthesize one turn at a time.
    #[default]
    Chained,
    /// Stream over a peer connection to the realtime model.
    Realtime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub transport: Transport,
    pub default_language: String,
    pub history_capacity: usize,
    /// Pause between stopping and restarting the recognizer on a locale change.
    pub settle_delay: String,
    /// Upper bound for each network stage of a turn.
    pub stage_timeout: String,
    /// How long a remote client may take to report the end of a segment.
    pub playback_ack_timeout: String,
    /// Upper bound for playing one segment on any sink.
    pub playback_timeout: String,
    /// Voice labels reported for the chained pipeline.
    pub voices: VoiceMap,
    /// Voices requested over the realtime control channel.
    pub realtime_voices: VoiceMap,
    pub realtime_instructions: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Chained,
            default_language: "en".to_string(),
            history_capacity: 3,
            settle_delay: "200ms".to_string(),
            stage_timeout: "30s".to_string(),
            playback_ack_timeout: "120s".to_string(),
            playback_timeout: "150s".to_string(),
            voices: VoiceMap {
                en: "EN".to_string(),
                ru: "RU".to_string(),
            },
            realtime_voices: VoiceMap {
                en: "verse".to_string(),
                ru: "alloy".to_string(),
            },
            realtime_instructions: DEFAULT_REALTIME_INSTRUCTIONS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub program: String,
    pub words_per_minute: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "espeak-ng".to_string(),
            words_per_minute: 175,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Player command; the segment file path is appended as the last argument.
    pub player: Vec<String>,
    /// Write segments here instead of (or when no) player is configured.
    pub output_dir: Option<String>,
}

impl Config {
    /// `~/.voxroom/config.toml`, if a home directory can be resolved.
    pub fn default_path() -> Option<PathBuf> {
        directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".voxroom").join("config.toml"))
    }

    /// Load from `path` (or the default path), apply environment overrides
    /// and validate. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);

        let mut config = match &path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p).map_err(|source| ConfigError::Io {
                    path: p.clone(),
                    source,
                })?;
                debug!(path = %p.display(), "Loaded config file");
                Self::from_toml_str(&raw)?
            }
            _ => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.expand_values();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Environment values take precedence over the file.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("OPENAI_API_KEY") {
            self.openai.api_key = Some(v);
        }
        if let Some(v) = non_empty("GROQ_API_KEY") {
            self.chat.api_key = Some(v);
        }
        if let Some(v) = non_empty("ELEVENLABS_API_KEY") {
            self.elevenlabs.api_key = Some(v);
        }
        if let Some(v) = non_empty("ELEVENLABS_VOICE_ID_EN") {
            self.elevenlabs.voice_id_en = Some(v);
        }
        if let Some(v) = non_empty("ELEVENLABS_VOICE_ID_RU") {
            self.elevenlabs.voice_id_ru = Some(v);
        }
        if let Some(v) = non_empty("VOXROOM_AUTH_SECRET") {
            self.auth.secret = Some(v);
        }
        if let Some(v) = non_empty("VOXROOM_BIND") {
            self.server.bind = v;
        }
    }

    /// Expand `${VAR}` and `~` in secrets and paths.
    fn expand_values(&mut self) {
        fn expand(value: &mut Option<String>) {
            if let Some(v) = value.as_mut() {
                if let Ok(expanded) = shellexpand::full(v.as_str()) {
                    *v = expanded.into_owned();
                }
            }
        }

        expand(&mut self.auth.secret);
        expand(&mut self.openai.api_key);
        expand(&mut self.chat.api_key);
        expand(&mut self.elevenlabs.api_key);
        expand(&mut self.playback.output_dir);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = ConfigError::Invalid;

        validate_base_url("openai.base_url", &self.openai.base_url).map_err(invalid)?;
        validate_base_url("openai.realtime_url", &self.openai.realtime_url).map_err(invalid)?;
        validate_base_url("chat.base_url", &self.chat.base_url).map_err(invalid)?;
        validate_base_url("elevenlabs.base_url", &self.elevenlabs.base_url).map_err(invalid)?;

        if Language::from_tag(&self.conversation.default_language) == Language::Unknown {
            return Err(invalid(format!(
                "conversation.default_language must be \"en\" or \"ru\", got {:?}",
                self.conversation.default_language
            )));
        }
        if self.conversation.history_capacity == 0 {
            return Err(invalid("conversation.history_capacity must be at least 1".into()));
        }

        let settle = parse_duration(&self.conversation.settle_delay)
            .map_err(|e| invalid(format!("conversation.settle_delay: {e}")))?;
        if settle > MAX_SETTLE_DELAY {
            return Err(invalid(format!(
                "conversation.settle_delay must not exceed {}ms",
                MAX_SETTLE_DELAY.as_millis()
            )));
        }
        parse_duration(&self.conversation.stage_timeout)
            .map_err(|e| invalid(format!("conversation.stage_timeout: {e}")))?;
        parse_duration(&self.conversation.playback_ack_timeout)
            .map_err(|e| invalid(format!("conversation.playback_ack_timeout: {e}")))?;
        parse_duration(&self.conversation.playback_timeout)
            .map_err(|e| invalid(format!("conversation.playback_timeout: {e}")))?;
        parse_duration(&self.auth.token_ttl).map_err(|e| invalid(format!("auth.token_ttl: {e}")))?;

        if !(0.0..=2.0).contains(&self.chat.temperature) {
            return Err(invalid("chat.temperature must be within 0.0..=2.0".into()));
        }
        Ok(())
    }

    pub fn default_language(&self) -> Language {
        Language::from_tag(&self.conversation.default_language)
    }

    pub fn settle_delay(&self) -> Duration {
        parse_duration(&self.conversation.settle_delay).unwrap_or(DEFAULT_SETTLE_DELAY)
    }

    pub fn stage_timeout(&self) -> Duration {
        parse_duration(&self.conversation.stage_timeout).unwrap_or(DEFAULT_STAGE_TIMEOUT)
    }

    pub fn playback_ack_timeout(&self) -> Duration {
        parse_duration(&self.conversation.playback_ack_timeout)
            .unwrap_or(DEFAULT_PLAYBACK_ACK_TIMEOUT)
    }

    pub fn playback_timeout(&self) -> Duration {
        parse_duration(&self.conversation.playback_timeout).unwrap_or(DEFAULT_PLAYBACK_TIMEOUT)
    }

    pub fn token_ttl(&self) -> Duration {
        parse_duration(&self.auth.token_ttl).unwrap_or(DEFAULT_TOKEN_TTL)
    }

    /// A copy safe to print: every secret replaced by a marker.
    pub fn redacted(&self) -> Self {
        fn mask(value: &mut Option<String>) {
            if value.is_some() {
                *value = Some("***".to_string());
            }
        }

        let mut copy = self.clone();
        mask(&mut copy.auth.secret);
        mask(&mut copy.openai.api_key);
        mask(&mut copy.chat.api_key);
        mask(&mut copy.elevenlabs.api_key);
        copy
    }

    /// Render the defaults as a starter config file.
    pub fn default_file_contents() -> Result<String, toml::ser::Error> {
        let body = toml::to_string_pretty(&Self::default())?;
        Ok(format!(
            "# voxroom configuration\n\
             # Secrets may be written as \"${{VAR}}\" or supplied through the environment\n\
             # (OPENAI_API_KEY, GROQ_API_KEY, ELEVENLABS_API_KEY, VOXROOM_AUTH_SECRET).\n\n{body}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_language(), Language::En);
        assert_eq!(config.settle_delay(), Duration::from_millis(200));
        assert_eq!(config.stage_timeout(), Duration::from_secs(30));
        assert_eq!(config.conversation.history_capacity, 3);
        assert_eq!(config.playback_timeout(), Duration::from_secs(150));
        assert_eq!(config.conversation.transport, Transport::Chained);
    }

    #[test]
    fn transport_and_playback_timeout_parse() {
        let config = Config::from_toml_str(
            "[conversation]\ntransport = \"realtime\"\nplayback_timeout = \"500ms\"",
        )
        .unwrap();
        assert_eq!(config.conversation.transport, Transport::Realtime);
        assert_eq!(config.playback_timeout(), Duration::from_millis(500));

        assert!(Config::from_toml_str("[conversation]\ntransport = \"carrier-pigeon\"").is_err());
        let bad = Config::from_toml_str("[conversation]\nplayback_timeout = \"soon\"").unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [elevenlabs]
            voice_id_en = "rachel"
            voice_id_ru = "bella"

            [conversation]
            default_language = "ru"
            "#,
        )
        .unwrap();
        assert_eq!(config.elevenlabs.voice_id_en.as_deref(), Some("rachel"));
        assert_eq!(config.elevenlabs.model_id, "eleven_multilingual_v2");
        assert_eq!(config.default_language(), Language::Ru);
        assert_eq!(config.chat.model, "llama-3.3-70b-versatile");
    }

    #[test]
    fn env_overrides_win_and_ignore_blank() {
        let mut config = Config::from_toml_str("[chat]\napi_key = \"from-file\"").unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("GROQ_API_KEY", "from-env"),
            ("OPENAI_API_KEY", "   "),
            ("ELEVENLABS_VOICE_ID_RU", "voice-ru"),
        ]);
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.chat.api_key.as_deref(), Some("from-env"));
        assert!(config.openai.api_key.is_none());
        assert_eq!(config.elevenlabs.voice_id_ru.as_deref(), Some("voice-ru"));
    }

    #[test]
    fn rejects_unknown_default_language() {
        let config = Config::from_toml_str("[conversation]\ndefault_language = \"de\"").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_long_settle_delay() {
        let config = Config::from_toml_str("[conversation]\nsettle_delay = \"10s\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_history() {
        let config = Config::from_toml_str("[conversation]\nhistory_capacity = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nbind = \"0.0.0.0:8080\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(!config.server.bind.is_empty());
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.openai.transcription_model, "whisper-1");
    }

    #[test]
    fn redacted_masks_secrets() {
        let mut config = Config::default();
        config.auth.secret = Some("hunter2".into());
        config.elevenlabs.api_key = Some("xi".into());
        let shown = config.redacted();
        assert_eq!(shown.auth.secret.as_deref(), Some("***"));
        assert_eq!(shown.elevenlabs.api_key.as_deref(), Some("***"));
        assert!(shown.chat.api_key.is_none());
    }

    #[test]
    fn default_file_round_trips() {
        let contents = Config::default_file_contents().unwrap();
        let parsed = Config::from_toml_str(&contents).unwrap();
        assert_eq!(parsed.server.bind, "127.0.0.1:3000");
        assert_eq!(parsed.conversation.realtime_voices.ru, "alloy");
    }

    #[test]
    fn voice_map_selects_by_language() {
        let voices = ConversationConfig::default().realtime_voices;
        assert_eq!(voices.for_language(Language::Ru), "alloy");
        assert_eq!(voices.for_language(Language::Unknown), "verse");
    }
}
