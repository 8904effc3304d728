//! Avatar voice configuration, loaded from `.env` / environment or a TOML file.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | AVATAR_SILENCE_THRESHOLD_DB | -50 | Frames louder than this count as voiced. |
//! | AVATAR_SILENCE_DURATION_MS | 1000 | Silence after speech before recording auto-stops. |
//! | AVATAR_VAD_ENABLED | true | Disable to record until stopped manually. |
//! | AVATAR_MAX_RECORDING_MS | 30000 | Hard cap on a single recording. |
//! | AVATAR_TICK_HZ | 60 | Frame rate of the playback / VAD / lip-sync tick. |
//! | AVATAR_API_URL | https://api.openai.com/v1 | OpenAI-compatible base URL. |
//! | AVATAR_API_KEY / OPENAI_API_KEY | — | Bearer key for chat, TTS and STT. |
//! | AVATAR_CHAT_MODEL | gpt-4o | Streaming chat model. |
//! | AVATAR_TTS_MODEL / AVATAR_TTS_VOICE | tts-1 / alloy | Speech synthesis. |
//! | AVATAR_STT_MODEL / AVATAR_STT_LANGUAGE | whisper-1 / en | Transcription. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Quietest level the energy scale can report; zero energy maps here.
pub const ENERGY_FLOOR_DB: f32 = -100.0;

/// Upper bound on the frame tick so polling cannot run away.
pub const MAX_TICK_HZ: u32 = 120;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI Avatar language tutor. You help users learn languages or topics. Keep your responses concise and conversational. You are talking to the user face-to-face.";

fn default_true() -> bool {
    true
}

fn default_silence_threshold_db() -> f32 {
    -50.0
}

fn default_silence_duration_ms() -> u32 {
    1000
}

fn default_max_recording_ms() -> u32 {
    30_000
}

fn default_tick_hz() -> u32 {
    60
}

/// Voice-activity detection settings for one recording session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadConfig {
    /// Frames with energy above this (dB) are voiced.
    #[serde(default = "default_silence_threshold_db")]
    pub silence_threshold_db: f32,
    /// Silence after the last voiced frame before the recording stops itself.
    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u32,
    /// When false the recorder never stops on silence and never discards its capture.
    #[serde(default = "default_true")]
    pub vad_enabled: bool,
    /// Recording stops once it reaches this length, voiced or not.
    #[serde(default = "default_max_recording_ms")]
    pub max_recording_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_threshold_db: default_silence_threshold_db(),
            silence_duration_ms: default_silence_duration_ms(),
            vad_enabled: true,
            max_recording_ms: default_max_recording_ms(),
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> VoiceResult<()> {
        if !self.silence_threshold_db.is_finite()
            || self.silence_threshold_db < ENERGY_FLOOR_DB
            || self.silence_threshold_db > 0.0
        {
            return Err(VoiceError::Config(format!(
                "silence_threshold_db must be within [{}, 0] dB, got {}",
                ENERGY_FLOOR_DB, self.silence_threshold_db
            )));
        }
        if self.silence_duration_ms == 0 {
            return Err(VoiceError::Config(
                "silence_duration_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_recording_ms == 0 {
            return Err(VoiceError::Config(
                "max_recording_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.silence_duration_ms))
    }

    pub fn max_recording(&self) -> Duration {
        Duration::from_millis(u64::from(self.max_recording_ms))
    }
}

fn default_smoothing_factor() -> f32 {
    0.35
}

fn default_decay_factor() -> f32 {
    0.7
}

fn default_activity_floor() -> f32 {
    0.05
}

fn default_fft_size() -> usize {
    256
}

/// Tuning for the viseme engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LipSyncConfig {
    /// Lerp factor toward each frame's target.
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f32,
    /// Per-frame multiplier applied to shapes that are not targeted.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f32,
    /// Mean band activity below which the mouth only decays.
    #[serde(default = "default_activity_floor")]
    pub activity_floor: f32,
    /// Window length of the playback spectrum tap (bins = fft_size / 2).
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
}

impl Default for LipSyncConfig {
    fn default() -> Self {
        Self {
            smoothing_factor: default_smoothing_factor(),
            decay_factor: default_decay_factor(),
            activity_floor: default_activity_floor(),
            fft_size: default_fft_size(),
        }
    }
}

impl LipSyncConfig {
    pub fn validate(&self) -> VoiceResult<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.smoothing_factor) || !unit.contains(&self.decay_factor) {
            return Err(VoiceError::Config(format!(
                "smoothing ({}) and decay ({}) factors must be within [0, 1]",
                self.smoothing_factor, self.decay_factor
            )));
        }
        if !unit.contains(&self.activity_floor) {
            return Err(VoiceError::Config(format!(
                "activity_floor must be within [0, 1], got {}",
                self.activity_floor
            )));
        }
        if self.fft_size < 16 || !self.fft_size.is_power_of_two() {
            return Err(VoiceError::Config(format!(
                "fft_size must be a power of two >= 16, got {}",
                self.fft_size
            )));
        }
        Ok(())
    }
}

fn default_api_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_tts_voice() -> String {
    "alloy".to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

fn default_stt_language() -> String {
    "en".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Settings for the OpenAI-compatible chat, TTS and STT services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL without trailing slash.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Bearer key. `None` selects the placeholder backends.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    #[serde(default = "default_stt_language")]
    pub stt_language: String,
    /// Prepended to every chat request.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            api_key: None,
            chat_model: default_chat_model(),
            tts_model: default_tts_model(),
            tts_voice: default_tts_voice(),
            stt_model: default_stt_model(),
            stt_language: default_stt_language(),
            system_prompt: default_system_prompt(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Shared HTTP client for the chat, TTS and STT backends.
    pub fn http_client(&self) -> VoiceResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.request_timeout())
            .build()
            .map_err(|e| VoiceError::Config(format!("HTTP client: {}", e)))
    }

    /// Endpoint under the configured base URL, e.g. `endpoint("audio/speech")`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// Key required by the production backends.
    pub fn require_api_key(&self) -> VoiceResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| VoiceError::Config("AVATAR_API_KEY or OPENAI_API_KEY is not set".to_string()))
    }
}

/// Top-level configuration for the voice pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarConfig {
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub lipsync: LipSyncConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Frame tick rate shared by playback, VAD and lip sync.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            lipsync: LipSyncConfig::default(),
            backend: BackendConfig::default(),
            tick_hz: default_tick_hz(),
        }
    }
}

impl AvatarConfig {
    /// Load from environment. Unset or unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        let vad_defaults = VadConfig::default();
        let backend_defaults = BackendConfig::default();
        Self {
            vad: VadConfig {
                silence_threshold_db: env_parse("AVATAR_SILENCE_THRESHOLD_DB", vad_defaults.silence_threshold_db),
                silence_duration_ms: env_parse("AVATAR_SILENCE_DURATION_MS", vad_defaults.silence_duration_ms),
                vad_enabled: env_bool("AVATAR_VAD_ENABLED", true),
                max_recording_ms: env_parse("AVATAR_MAX_RECORDING_MS", vad_defaults.max_recording_ms),
            },
            lipsync: LipSyncConfig::default(),
            backend: BackendConfig {
                api_base_url: env_opt_string("AVATAR_API_URL").unwrap_or(backend_defaults.api_base_url),
                api_key: env_opt_string("AVATAR_API_KEY").or_else(|| env_opt_string("OPENAI_API_KEY")),
                chat_model: env_opt_string("AVATAR_CHAT_MODEL").unwrap_or(backend_defaults.chat_model),
                tts_model: env_opt_string("AVATAR_TTS_MODEL").unwrap_or(backend_defaults.tts_model),
                tts_voice: env_opt_string("AVATAR_TTS_VOICE").unwrap_or(backend_defaults.tts_voice),
                stt_model: env_opt_string("AVATAR_STT_MODEL").unwrap_or(backend_defaults.stt_model),
                stt_language: env_opt_string("AVATAR_STT_LANGUAGE").unwrap_or(backend_defaults.stt_language),
                system_prompt: env_opt_string("AVATAR_SYSTEM_PROMPT").unwrap_or(backend_defaults.system_prompt),
                request_timeout_secs: env_parse("AVATAR_REQUEST_TIMEOUT_SECS", backend_defaults.request_timeout_secs),
            },
            tick_hz: env_parse("AVATAR_TICK_HZ", default_tick_hz()),
        }
    }

    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(content: &str) -> VoiceResult<Self> {
        let config: AvatarConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load_from_path(path: &Path) -> VoiceResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        self.vad.validate()?;
        self.lipsync.validate()?;
        if self.tick_hz == 0 {
            return Err(VoiceError::Config("tick_hz must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Interval between frame ticks, capped to `MAX_TICK_HZ`.
    pub fn tick_interval(&self) -> Duration {
        let hz = self.tick_hz.clamp(1, MAX_TICK_HZ);
        Duration::from_micros(1_000_000 / u64::from(hz))
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim();
            if v.is_empty() {
                default
            } else {
                v.eq_ignore_ascii_case("true") || v == "1"
            }
        }
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AvatarConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_hz, 60);
        assert_eq!(config.vad.silence_duration_ms, 1000);
        assert_eq!(config.backend.tts_voice, "alloy");
    }

    #[test]
    fn test_rejects_positive_threshold() {
        let vad = VadConfig {
            silence_threshold_db: 6.0,
            ..Default::default()
        };
        assert!(matches!(vad.validate(), Err(VoiceError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_silence_duration() {
        let vad = VadConfig {
            silence_duration_ms: 0,
            ..Default::default()
        };
        assert!(vad.validate().is_err());
    }

    #[test]
    fn test_rejects_non_power_of_two_fft() {
        let lipsync = LipSyncConfig {
            fft_size: 300,
            ..Default::default()
        };
        assert!(lipsync.validate().is_err());
    }

    #[test]
    fn test_tick_interval_is_capped() {
        let config = AvatarConfig {
            tick_hz: 10_000,
            ..Default::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_micros(1_000_000 / 120));
    }

    #[test]
    fn test_toml_sections_fill_defaults() {
        let config = AvatarConfig::from_toml_str(
            r#"
            tick_hz = 30

            [vad]
            silence_threshold_db = -42.5
            vad_enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.tick_hz, 30);
        assert!(!config.vad.vad_enabled);
        assert_eq!(config.vad.silence_duration_ms, 1000);
        assert_eq!(config.backend.chat_model, "gpt-4o");
    }

    #[test]
    fn test_toml_invalid_threshold_is_config_error() {
        let result = AvatarConfig::from_toml_str("[vad]\nsilence_threshold_db = 12.0\n");
        assert!(matches!(result, Err(VoiceError::Config(_))));
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        let backend = BackendConfig {
            api_base_url: "http://localhost:8080/v1/".to_string(),
            ..Default::default()
        };
        assert_eq!(backend.endpoint("/audio/speech"), "http://localhost:8080/v1/audio/speech");
        assert!(backend.require_api_key().is_err());
    }
}
