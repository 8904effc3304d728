//! **Speech synthesis** — one request per sentence, text in, encoded audio out.
//!
//! `OpenAiTts` calls an OpenAI-compatible `/audio/speech` endpoint and returns MP3 bytes.
//! `PlaceholderTts` needs no network: it renders a short tone per sentence so the playback
//! and lip-sync path can be exercised offline.

use crate::config::BackendConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::recorder::samples_to_wav;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error};

/// Turns text into playable audio bytes (MP3 or WAV).
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize one sentence. Failures are `VoiceError::Synthesis` and affect only that sentence.
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'a str,
}

/// OpenAI-compatible TTS (`tts-1` / `alloy` by default).
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    url: String,
    api_key: String,
    model: String,
    voice: String,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(config: &BackendConfig) -> VoiceResult<Self> {
        Ok(Self {
            url: config.endpoint("audio/speech"),
            api_key: config.require_api_key()?.to_string(),
            model: config.tts_model.clone(),
            voice: config.tts_voice.clone(),
            client: config.http_client()?,
        })
    }

    /// Use a different voice (alloy, echo, fable, onyx, nova, shimmer).
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

#[async_trait]
impl TtsBackend for OpenAiTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::Synthesis("empty text".to_string()));
        }
        let body = SpeechRequest {
            model: &self.model,
            voice: &self.voice,
            input: text,
            response_format: "mp3",
        };
        let res = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            error!("TTS: HTTP {}: {}", status, body);
            return Err(VoiceError::Synthesis(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        debug!("TTS: {} bytes for {} chars", bytes.len(), text.len());
        Ok(bytes.to_vec())
    }
}

/// Offline TTS: a soft tone whose length follows the sentence length.
#[derive(Debug, Clone)]
pub struct PlaceholderTts {
    pub sample_rate: u32,
    /// Tone frequency in Hz; the default sits in the mid-low speech band.
    pub frequency: f32,
    pub millis_per_char: u32,
}

impl Default for PlaceholderTts {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            frequency: 440.0,
            millis_per_char: 45,
        }
    }
}

impl PlaceholderTts {
    pub fn new() -> Self {
        Self::default()
    }

    fn render(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let chars = text.chars().count().max(1) as u64;
        let millis = (chars * u64::from(self.millis_per_char)).clamp(200, 6_000);
        let len = (u64::from(self.sample_rate) * millis / 1000) as usize;
        let rate = self.sample_rate as f32;
        let fade = (len / 10).max(1);
        let samples: Vec<f32> = (0..len)
            .map(|i| {
                let envelope = (i.min(len - i) as f32 / fade as f32).min(1.0);
                0.3 * envelope * (2.0 * std::f32::consts::PI * self.frequency * i as f32 / rate).sin()
            })
            .collect();
        samples_to_wav(&samples, self.sample_rate).map_err(|e| VoiceError::Synthesis(e.to_string()))
    }
}

#[async_trait]
impl TtsBackend for PlaceholderTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        if text.trim().is_empty() {
            return Err(VoiceError::Synthesis("empty text".to_string()));
        }
        self.render(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_placeholder_renders_wav_scaled_by_text() {
        let tts = PlaceholderTts::new();
        let short = tts.synthesize("Hi there.").await.unwrap();
        let long = tts.synthesize("This sentence is quite a bit longer than the first.").await.unwrap();
        assert_eq!(&short[..4], b"RIFF");
        assert!(long.len() > short.len());
    }

    #[tokio::test]
    async fn test_placeholder_rejects_blank_text() {
        let err = PlaceholderTts::new().synthesize("   ").await.unwrap_err();
        assert!(matches!(err, VoiceError::Synthesis(_)));
        assert!(!err.is_turn_level());
    }

    #[test]
    fn test_speech_request_shape() {
        let body = serde_json::to_value(SpeechRequest {
            model: "tts-1",
            voice: "alloy",
            input: "Hello.",
            response_format: "mp3",
        })
        .unwrap();
        assert_eq!(body["voice"], "alloy");
        assert_eq!(body["input"], "Hello.");
    }

    #[test]
    fn test_voice_override() {
        let config = BackendConfig {
            api_key: Some("sk-test".into()),
            ..Default::default()
        };
        let tts = OpenAiTts::new(&config).unwrap().with_voice("nova");
        assert_eq!(tts.voice, "nova");
        assert_eq!(tts.url, "https://api.openai.com/v1/audio/speech");
    }
}
