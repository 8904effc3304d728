//! **Speech-to-Text (STT)** — one request per finalized recording.
//!
//! Implement `SttBackend` for any transcription service. `OpenAiStt` uploads the WAV to an
//! OpenAI-compatible `/audio/transcriptions` endpoint (Whisper).

use crate::config::BackendConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::recorder::CapturedAudio;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info};

/// Backend for converting a finalized recording to text.
#[async_trait]
pub trait SttBackend: Send + Sync {
    /// Transcribe one recording. Returns an empty string if nothing was recognized.
    async fn transcribe(&self, audio: &CapturedAudio) -> VoiceResult<String>;
}

/// Placeholder STT: returns a fixed string. Use for testing the voice loop without an API.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self { response: Some(s.into()) }
    }
}

#[async_trait]
impl SttBackend for PlaceholderStt {
    async fn transcribe(&self, audio: &CapturedAudio) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        Ok(format!(
            "[STT placeholder: {:.1}s at {} Hz]",
            audio.duration.as_secs_f32(),
            audio.sample_rate
        ))
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// OpenAI-compatible transcription (`whisper-1`, language `en` by default).
#[derive(Debug, Clone)]
pub struct OpenAiStt {
    url: String,
    api_key: String,
    model: String,
    language: String,
    client: reqwest::Client,
}

impl OpenAiStt {
    pub fn new(config: &BackendConfig) -> VoiceResult<Self> {
        Ok(Self {
            url: config.endpoint("audio/transcriptions"),
            api_key: config.require_api_key()?.to_string(),
            model: config.stt_model.clone(),
            language: config.stt_language.clone(),
            client: config.http_client()?,
        })
    }
}

#[async_trait]
impl SttBackend for OpenAiStt {
    async fn transcribe(&self, audio: &CapturedAudio) -> VoiceResult<String> {
        if audio.wav.is_empty() {
            return Ok(String::new());
        }
        info!("STT: transcribing {:.1}s recording ({} bytes)", audio.duration.as_secs_f32(), audio.wav.len());
        let part = reqwest::multipart::Part::bytes(audio.wav.clone())
            .file_name("recording.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.language.clone());
        let res = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            error!("STT: HTTP {}: {}", status, body);
            return Err(VoiceError::Transcription(format!("STT API error {}: {}", status, body)));
        }
        let json: TranscriptionResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let text = json.text.trim().to_string();
        info!("STT: transcription result: {:?}", text);
        Ok(text)
    }
}
