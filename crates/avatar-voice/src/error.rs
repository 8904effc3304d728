//! Error types for the avatar voice pipeline

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Message shown to the user when a whole turn has to be abandoned.
pub const TURN_FAILED_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";

/// Errors that can occur in the voice pipeline
#[derive(Error, Debug)]
pub enum VoiceError {
    /// The streamed model reply broke mid-turn.
    #[error("Input stream error: {0}")]
    InputStream(String),

    /// Speech synthesis failed for a single sentence.
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// Speech-to-text failed for a finalized recording.
    #[error("Transcription error: {0}")]
    Transcription(String),

    /// A single clip could not be decoded or played.
    #[error("Audio playback error: {0}")]
    Playback(String),

    /// Microphone access was denied or could not be acquired.
    #[error("Microphone permission error: {0}")]
    Permission(String),

    /// The capture device failed while recording.
    #[error("Audio capture error: {0}")]
    Capture(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Turn-level failures reset the conversation to a ready state and are shown to the user.
    /// Sentence- and clip-level failures are logged and the pipeline keeps going.
    pub fn is_turn_level(&self) -> bool {
        matches!(
            self,
            VoiceError::InputStream(_)
                | VoiceError::Transcription(_)
                | VoiceError::Permission(_)
                | VoiceError::Capture(_)
        )
    }

    /// Short message suitable for the chat transcript.
    pub fn user_message(&self) -> &'static str {
        match self {
            VoiceError::Permission(_) => "Could not access microphone. Please grant permission.",
            VoiceError::Capture(_) => "The microphone stopped working. Please try recording again.",
            VoiceError::Transcription(_) => "Sorry, I couldn't understand that recording. Please try again.",
            VoiceError::Config(_) => "The voice settings are invalid. Please check the configuration.",
            _ => TURN_FAILED_MESSAGE,
        }
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::Permission(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::Permission(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::Permission(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::Permission(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Capture(err.to_string())
    }
}

impl From<toml::de::Error> for VoiceError {
    fn from(err: toml::de::Error) -> Self {
        VoiceError::Config(err.to_string())
    }
}
