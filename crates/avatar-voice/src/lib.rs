//! # Avatar Voice - Real-Time Voice Pipeline for a Talking Avatar
//!
//! Streams a chat reply into speech sentence by sentence, plays the clips strictly in order,
//! records the user's answer with silence-based auto-stop and drives the avatar's mouth from
//! the live playback spectrum.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Conversation Session                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐    │
//! │  │  Chat (SSE)  │→ │  Segmenter   │→ │ TTS (per sentence,   │    │
//! │  │   deltas     │  │  (. ! ?)     │  │  concurrent)         │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘    │
//! │                                                ↓                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐    │
//! │  │ Face (morph  │← │   Viseme     │← │ Playback Coordinator │    │
//! │  │  targets)    │  │   Lip Sync   │  │ (ordered, rodio tap) │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘    │
//! │                                                                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐    │
//! │  │  Microphone  │→ │  Energy VAD  │→ │ Recorder → WAV → STT │    │
//! │  │    (cpal)    │  │ (silence gap)│  │                      │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one task and advances on a frame tick (`AvatarConfig::tick_hz`);
//! network requests are polled alongside the tick so playback and lip sync never stall.

pub mod chat;
pub mod config;
pub mod conversation;
pub mod error;
pub mod lipsync;
pub mod microphone;
pub mod playback;
pub mod recorder;
pub mod segmenter;
pub mod sink;
pub mod spectrum;
pub mod stt;
pub mod tts;
pub mod vad;

pub use chat::{ChatBackend, ChatMessage, OpenAiChat, PlaceholderChat, Role, TextDeltaStream};
pub use config::{AvatarConfig, BackendConfig, LipSyncConfig, VadConfig};
pub use conversation::{Backends, ConversationSession, MAX_CAPTURE_FAILURES};
pub use error::{VoiceError, VoiceResult, TURN_FAILED_MESSAGE};
pub use lipsync::{FaceTarget, LipSyncDriver, MorphTargets, VisemeLipSyncEngine, VisemeWeightMap};
pub use microphone::{CpalMicrophone, MicrophoneSource};
pub use playback::{AudioPlaybackCoordinator, ClipState, PlaybackEvent, SpeechClip};
pub use recorder::{
    run_recording, CapturedAudio, RecorderEvent, RecorderState, StopOutcome, StopReason,
    VoiceActivityRecorder,
};
pub use segmenter::{SentenceUnit, TextStreamSegmenter};
pub use sink::{AudioSink, RodioSink, SinkStatus};
pub use spectrum::{Spectrum, SpectrumAnalyzer};
pub use stt::{OpenAiStt, PlaceholderStt, SttBackend};
pub use tts::{OpenAiTts, PlaceholderTts, TtsBackend};
pub use vad::{VadSignal, VoiceActivityDetector};
