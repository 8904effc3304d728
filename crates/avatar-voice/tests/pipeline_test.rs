//! End-to-end tests for the voice pipeline with scripted backends and devices.
//!
//! No audio hardware or network is needed: chat, TTS, STT, the microphone and the
//! speaker are all in-memory stand-ins, and tokio time is paused.

use async_trait::async_trait;
use avatar_voice::{
    run_recording, AudioSink, AvatarConfig, Backends, ChatMessage, ConversationSession, FaceTarget,
    MicrophoneSource, MorphTargets, PlaceholderChat, PlaceholderStt, PlaybackEvent, RecorderEvent,
    SinkStatus, SpeechClip, Spectrum, StopReason, TtsBackend, VadConfig, VisemeWeightMap,
    VoiceActivityRecorder, VoiceError, VoiceResult,
};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RATE: u32 = 16_000;
const CHUNK: usize = 320;

/// Speaker stand-in: each clip plays for a fixed number of polls and reports a loud,
/// flat spectrum while it plays.
struct ScriptedSink {
    polls_per_clip: usize,
    remaining: usize,
    started: Vec<u64>,
    overlapped: bool,
}

impl ScriptedSink {
    fn new(polls_per_clip: usize) -> Self {
        Self {
            polls_per_clip,
            remaining: 0,
            started: Vec::new(),
            overlapped: false,
        }
    }
}

impl AudioSink for ScriptedSink {
    fn start(&mut self, clip: &SpeechClip) -> VoiceResult<()> {
        if self.remaining > 0 {
            self.overlapped = true;
        }
        self.started.push(clip.sequence_index);
        self.remaining = self.polls_per_clip;
        Ok(())
    }

    fn poll(&mut self) -> SinkStatus {
        match self.remaining {
            0 => SinkStatus::Idle,
            1 => {
                self.remaining = 0;
                SinkStatus::Finished
            }
            _ => {
                self.remaining -= 1;
                SinkStatus::Playing
            }
        }
    }

    fn halt(&mut self) {
        self.remaining = 0;
    }

    fn spectrum(&self) -> Option<Spectrum> {
        (self.remaining > 0).then(|| Spectrum {
            magnitudes: vec![0.5; 128],
            sample_rate: RATE,
        })
    }
}

/// TTS whose latency depends on the sentence, so later sentences can finish first.
struct ScriptedTts {
    delays: Vec<(&'static str, u64)>,
    broken: HashSet<&'static str>,
}

#[async_trait]
impl TtsBackend for ScriptedTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let delay = self
            .delays
            .iter()
            .find(|(prefix, _)| text.starts_with(prefix))
            .map(|(_, ms)| *ms)
            .unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if self.broken.iter().any(|b| text.starts_with(b)) {
            return Err(VoiceError::Synthesis(format!("voice unavailable for {:?}", text)));
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// Face that remembers how far the jaw ever opened.
struct PeakFace {
    targets: MorphTargets,
    peak_jaw: f32,
}

impl FaceTarget for PeakFace {
    fn shape_channels(&self) -> HashSet<String> {
        self.targets.shape_channels()
    }

    fn apply(&mut self, weights: &VisemeWeightMap) {
        self.peak_jaw = self.peak_jaw.max(weights.get("jawOpen"));
        self.targets.apply(weights);
    }
}

#[derive(Default)]
struct ScriptedMicrophone {
    frames: VecDeque<Vec<f32>>,
    open: bool,
    closes: usize,
}

impl ScriptedMicrophone {
    /// `voiced` chunks of a tone, then nothing.
    fn speaking(voiced: usize) -> Self {
        let tone: Vec<f32> = (0..CHUNK)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / RATE as f32).sin())
            .collect();
        Self {
            frames: std::iter::repeat(tone).take(voiced).collect(),
            ..Default::default()
        }
    }
}

impl MicrophoneSource for ScriptedMicrophone {
    fn open(&mut self) -> VoiceResult<()> {
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> VoiceResult<Vec<f32>> {
        Ok(self.frames.pop_front().unwrap_or_default())
    }

    fn close(&mut self) {
        if self.open {
            self.closes += 1;
        }
        self.open = false;
    }

    fn sample_rate(&self) -> u32 {
        RATE
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn vad() -> VadConfig {
    VadConfig {
        silence_threshold_db: -60.0,
        silence_duration_ms: 300,
        vad_enabled: true,
        max_recording_ms: 10_000,
    }
}

fn session<F: FaceTarget>(
    chat: &str,
    tts: ScriptedTts,
    face: F,
) -> ConversationSession<ScriptedSink, F> {
    let backends = Backends {
        chat: Arc::new(PlaceholderChat::with_response(chat)),
        tts: Arc::new(tts),
        ..Backends::placeholders()
    };
    ConversationSession::new(&AvatarConfig::default(), backends, ScriptedSink::new(4), face)
}

fn started(rx: &mut mpsc::UnboundedReceiver<PlaybackEvent>) -> Vec<u64> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PlaybackEvent::ClipStarted { sequence_index } = event {
            out.push(sequence_index);
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_sentences_play_in_order_when_synthesis_finishes_out_of_order() {
    init_tracing();
    let tts = ScriptedTts {
        delays: vec![("Bonjour", 400), ("That", 150), ("Try", 20)],
        broken: HashSet::new(),
    };
    let face = PeakFace {
        targets: MorphTargets::ready_player_me(),
        peak_jaw: 0.0,
    };
    let mut s = session(
        "Bonjour means hello. That is the formal greeting! Try saying it now?",
        tts,
        face,
    );
    let mut events = s.take_playback_events().unwrap();

    let reply = s.respond("How do I say hello in French?").await.unwrap();
    s.finish_speaking().await;

    assert!(reply.starts_with("Bonjour means hello."));
    assert_eq!(started(&mut events), vec![0, 1, 2]);
    assert_eq!(s.playback().sink().started, vec![0, 1, 2]);
    assert!(!s.playback().sink().overlapped);
    assert!(s.lipsync().face().peak_jaw > 0.2);
    assert_eq!(s.lipsync().face().targets.value("jawOpen"), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn test_failed_sentence_is_skipped_without_stalling() {
    let tts = ScriptedTts {
        delays: vec![],
        broken: ["Second"].into_iter().collect(),
    };
    let mut s = session(
        "First one. Second one. Third one.",
        tts,
        MorphTargets::ready_player_me(),
    );
    let mut events = s.take_playback_events().unwrap();

    s.respond("go").await.unwrap();
    s.finish_speaking().await;

    assert_eq!(s.playback().sink().started, vec![0, 2]);
    let mut skipped = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PlaybackEvent::ClipSkipped { sequence_index } = event {
            skipped.push(sequence_index);
        }
    }
    assert_eq!(skipped, vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_then_next_turn_uses_fresh_indices() {
    let tts = ScriptedTts {
        delays: vec![],
        broken: HashSet::new(),
    };
    let mut s = session("One. Two. Three.", tts, MorphTargets::ready_player_me());

    s.respond("first").await.unwrap();
    assert!(s.is_speaking());
    assert!(s.interrupt() > 0);
    assert!(!s.is_speaking());
    assert_eq!(s.interrupt(), 0);

    s.respond("second").await.unwrap();
    s.finish_speaking().await;
    let started = &s.playback().sink().started;
    assert_eq!(&started[started.len() - 3..], &[3, 4, 5]);
    assert_eq!(s.history().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_recording_is_transcribed_and_answered() {
    init_tracing();
    let (mut recorder, mut events) = VoiceActivityRecorder::new(ScriptedMicrophone::speaking(8));
    let started = tokio::time::Instant::now();
    let audio = run_recording(&mut recorder, vad(), Duration::from_millis(20), CancellationToken::new())
        .await
        .unwrap()
        .expect("speech was captured");
    assert!(audio.voice_detected);
    assert_eq!(recorder.microphone().closes, 1);
    // Eight voiced ticks (last at 140 ms), then 300 ms of silence.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(440) && elapsed < Duration::from_millis(500));
    let mut stop_reason = None;
    while let Ok(event) = events.try_recv() {
        if let RecorderEvent::AutoStopped { reason } = event {
            stop_reason = Some(reason);
        }
    }
    assert_eq!(stop_reason, Some(StopReason::Silence));

    let backends = Backends {
        stt: Arc::new(PlaceholderStt::with_response("How do I say thank you?")),
        ..Backends::placeholders()
    };
    let mut s = ConversationSession::new(
        &AvatarConfig::default(),
        backends,
        ScriptedSink::new(2),
        MorphTargets::ready_player_me(),
    );
    let reply = s.respond_to_recording(&audio).await.unwrap();
    s.finish_speaking().await;

    assert!(reply.starts_with("You said: How do I say thank you."));
    assert_eq!(s.history()[0], ChatMessage::user("How do I say thank you?"));
    assert!(!s.playback().sink().started.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_voice_loop_answers_then_stops_on_cancel() {
    init_tracing();
    let (mut recorder, _events) = VoiceActivityRecorder::new(ScriptedMicrophone::speaking(8));
    let backends = Backends {
        stt: Arc::new(PlaceholderStt::with_response("Hello there")),
        ..Backends::placeholders()
    };
    let mut s = ConversationSession::new(
        &AvatarConfig::default(),
        backends,
        ScriptedSink::new(3),
        MorphTargets::ready_player_me(),
    );
    let cancel = CancellationToken::new();

    let stopper = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        }
    };
    let (result, ()) = tokio::join!(s.run_voice_loop(&mut recorder, vad(), cancel.clone()), stopper);

    result.unwrap();
    assert_eq!(s.history().len(), 2);
    assert!(!s.is_speaking());
    assert!(!recorder.microphone().is_open());
}
