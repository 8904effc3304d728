//! **Voice activity recorder** — push-to-talk capture that ends itself on silence.
//!
//! ```text
//! Idle ──start──► Recording ──(silence | max length | stop | cancel)──► Stopping ──► Idle
//!                     │                                                   │
//!                     └── device fault: CaptureError, mic released ──────►┘
//! ```
//!
//! Each tick drains new microphone samples, measures their energy and feeds the
//! [`VoiceActivityDetector`]. On stop the buffered samples become one 16-bit mono WAV.
//! With VAD enabled, a capture in which no frame was ever voiced is discarded.

use crate::config::{VadConfig, ENERGY_FLOOR_DB};
use crate::error::{VoiceError, VoiceResult};
use crate::microphone::MicrophoneSource;
use crate::spectrum::SpectrumAnalyzer;
use crate::vad::{VadSignal, VoiceActivityDetector};
use chrono::{DateTime, Utc};
use std::io::Cursor;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Window used to measure energy; a tick's chunk is covered by consecutive windows.
const VAD_WINDOW: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    /// Finalizing; only observable from inside `stop`.
    Stopping,
}

/// Why a recording ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    /// Silence after speech outlasted `silence_duration_ms`.
    Silence,
    MaxDuration,
}

/// Events emitted by the recorder
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Started { vad_enabled: bool },
    /// Speech indicator for the UI; `false` while the silence countdown runs.
    Listening { active: bool },
    AutoStopped { reason: StopReason },
    /// Nothing voiced was heard; the capture was dropped.
    Discarded,
    Captured { duration: Duration },
}

/// Finalized recording, ready for transcription.
#[derive(Debug, Clone)]
pub struct CapturedAudio {
    /// 16-bit PCM mono WAV
    pub wav: Vec<u8>,
    pub sample_rate: u32,
    pub duration: Duration,
    pub voice_detected: bool,
    pub captured_at: DateTime<Utc>,
}

/// Result of a recording that ended on its own.
#[derive(Debug)]
pub struct StopOutcome {
    pub reason: StopReason,
    /// `None` when the capture was discarded.
    pub audio: Option<CapturedAudio>,
}

/// State of the recording in progress.
#[derive(Debug)]
pub struct RecordingSession {
    config: VadConfig,
    detector: VoiceActivityDetector,
    samples: Vec<f32>,
    sample_rate: u32,
    started_at: Instant,
    /// Clock reading of the latest analysis.
    last_tick: Instant,
}

impl RecordingSession {
    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn voice_detected(&self) -> bool {
        self.detector.voice_detected()
    }

    pub fn silence_deadline(&self) -> Option<Instant> {
        self.detector.silence_deadline()
    }

    pub fn buffered_samples(&self) -> usize {
        self.samples.len()
    }
}

/// Records from a [`MicrophoneSource`] with VAD-driven auto-stop.
pub struct VoiceActivityRecorder<M: MicrophoneSource> {
    mic: M,
    state: RecorderState,
    session: Option<RecordingSession>,
    analyzer: SpectrumAnalyzer,
    event_tx: mpsc::UnboundedSender<RecorderEvent>,
}

impl<M: MicrophoneSource> VoiceActivityRecorder<M> {
    pub fn new(mic: M) -> (Self, mpsc::UnboundedReceiver<RecorderEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let recorder = Self {
            mic,
            state: RecorderState::Idle,
            session: None,
            analyzer: SpectrumAnalyzer::new(VAD_WINDOW),
            event_tx,
        };
        (recorder, event_rx)
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    pub fn microphone(&self) -> &M {
        &self.mic
    }

    /// Acquire the microphone and start recording now.
    pub fn start(&mut self, config: VadConfig) -> VoiceResult<()> {
        self.start_at(config, Instant::now())
    }

    /// Like `start`, with an explicit clock reading for the session start.
    pub fn start_at(&mut self, config: VadConfig, now: Instant) -> VoiceResult<()> {
        if self.state != RecorderState::Idle {
            warn!("Recorder: start while {:?}, ignoring", self.state);
            return Ok(());
        }
        config.validate()?;
        self.mic.open().map_err(|e| match e {
            VoiceError::Permission(_) => e,
            other => VoiceError::Permission(other.to_string()),
        })?;

        self.session = Some(RecordingSession {
            detector: VoiceActivityDetector::new(&config),
            samples: Vec::new(),
            sample_rate: self.mic.sample_rate(),
            started_at: now,
            last_tick: now,
            config,
        });
        self.state = RecorderState::Recording;
        let vad_enabled = self.session.as_ref().map(|s| s.config.vad_enabled).unwrap_or(false);
        info!("🎙️ Recording started (VAD {})", if vad_enabled { "on" } else { "off" });
        self.emit(RecorderEvent::Started { vad_enabled });
        Ok(())
    }

    /// Analyze what the microphone captured since the last tick.
    ///
    /// Returns `Some` when the recording ended on its own (silence or max length).
    /// A device fault ends the recording with `VoiceError::Capture`.
    pub fn tick(&mut self, now: Instant) -> VoiceResult<Option<StopOutcome>> {
        if self.state != RecorderState::Recording {
            return Ok(None);
        }
        let chunk = match self.mic.read() {
            Ok(chunk) => chunk,
            Err(e) => return Err(self.abort(e)),
        };

        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };
        session.samples.extend_from_slice(&chunk);
        session.last_tick = now;

        let mut auto_stop = None;
        if session.config.vad_enabled {
            // A tick without samples is analysed as silence at the energy floor.
            let energy_db = chunk_energy_db(&self.analyzer, &chunk);
            match session.detector.observe(now, energy_db) {
                Some(VadSignal::SpeechStarted) | Some(VadSignal::SpeechResumed) => {
                    self.emit(RecorderEvent::Listening { active: true });
                }
                Some(VadSignal::SilenceStarted { .. }) => {
                    self.emit(RecorderEvent::Listening { active: false });
                }
                _ => {}
            }
            if let Some(session) = self.session.as_mut() {
                if session.detector.poll(now) == Some(VadSignal::SilenceElapsed) {
                    auto_stop = Some(StopReason::Silence);
                }
            }
        }
        if auto_stop.is_none() {
            if let Some(session) = self.session.as_ref() {
                if now.saturating_duration_since(session.started_at) >= session.config.max_recording() {
                    auto_stop = Some(StopReason::MaxDuration);
                }
            }
        }

        match auto_stop {
            None => Ok(None),
            Some(reason) => {
                info!("Recorder: auto-stop ({:?})", reason);
                self.emit(RecorderEvent::AutoStopped { reason });
                let audio = self.finish(reason)?;
                Ok(Some(StopOutcome { reason, audio }))
            }
        }
    }

    /// Stop recording and return the capture, unless it was discarded.
    /// No-op when idle.
    pub fn stop(&mut self) -> VoiceResult<Option<CapturedAudio>> {
        if self.state != RecorderState::Recording {
            return Ok(None);
        }
        self.finish(StopReason::Manual)
    }

    /// Release the microphone without producing a capture.
    pub fn cancel(&mut self) {
        if self.state == RecorderState::Idle {
            return;
        }
        self.mic.close();
        self.session = None;
        self.state = RecorderState::Idle;
        debug!("Recorder: cancelled");
    }

    fn finish(&mut self, reason: StopReason) -> VoiceResult<Option<CapturedAudio>> {
        self.state = RecorderState::Stopping;
        debug!("Recorder: stopping ({:?})", reason);
        let tail = self.mic.read();
        self.mic.close();
        self.state = RecorderState::Idle;

        let Some(mut session) = self.session.take() else {
            return Ok(None);
        };
        match tail {
            Ok(samples) => {
                if session.config.vad_enabled && !samples.is_empty() {
                    let energy_db = chunk_energy_db(&self.analyzer, &samples);
                    session.detector.observe(session.last_tick, energy_db);
                }
                session.samples.extend(samples);
            }
            Err(e) => warn!("Recorder: dropping final samples: {}", e),
        }

        let voice_detected = session.detector.voice_detected();
        if session.config.vad_enabled && !voice_detected {
            info!("Recorder: no speech detected, discarding {} samples", session.samples.len());
            self.emit(RecorderEvent::Discarded);
            return Ok(None);
        }

        let sample_rate = session.sample_rate.max(1);
        let duration = Duration::from_secs_f64(session.samples.len() as f64 / f64::from(sample_rate));
        let wav = samples_to_wav(&session.samples, sample_rate)?;
        info!("🎙️ Recording captured ({:.1}s, {} bytes)", duration.as_secs_f32(), wav.len());
        self.emit(RecorderEvent::Captured { duration });
        Ok(Some(CapturedAudio {
            wav,
            sample_rate,
            duration,
            voice_detected,
            captured_at: Utc::now(),
        }))
    }

    fn abort(&mut self, err: VoiceError) -> VoiceError {
        warn!("Recorder: capture failed: {}", err);
        self.cancel();
        match err {
            VoiceError::Capture(_) => err,
            other => VoiceError::Capture(other.to_string()),
        }
    }

    fn emit(&self, event: RecorderEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("Recorder: event receiver dropped");
        }
    }
}

impl<M: MicrophoneSource> Drop for VoiceActivityRecorder<M> {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Loudest window of `chunk`, in dB. Empty input is the energy floor.
fn chunk_energy_db(analyzer: &SpectrumAnalyzer, chunk: &[f32]) -> f32 {
    chunk
        .chunks(VAD_WINDOW)
        .map(|window| analyzer.energy_db(window))
        .fold(ENERGY_FLOOR_DB, f32::max)
}

/// Record until the recorder stops itself or `cancel` fires (treated as a manual stop).
///
/// Ticks on a tokio interval; missed ticks are skipped rather than bunched.
pub async fn run_recording<M: MicrophoneSource>(
    recorder: &mut VoiceActivityRecorder<M>,
    config: VadConfig,
    tick: Duration,
    cancel: CancellationToken,
) -> VoiceResult<Option<CapturedAudio>> {
    recorder.start_at(config, tokio::time::Instant::now().into_std())?;
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Recorder: cancelled by caller");
                return recorder.stop();
            }
            at = interval.tick() => {
                if let Some(outcome) = recorder.tick(at.into_std())? {
                    return Ok(outcome.audio);
                }
            }
        }
    }
}

/// Encode mono f32 samples as 16-bit PCM WAV.
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(sample_i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
