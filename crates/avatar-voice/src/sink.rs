//! **Audio sink** — the playable output that speech clips are handed to, one at a time.
//!
//! `RodioSink` decodes synthesized MP3/WAV bytes with rodio and mirrors every sample it
//! plays into a small tap buffer, so the lip-sync engine can read a live spectrum of
//! what is coming out of the speakers.

use crate::error::{VoiceError, VoiceResult};
use crate::playback::SpeechClip;
use crate::spectrum::{Spectrum, SpectrumAnalyzer};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// What the sink is doing with the clip it was last given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkStatus {
    /// Nothing started (or the last clip was already reported).
    Idle,
    Playing,
    /// Natural end of the clip.
    Finished,
    /// The clip failed mid-playback.
    Failed(String),
}

/// Output device seam. Exactly one clip is active between `start` and a terminal `poll`.
pub trait AudioSink {
    /// Begin playing `clip`. An error means the clip never started.
    fn start(&mut self, clip: &SpeechClip) -> VoiceResult<()>;

    /// Report progress of the active clip; `Finished`/`Failed` are reported once.
    fn poll(&mut self) -> SinkStatus;

    /// Stop immediately and drop anything queued on the device.
    fn halt(&mut self);

    /// Live spectrum of what is currently audible, if anything.
    fn spectrum(&self) -> Option<Spectrum>;
}

/// Samples most recently handed to the device, downmixed to mono on read.
#[derive(Debug, Default)]
struct TapBuffer {
    samples: VecDeque<f32>,
    channels: u16,
    sample_rate: u32,
    capacity: usize,
}

impl TapBuffer {
    fn reset(&mut self, channels: u16, sample_rate: u32) {
        self.samples.clear();
        self.channels = channels.max(1);
        self.sample_rate = sample_rate;
    }

    fn extend(&mut self, batch: &[f32]) {
        self.samples.extend(batch.iter().copied());
        let excess = self.samples.len().saturating_sub(self.capacity);
        self.samples.drain(..excess);
    }

    fn latest_mono(&self, frames: usize) -> Vec<f32> {
        let channels = usize::from(self.channels.max(1));
        let wanted = frames * channels;
        let start = self.samples.len().saturating_sub(wanted);
        let interleaved: Vec<f32> = self.samples.range(start..).copied().collect();
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    }
}

/// Source adapter that copies samples into the tap as rodio pulls them.
struct TapSource<S> {
    inner: S,
    tap: Arc<Mutex<TapBuffer>>,
    batch: Vec<f32>,
}

const TAP_BATCH: usize = 256;

impl<S> TapSource<S> {
    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        if let Ok(mut tap) = self.tap.lock() {
            tap.extend(&self.batch);
        }
        self.batch.clear();
    }
}

impl<S> Iterator for TapSource<S>
where
    S: Source<Item = f32>,
{
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        match self.inner.next() {
            Some(sample) => {
                self.batch.push(sample);
                if self.batch.len() >= TAP_BATCH {
                    self.flush();
                }
                Some(sample)
            }
            None => {
                self.flush();
                None
            }
        }
    }
}

impl<S> Source for TapSource<S>
where
    S: Source<Item = f32>,
{
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}

/// Default output device via rodio, with a spectrum tap for lip sync.
pub struct RodioSink {
    _stream: OutputStream,
    stream_handle: OutputStreamHandle,
    sink: Sink,
    tap: Arc<Mutex<TapBuffer>>,
    analyzer: SpectrumAnalyzer,
    active: Option<u64>,
}

impl RodioSink {
    /// Open the default output device. `fft_size` sets the spectrum tap window.
    pub fn new(fft_size: usize) -> VoiceResult<Self> {
        let (stream, stream_handle) =
            OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
        let sink = Sink::try_new(&stream_handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        let analyzer = SpectrumAnalyzer::new(fft_size);
        let tap = TapBuffer {
            capacity: analyzer.fft_size() * 8,
            ..Default::default()
        };
        info!("RodioSink: output ready (tap window {} samples)", analyzer.fft_size());
        Ok(Self {
            _stream: stream,
            stream_handle,
            sink,
            tap: Arc::new(Mutex::new(tap)),
            analyzer,
            active: None,
        })
    }
}

impl AudioSink for RodioSink {
    fn start(&mut self, clip: &SpeechClip) -> VoiceResult<()> {
        let payload = clip
            .payload()
            .ok_or_else(|| VoiceError::Playback(format!("clip #{} has no payload", clip.sequence_index)))?;
        if payload.is_empty() {
            return Err(VoiceError::Playback(format!("clip #{} is empty", clip.sequence_index)));
        }
        let source = rodio::Decoder::new(Cursor::new(payload.to_vec()))
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?
            .convert_samples::<f32>();

        if let Ok(mut tap) = self.tap.lock() {
            tap.reset(source.channels(), source.sample_rate());
        }
        self.sink.append(TapSource {
            inner: source,
            tap: Arc::clone(&self.tap),
            batch: Vec::with_capacity(TAP_BATCH),
        });
        self.sink.play();
        self.active = Some(clip.sequence_index);
        Ok(())
    }

    fn poll(&mut self) -> SinkStatus {
        match self.active {
            None => SinkStatus::Idle,
            Some(_) if self.sink.empty() => {
                self.active = None;
                SinkStatus::Finished
            }
            Some(_) => SinkStatus::Playing,
        }
    }

    fn halt(&mut self) {
        self.sink.stop();
        // A stopped rodio sink does not reliably accept new sources; start from a fresh one.
        match Sink::try_new(&self.stream_handle) {
            Ok(sink) => self.sink = sink,
            Err(e) => warn!("RodioSink: could not recreate sink after stop: {}", e),
        }
        if let Ok(mut tap) = self.tap.lock() {
            tap.samples.clear();
        }
        self.active = None;
        info!("RodioSink: stopped");
    }

    fn spectrum(&self) -> Option<Spectrum> {
        self.active?;
        let tap = self.tap.lock().ok()?;
        let window = tap.latest_mono(self.analyzer.fft_size());
        if window.is_empty() {
            return None;
        }
        Some(self.analyzer.normalized(&window, tap.sample_rate))
    }
}
