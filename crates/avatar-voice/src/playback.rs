//! **Ordered speech playback.**
//!
//! Synthesis requests for consecutive sentences run concurrently and can complete in any
//! order. The coordinator buffers finished clips by sequence index and hands them to the
//! sink strictly in order, one at a time:
//!
//! ```text
//! reserve(n) ─► Pending ─enqueue─► Ready ─(n == next_index, sink idle)─► Playing ─► Played
//!                  │                                                       │
//!                  └─skip(n): synthesis failed, queue moves past n         └─ payload released once
//! ```
//!
//! The queue is unbounded; a conversational turn holds a handful of clips.

use crate::error::VoiceError;
use crate::sink::{AudioSink, SinkStatus};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifecycle of a speech clip inside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipState {
    /// Synthesis requested, audio not back yet.
    Pending,
    Ready,
    Playing,
    Played,
}

/// Synthesized audio for one sentence.
#[derive(Debug)]
pub struct SpeechClip {
    pub sequence_index: u64,
    payload: Option<Vec<u8>>,
    state: ClipState,
}

impl SpeechClip {
    /// A clip whose audio has arrived.
    pub fn ready(sequence_index: u64, payload: Vec<u8>) -> Self {
        Self {
            sequence_index,
            payload: Some(payload),
            state: ClipState::Ready,
        }
    }

    fn pending(sequence_index: u64) -> Self {
        Self {
            sequence_index,
            payload: None,
            state: ClipState::Pending,
        }
    }

    pub fn state(&self) -> ClipState {
        self.state
    }

    /// Audio bytes, until the clip is released.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Drop the payload. Returns false if it was already gone.
    fn release(&mut self) -> bool {
        self.payload.take().is_some()
    }
}

/// Events emitted by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    ClipStarted { sequence_index: u64 },
    ClipFinished { sequence_index: u64 },
    /// The sink rejected or aborted the clip; the queue moves on.
    ClipFailed { sequence_index: u64, reason: String },
    /// The clip's payload was freed.
    ClipReleased { sequence_index: u64 },
    /// Synthesis for this index failed; it will never play.
    ClipSkipped { sequence_index: u64 },
    /// Nothing buffered or playing anymore.
    Drained,
    /// `stop_all` cleared the queue.
    Stopped { released: usize },
}

/// Plays speech clips in strict sequence order through an `AudioSink`.
pub struct AudioPlaybackCoordinator<S: AudioSink> {
    sink: S,
    queue: BTreeMap<u64, SpeechClip>,
    /// Indices whose synthesis failed and that have not been passed yet.
    skipped: BTreeSet<u64>,
    /// The clip on the sink; `Some` is the `playing` flag.
    current: Option<SpeechClip>,
    next_index: u64,
    /// One past the highest index ever seen.
    high_water: u64,
    released_total: usize,
    /// Set once `Drained` has been reported for the current burst.
    drained: bool,
    event_tx: mpsc::UnboundedSender<PlaybackEvent>,
}

impl<S: AudioSink> AudioPlaybackCoordinator<S> {
    /// Create a coordinator that expects index 0 first.
    pub fn new(sink: S) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            sink,
            queue: BTreeMap::new(),
            skipped: BTreeSet::new(),
            current: None,
            next_index: 0,
            high_water: 0,
            released_total: 0,
            drained: true,
            event_tx,
        };
        (coordinator, event_rx)
    }

    /// Register an outstanding synthesis request for `index`.
    pub fn reserve(&mut self, index: u64) {
        if index < self.next_index {
            warn!("Playback: reserve for already-passed index #{}", index);
            return;
        }
        self.high_water = self.high_water.max(index + 1);
        self.drained = false;
        self.queue.entry(index).or_insert_with(|| SpeechClip::pending(index));
    }

    /// Hand over a synthesized clip. It plays once every lower index has played or been skipped.
    pub fn enqueue(&mut self, mut clip: SpeechClip) {
        let index = clip.sequence_index;
        if index < self.next_index {
            debug!("Playback: dropping stale clip #{} (next is #{})", index, self.next_index);
            self.release(&mut clip);
            return;
        }
        let on_sink = self.current_index() == Some(index);
        if let Some(existing) = self.queue.get(&index).filter(|_| !on_sink) {
            if existing.state != ClipState::Pending {
                warn!("Playback: duplicate clip #{}, keeping the first", index);
                self.release(&mut clip);
                return;
            }
        }
        if on_sink {
            warn!("Playback: duplicate of playing clip #{}", index);
            self.release(&mut clip);
            return;
        }
        if clip.payload.is_none() {
            warn!("Playback: clip #{} arrived without audio, skipping", index);
            self.skip(index);
            return;
        }

        clip.state = ClipState::Ready;
        self.high_water = self.high_water.max(index + 1);
        self.drained = false;
        self.queue.insert(index, clip);
        debug!("Playback: clip #{} ready ({} buffered)", index, self.queue.len());
        self.advance();
    }

    /// Synthesis for `index` failed: never wait for it.
    pub fn skip(&mut self, index: u64) {
        if index < self.next_index || self.current_index() == Some(index) {
            return;
        }
        if let Some(mut clip) = self.queue.remove(&index) {
            self.release(&mut clip);
        }
        self.high_water = self.high_water.max(index + 1);
        self.skipped.insert(index);
        self.emit(PlaybackEvent::ClipSkipped { sequence_index: index });
        self.advance();
    }

    /// Poll the sink for completion or failure of the playing clip.
    pub fn tick(&mut self) {
        if self.current.is_none() {
            self.advance();
            return;
        }
        match self.sink.poll() {
            SinkStatus::Playing => {}
            SinkStatus::Finished | SinkStatus::Idle => self.finish_current(None),
            SinkStatus::Failed(reason) => self.finish_current(Some(reason)),
        }
    }

    /// Completion signal from an event-driven sink.
    pub fn clip_finished(&mut self, index: u64) {
        if self.current_index() == Some(index) {
            self.finish_current(None);
        }
    }

    /// Error signal from an event-driven sink.
    pub fn clip_failed(&mut self, index: u64, err: VoiceError) {
        if self.current_index() == Some(index) {
            self.finish_current(Some(err.to_string()));
        }
    }

    /// True while any clip is pending, buffered or playing.
    pub fn is_speaking(&self) -> bool {
        self.current.is_some() || !self.queue.is_empty()
    }

    /// Halt playback and release everything buffered. No-op when already empty.
    pub fn stop_all(&mut self) -> usize {
        if !self.is_speaking() && self.skipped.is_empty() {
            return 0;
        }
        let mut released = 0;
        if let Some(mut clip) = self.current.take() {
            self.sink.halt();
            if self.release(&mut clip) {
                released += 1;
            }
        }
        for (_, mut clip) in std::mem::take(&mut self.queue) {
            if self.release(&mut clip) {
                released += 1;
            }
        }
        self.skipped.clear();
        // Anything still in flight from this turn is stale from now on.
        self.next_index = self.next_index.max(self.high_water);
        self.drained = true;
        info!("⏹️ Playback stopped ({} clips released)", released);
        self.emit(PlaybackEvent::Stopped { released });
        released
    }

    /// Index the coordinator will play next.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Index of the clip on the sink, if any.
    pub fn current_index(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.sequence_index)
    }

    /// Number of clips waiting (pending or ready).
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    /// Payloads freed since creation.
    pub fn released_total(&self) -> usize {
        self.released_total
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn finish_current(&mut self, failure: Option<String>) {
        let Some(mut clip) = self.current.take() else {
            return;
        };
        let index = clip.sequence_index;
        clip.state = ClipState::Played;
        match failure {
            None => {
                debug!("Playback: clip #{} finished", index);
                self.emit(PlaybackEvent::ClipFinished { sequence_index: index });
            }
            Some(reason) => {
                warn!("Playback: clip #{} failed: {}", index, reason);
                self.emit(PlaybackEvent::ClipFailed {
                    sequence_index: index,
                    reason,
                });
            }
        }
        self.release(&mut clip);
        self.next_index = index + 1;
        self.advance();
    }

    /// Start the next clip if the sink is free and the expected index is ready.
    fn advance(&mut self) {
        while self.current.is_none() {
            while self.skipped.remove(&self.next_index) {
                self.next_index += 1;
            }
            let ready = matches!(
                self.queue.get(&self.next_index),
                Some(clip) if clip.state == ClipState::Ready
            );
            if !ready {
                break;
            }
            let Some(mut clip) = self.queue.remove(&self.next_index) else {
                break;
            };
            let index = clip.sequence_index;
            match self.sink.start(&clip) {
                Ok(()) => {
                    clip.state = ClipState::Playing;
                    debug!("Playback: clip #{} playing", index);
                    self.current = Some(clip);
                    self.emit(PlaybackEvent::ClipStarted { sequence_index: index });
                }
                Err(e) => {
                    warn!("Playback: clip #{} could not start: {}", index, e);
                    clip.state = ClipState::Played;
                    self.emit(PlaybackEvent::ClipFailed {
                        sequence_index: index,
                        reason: e.to_string(),
                    });
                    self.release(&mut clip);
                    self.next_index = index + 1;
                }
            }
        }
        if !self.is_speaking() && !self.drained {
            self.drained = true;
            info!("🔇 Playback drained");
            self.emit(PlaybackEvent::Drained);
        }
    }

    fn release(&mut self, clip: &mut SpeechClip) -> bool {
        if !clip.release() {
            return false;
        }
        self.released_total += 1;
        self.emit(PlaybackEvent::ClipReleased {
            sequence_index: clip.sequence_index,
        });
        true
    }

    fn emit(&self, event: PlaybackEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("Playback: event receiver dropped");
        }
    }
}
