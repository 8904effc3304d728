//! **Conversation session** — one avatar talking with one user.
//!
//! Ties the pieces together on a single task:
//!
//! ```text
//! recording ─► STT ─► history ─► chat stream ─► segmenter ─► TTS (concurrent, per sentence)
//!                                                                   │
//!                       face ◄─ lip sync ◄─ spectrum ◄─ sink ◄─ ordered playback
//! ```
//!
//! Network work (chat stream, synthesis) is polled alongside a frame interval, so playback
//! and lip sync keep ticking while replies are still arriving.

use crate::chat::{ChatBackend, ChatMessage, OpenAiChat, PlaceholderChat};
use crate::config::{AvatarConfig, BackendConfig, VadConfig};
use crate::error::{VoiceError, VoiceResult, TURN_FAILED_MESSAGE};
use crate::lipsync::{FaceTarget, LipSyncDriver};
use crate::microphone::MicrophoneSource;
use crate::playback::{AudioPlaybackCoordinator, PlaybackEvent, SpeechClip};
use crate::recorder::{run_recording, CapturedAudio, VoiceActivityRecorder};
use crate::segmenter::{SentenceUnit, TextStreamSegmenter};
use crate::sink::AudioSink;
use crate::stt::{OpenAiStt, PlaceholderStt, SttBackend};
use crate::tts::{OpenAiTts, PlaceholderTts, TtsBackend};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The three network services a session talks to.
#[derive(Clone)]
pub struct Backends {
    pub chat: Arc<dyn ChatBackend>,
    pub tts: Arc<dyn TtsBackend>,
    pub stt: Arc<dyn SttBackend>,
}

impl Backends {
    /// OpenAI-compatible backends when an API key is configured, offline placeholders otherwise.
    pub fn from_config(config: &BackendConfig) -> VoiceResult<Self> {
        if config.api_key.is_none() {
            warn!("No API key configured; using placeholder chat, TTS and STT");
            return Ok(Self::placeholders());
        }
        Ok(Self {
            chat: Arc::new(OpenAiChat::new(config)?),
            tts: Arc::new(OpenAiTts::new(config)?),
            stt: Arc::new(OpenAiStt::new(config)?),
        })
    }

    pub fn placeholders() -> Self {
        Self {
            chat: Arc::new(PlaceholderChat::new()),
            tts: Arc::new(PlaceholderTts::new()),
            stt: Arc::new(PlaceholderStt::new()),
        }
    }
}

type Synthesis = BoxFuture<'static, (u64, VoiceResult<Vec<u8>>)>;

/// Consecutive capture failures after which the voice loop gives up.
pub const MAX_CAPTURE_FAILURES: u32 = 5;

/// A talking-avatar conversation: history, speech output and lip sync.
pub struct ConversationSession<S: AudioSink, F: FaceTarget> {
    backends: Backends,
    system_prompt: String,
    history: Vec<ChatMessage>,
    playback: AudioPlaybackCoordinator<S>,
    playback_rx: Option<mpsc::UnboundedReceiver<PlaybackEvent>>,
    lipsync: LipSyncDriver<F>,
    /// First sequence index of the next reply.
    next_index: u64,
    frame: Duration,
    /// Set while `respond` holds playback reservations; still set if that future was dropped.
    turn_open: bool,
}

impl<S: AudioSink, F: FaceTarget> ConversationSession<S, F> {
    pub fn new(config: &AvatarConfig, backends: Backends, sink: S, face: F) -> Self {
        let (playback, playback_rx) = AudioPlaybackCoordinator::new(sink);
        Self {
            backends,
            system_prompt: config.backend.system_prompt.clone(),
            history: Vec::new(),
            playback,
            playback_rx: Some(playback_rx),
            lipsync: LipSyncDriver::new(&config.lipsync, face),
            next_index: 0,
            frame: config.tick_interval(),
            turn_open: false,
        }
    }

    /// Conversation so far, without the system prompt.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn playback(&self) -> &AudioPlaybackCoordinator<S> {
        &self.playback
    }

    pub fn lipsync(&self) -> &LipSyncDriver<F> {
        &self.lipsync
    }

    pub fn is_speaking(&self) -> bool {
        self.playback.is_speaking()
    }

    /// Playback lifecycle events. Can be taken once.
    pub fn take_playback_events(&mut self) -> Option<mpsc::UnboundedReceiver<PlaybackEvent>> {
        self.playback_rx.take()
    }

    /// Send `user_text`, stream the reply and start speaking it sentence by sentence.
    ///
    /// Returns the full reply text once the stream ends and every sentence has been
    /// synthesized (playback may still be running; see [`finish_speaking`](Self::finish_speaking)).
    ///
    /// If this future is dropped early, the reservations it made are released on the next
    /// call to `respond` or `finish_speaking`, or by `interrupt`.
    pub async fn respond(&mut self, user_text: &str) -> VoiceResult<String> {
        self.recover_abandoned_turn();
        let user_text = user_text.trim();
        if user_text.is_empty() {
            debug!("Conversation: ignoring empty input");
            return Ok(String::new());
        }
        self.history.push(ChatMessage::user(user_text));
        info!("💬 User: {}", user_text);

        let messages = self.request_messages();
        let mut deltas = match self.backends.chat.stream_reply(&messages).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail_turn(e)),
        };

        let mut segmenter = TextStreamSegmenter::starting_at(self.next_index);
        self.turn_open = true;
        let mut synthesis: FuturesUnordered<Synthesis> = FuturesUnordered::new();
        let mut reply = String::new();
        let mut stream_done = false;
        let mut frames = tokio::time::interval(self.frame);
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !stream_done || !synthesis.is_empty() {
            tokio::select! {
                delta = deltas.next(), if !stream_done => match delta {
                    Some(Ok(text)) => {
                        reply.push_str(&text);
                        for unit in segmenter.feed(&text) {
                            self.dispatch(unit, &mut synthesis);
                        }
                    }
                    Some(Err(e)) => {
                        let reason = match e {
                            VoiceError::InputStream(reason) => reason,
                            other => other.to_string(),
                        };
                        let err = segmenter.fail(reason);
                        self.next_index = segmenter.next_index();
                        // Reset to ready: nothing from a broken reply keeps playing.
                        drop(synthesis);
                        self.turn_open = false;
                        self.interrupt();
                        return Err(self.fail_turn(err));
                    }
                    None => {
                        if let Some(unit) = segmenter.finish() {
                            self.dispatch(unit, &mut synthesis);
                        }
                        stream_done = true;
                    }
                },
                Some((index, result)) = synthesis.next(), if !synthesis.is_empty() => {
                    match result {
                        Ok(audio) => self.playback.enqueue(SpeechClip::ready(index, audio)),
                        Err(e) => {
                            warn!("Conversation: sentence #{} not spoken: {}", index, e);
                            self.playback.skip(index);
                        }
                    }
                }
                _ = frames.tick() => self.frame_tick(),
            }
        }

        self.next_index = segmenter.next_index();
        self.turn_open = false;
        let reply = reply.trim().to_string();
        if !reply.is_empty() {
            info!("🤖 Assistant: {}", reply);
            self.history.push(ChatMessage::assistant(reply.clone()));
        }
        Ok(reply)
    }

    /// Transcribe a finished recording and respond to it.
    pub async fn respond_to_recording(&mut self, audio: &CapturedAudio) -> VoiceResult<String> {
        let text = self.backends.stt.transcribe(audio).await.map_err(|e| match e {
            VoiceError::Transcription(_) => e,
            other => VoiceError::Transcription(other.to_string()),
        })?;
        if text.trim().is_empty() {
            info!("Conversation: empty transcript, nothing to answer");
            return Ok(String::new());
        }
        self.respond(&text).await
    }

    /// Keep ticking until every queued sentence has played, then close the mouth.
    pub async fn finish_speaking(&mut self) {
        self.recover_abandoned_turn();
        let mut frames = tokio::time::interval(self.frame);
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
        while self.playback.is_speaking() {
            frames.tick().await;
            self.frame_tick();
        }
        self.lipsync.reset();
    }

    /// Stop talking immediately. Returns the number of clips released.
    pub fn interrupt(&mut self) -> usize {
        self.turn_open = false;
        let released = self.playback.stop_all();
        self.next_index = self.next_index.max(self.playback.next_index());
        self.lipsync.reset();
        if released > 0 {
            info!("Interruption: dropped {} queued clips", released);
        }
        released
    }

    /// Listen → answer → speak, until `cancel` fires.
    ///
    /// Discarded (silent) recordings are skipped. Transcription and stream failures end only
    /// the current turn. A capture failure is retried after a growing pause, and the loop
    /// gives up after [`MAX_CAPTURE_FAILURES`] in a row; a denied microphone ends it at once.
    pub async fn run_voice_loop<M: MicrophoneSource>(
        &mut self,
        recorder: &mut VoiceActivityRecorder<M>,
        vad: VadConfig,
        cancel: CancellationToken,
    ) -> VoiceResult<()> {
        info!("🎧 Voice loop started");
        let mut capture_failures = 0u32;
        while !cancel.is_cancelled() {
            let recording = run_recording(recorder, vad.clone(), self.frame, cancel.clone()).await;
            if cancel.is_cancelled() {
                break;
            }
            let audio = match recording {
                Ok(Some(audio)) => {
                    capture_failures = 0;
                    audio
                }
                Ok(None) => {
                    capture_failures = 0;
                    debug!("Voice loop: nothing captured, listening again");
                    continue;
                }
                Err(e) => {
                    self.report(&e);
                    if matches!(e, VoiceError::Permission(_) | VoiceError::Config(_)) {
                        return Err(e);
                    }
                    capture_failures += 1;
                    if capture_failures >= MAX_CAPTURE_FAILURES {
                        warn!("Voice loop: {} capture failures in a row, giving up", capture_failures);
                        return Err(e);
                    }
                    let pause = self.frame * capture_failures;
                    debug!("Voice loop: retrying capture in {:?}", pause);
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
            };

            let answered = tokio::select! {
                r = self.respond_to_recording(&audio) => Some(r),
                _ = cancel.cancelled() => None,
            };
            match answered {
                None => {
                    self.interrupt();
                    break;
                }
                Some(Err(e)) => {
                    self.report(&e);
                    self.interrupt();
                    continue;
                }
                Some(Ok(_)) => {}
            }

            let finished = tokio::select! {
                _ = self.finish_speaking() => true,
                _ = cancel.cancelled() => false,
            };
            if !finished {
                self.interrupt();
                break;
            }
        }
        recorder.cancel();
        info!("🎧 Voice loop stopped");
        Ok(())
    }

    /// A dropped `respond` left reservations that nothing will fill.
    fn recover_abandoned_turn(&mut self) {
        if self.turn_open {
            warn!("Conversation: previous reply was abandoned mid-stream, releasing its clips");
            self.interrupt();
        }
    }

    fn request_messages(&self) -> Vec<ChatMessage> {
        std::iter::once(ChatMessage::system(self.system_prompt.clone()))
            .chain(self.history.iter().cloned())
            .collect()
    }

    fn dispatch(
        &mut self,
        unit: SentenceUnit,
        synthesis: &mut FuturesUnordered<Synthesis>,
    ) {
        let index = unit.sequence_index;
        debug!("Conversation: synthesizing #{}: {}", index, unit.text);
        self.playback.reserve(index);
        let tts = Arc::clone(&self.backends.tts);
        synthesis.push(
            async move {
                let result = tts.synthesize(&unit.text).await;
                (index, result)
            }
            .boxed(),
        );
    }

    fn frame_tick(&mut self) {
        self.playback.tick();
        self.lipsync.tick(self.playback.sink());
    }

    /// A turn-level failure: the user sees an apology in the transcript.
    fn fail_turn(&mut self, err: VoiceError) -> VoiceError {
        warn!("Conversation: turn failed: {}", err);
        if matches!(err, VoiceError::InputStream(_)) {
            self.history.push(ChatMessage::assistant(TURN_FAILED_MESSAGE));
        }
        err
    }

    fn report(&self, err: &VoiceError) {
        if err.is_turn_level() {
            warn!("Voice loop: {} ({})", err.user_message(), err);
        } else {
            warn!("Voice loop: {}", err);
        }
    }
}
