//! **Sentence segmentation** for streamed model replies.
//!
//! Tokens arrive as small text deltas. Each `feed` appends to a pending buffer and,
//! when the buffer holds one or more sentence terminators (`.`, `!`, `?`), cuts a single
//! `SentenceUnit` up to and including the *last* terminator. Whatever follows stays
//! pending until the next delta or `finish()`.

use crate::error::VoiceError;
use tracing::{debug, warn};

const TERMINATORS: [char; 3] = ['.', '!', '?'];

/// One speakable piece of the reply, ready for a synthesis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceUnit {
    pub text: String,
    /// Playback order key; monotonic across the session.
    pub sequence_index: u64,
    /// True only for the remainder flushed by `finish()`.
    pub is_final: bool,
}

/// Turns an ordered stream of text deltas into sentence units.
///
/// Assumes a single ordered producer. Sequence indices keep counting across turns so the
/// playback queue can order clips from one session without ever reusing an index.
#[derive(Debug, Default)]
pub struct TextStreamSegmenter {
    buffer: String,
    next_index: u64,
}

impl TextStreamSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering units at `index` (e.g. the session's next free sequence index).
    pub fn starting_at(index: u64) -> Self {
        Self {
            buffer: String::new(),
            next_index: index,
        }
    }

    /// Append a delta and return the unit completed by it, if any.
    ///
    /// Several terminators inside one delta collapse into a single unit.
    pub fn feed(&mut self, delta: &str) -> Vec<SentenceUnit> {
        if delta.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(delta);

        let Some(cut) = self.buffer.rfind(TERMINATORS) else {
            return Vec::new();
        };
        // Terminators are single-byte, so `cut + 1` is a char boundary.
        let remainder = self.buffer.split_off(cut + 1);
        let complete = std::mem::replace(&mut self.buffer, remainder.trim_start().to_string());

        self.emit(complete, false).into_iter().collect()
    }

    /// Flush any non-empty remainder as the final unit and reset the buffer.
    pub fn finish(&mut self) -> Option<SentenceUnit> {
        let rest = std::mem::take(&mut self.buffer);
        self.emit(rest, true)
    }

    /// The upstream stream failed: drop the pending fragment instead of speaking it.
    pub fn fail(&mut self, reason: impl Into<String>) -> VoiceError {
        let reason = reason.into();
        if !self.buffer.trim().is_empty() {
            warn!(
                "Segmenter: discarding {} pending chars after stream error",
                self.buffer.len()
            );
        }
        self.buffer.clear();
        VoiceError::InputStream(reason)
    }

    /// Text received but not yet emitted.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Index the next emitted unit will carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    fn emit(&mut self, text: String, is_final: bool) -> Option<SentenceUnit> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let unit = SentenceUnit {
            text: text.to_string(),
            sequence_index: self.next_index,
            is_final,
        };
        self.next_index += 1;
        debug!(
            "Segmenter: unit #{} ({} chars, final: {})",
            unit.sequence_index,
            unit.text.len(),
            is_final
        );
        Some(unit)
    }
}
