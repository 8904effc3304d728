//! Voice activity detection over per-tick energy readings.
//!
//! State machine: `Unvoiced → Voiced ⇄ SilencePending → SilenceElapsed`. A frame is voiced
//! iff its energy exceeds the threshold. Once voice has been heard, the first quiet frame arms
//! a silence deadline anchored at the *last voiced frame*, so the recording ends exactly
//! `silence_duration` after the speaker stopped, regardless of tick jitter.

use crate::config::VadConfig;
use std::time::{Duration, Instant};
use tracing::debug;

/// Transitions reported by [`VoiceActivityDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadSignal {
    /// First voiced frame of the session.
    SpeechStarted,
    /// Voice came back before the silence deadline; the countdown is cancelled.
    SpeechResumed,
    /// Voice stopped; the session ends at `deadline` unless it resumes.
    SilenceStarted { deadline: Instant },
    /// The deadline passed without voice.
    SilenceElapsed,
}

/// Energy-threshold VAD for one recording session.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold_db: f32,
    silence_duration: Duration,
    voice_detected: bool,
    last_voiced: Option<Instant>,
    deadline: Option<Instant>,
    elapsed: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            threshold_db: config.silence_threshold_db,
            silence_duration: config.silence_duration(),
            voice_detected: false,
            last_voiced: None,
            deadline: None,
            elapsed: false,
        }
    }

    /// Feed one frame's energy. Returns the transition it caused, if any.
    pub fn observe(&mut self, now: Instant, energy_db: f32) -> Option<VadSignal> {
        if self.elapsed {
            return None;
        }
        if energy_db > self.threshold_db {
            self.last_voiced = Some(now);
            if !self.voice_detected {
                self.voice_detected = true;
                self.deadline = None;
                debug!("VAD: speech started ({:.1} dB)", energy_db);
                return Some(VadSignal::SpeechStarted);
            }
            if self.deadline.take().is_some() {
                debug!("VAD: speech resumed, silence timer cancelled");
                return Some(VadSignal::SpeechResumed);
            }
            return None;
        }

        if !self.voice_detected || self.deadline.is_some() {
            return None;
        }
        let last = self.last_voiced.unwrap_or(now);
        let deadline = last + self.silence_duration;
        self.deadline = Some(deadline);
        debug!("VAD: silence started, auto-stop in {:?}", deadline.saturating_duration_since(now));
        Some(VadSignal::SilenceStarted { deadline })
    }

    /// Fires `SilenceElapsed` once, on the first call at or after the deadline.
    pub fn poll(&mut self, now: Instant) -> Option<VadSignal> {
        match self.deadline {
            Some(deadline) if !self.elapsed && now >= deadline => {
                self.elapsed = true;
                self.deadline = None;
                Some(VadSignal::SilenceElapsed)
            }
            _ => None,
        }
    }

    /// True once any frame crossed the threshold.
    pub fn voice_detected(&self) -> bool {
        self.voice_detected
    }

    /// Pending silence deadline, if the countdown is running.
    pub fn silence_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(10);

    fn detector() -> VoiceActivityDetector {
        VoiceActivityDetector::new(&VadConfig {
            silence_threshold_db: -50.0,
            silence_duration_ms: 1000,
            ..Default::default()
        })
    }

    /// Drive the detector frame by frame; returns the time `SilenceElapsed` fired.
    fn run(det: &mut VoiceActivityDetector, start: Instant, energies: &[f32]) -> Option<Instant> {
        for (i, &db) in energies.iter().enumerate() {
            let now = start + FRAME * i as u32;
            det.observe(now, db);
            if det.poll(now) == Some(VadSignal::SilenceElapsed) {
                return Some(now);
            }
        }
        None
    }

    #[test]
    fn test_stops_exactly_after_last_voiced_frame() {
        let (f, v) = (25usize, 40usize);
        let mut energies = vec![-90.0; f];
        energies.extend(vec![-20.0; v]);
        energies.extend(vec![-95.0; 200]);

        let start = Instant::now();
        let mut det = detector();
        let fired = run(&mut det, start, &energies).expect("silence should elapse");

        let last_voiced = start + FRAME * (f + v - 1) as u32;
        assert_eq!(fired, last_voiced + Duration::from_millis(1000));
        assert!(det.voice_detected());
    }

    #[test]
    fn test_no_voice_never_arms_timer() {
        let start = Instant::now();
        let mut det = detector();
        assert_eq!(run(&mut det, start, &vec![-100.0; 300]), None);
        assert!(!det.voice_detected());
        assert!(det.silence_deadline().is_none());
    }

    #[test]
    fn test_resumed_voice_cancels_timer() {
        let t0 = Instant::now();
        let mut det = detector();
        assert_eq!(det.observe(t0, -10.0), Some(VadSignal::SpeechStarted));

        let t1 = t0 + FRAME;
        assert!(matches!(det.observe(t1, -80.0), Some(VadSignal::SilenceStarted { .. })));
        assert_eq!(det.silence_deadline(), Some(t0 + Duration::from_millis(1000)));
        // A second quiet frame does not re-arm.
        assert_eq!(det.observe(t1 + FRAME, -80.0), None);

        let t2 = t0 + Duration::from_millis(500);
        assert_eq!(det.observe(t2, -30.0), Some(VadSignal::SpeechResumed));
        assert!(det.silence_deadline().is_none());
        assert_eq!(det.poll(t0 + Duration::from_millis(1200)), None);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut det = detector();
        assert_eq!(det.observe(Instant::now(), -50.0), None);
        assert!(!det.voice_detected());
    }

    #[test]
    fn test_elapsed_fires_once() {
        let t0 = Instant::now();
        let mut det = detector();
        det.observe(t0, -10.0);
        det.observe(t0 + FRAME, -90.0);
        let late = t0 + Duration::from_secs(5);
        assert_eq!(det.poll(late), Some(VadSignal::SilenceElapsed));
        assert_eq!(det.poll(late), None);
        assert_eq!(det.observe(late, -10.0), None);
    }
}
