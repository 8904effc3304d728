//! **Viseme lip sync** — turns the spectrum of the playing clip into mouth-shape weights.
//!
//! Each frame the normalized spectrum is folded into four speech bands:
//!
//! | Band | Hz | Drives |
//! |------|----|--------|
//! | low | 80–300 | O, U, pucker |
//! | mid-low | 300–800 | aa, mouth open |
//! | mid | 800–2000 | E, I |
//! | high | 2000–4000 | smile, sibilants |
//!
//! Targets are approached with a lerp; shapes that get no target this frame decay toward 0,
//! so the mouth closes smoothly when speech stops. Channel names follow the ReadyPlayerMe /
//! ARKit morph-target convention.

use crate::config::LipSyncConfig;
use crate::sink::AudioSink;
use crate::spectrum::Spectrum;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Weights at or below this are dropped from the map.
const PRUNE_BELOW: f32 = 1e-3;

const BANDS: [(f32, f32); 4] = [(80.0, 300.0), (300.0, 800.0), (800.0, 2000.0), (2000.0, 4000.0)];

/// Every shape channel the engine can target.
pub const VISEME_CHANNELS: [&str; 18] = [
    "jawOpen",
    "mouthOpen",
    "viseme_aa",
    "viseme_E",
    "viseme_I",
    "viseme_O",
    "viseme_U",
    "mouthPucker",
    "mouthSmile",
    "viseme_SS",
    "viseme_CH",
    "viseme_FF",
    "viseme_TH",
    "viseme_DD",
    "viseme_kk",
    "viseme_nn",
    "viseme_RR",
    "viseme_PP",
];

/// Mean band values in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandEnergies {
    pub low: f32,
    pub mid_low: f32,
    pub mid: f32,
    pub high: f32,
}

impl BandEnergies {
    /// Fold `bins` (bin `i` sits at `i * sample_rate / (2 * bins.len())` Hz) into the four bands.
    pub fn from_bins(bins: &[f32], sample_rate: u32) -> Self {
        if bins.is_empty() || sample_rate == 0 {
            return Self::default();
        }
        let hz_per_bin = sample_rate as f32 / (2 * bins.len()) as f32;
        let mut sums = [0.0f32; 4];
        let mut counts = [0usize; 4];
        for (i, &m) in bins.iter().enumerate() {
            let freq = i as f32 * hz_per_bin;
            if let Some(band) = BANDS.iter().position(|&(lo, hi)| freq >= lo && freq < hi) {
                sums[band] += m.clamp(0.0, 1.0);
                counts[band] += 1;
            }
        }
        let mean = |b: usize| if counts[b] == 0 { 0.0 } else { sums[b] / counts[b] as f32 };
        Self {
            low: mean(0),
            mid_low: mean(1),
            mid: mean(2),
            high: mean(3),
        }
    }

    /// Overall activity: mean of the four bands.
    pub fn activity(&self) -> f32 {
        (self.low + self.mid_low + self.mid + self.high) / 4.0
    }

    fn targets(&self) -> [(&'static str, f32); 18] {
        let Self { low, mid_low, mid, high } = *self;
        let activity = self.activity();
        [
            ("jawOpen", activity * 1.5),
            ("mouthOpen", (low + mid_low) * 0.6),
            ("viseme_aa", mid_low),
            ("viseme_E", mid * 0.8),
            ("viseme_I", mid * 0.6),
            ("viseme_O", low * 0.8),
            ("viseme_U", low * 0.6),
            ("mouthPucker", low * 0.4),
            ("mouthSmile", high * 0.5),
            ("viseme_SS", high * 0.8),
            ("viseme_CH", high * 0.5 + mid * 0.2),
            ("viseme_FF", high * 0.4 + low * 0.1),
            ("viseme_TH", high * 0.3 + mid * 0.2),
            ("viseme_DD", mid * 0.3 + mid_low * 0.2),
            ("viseme_kk", mid_low * 0.3 + mid * 0.2),
            ("viseme_nn", low * 0.3 + mid_low * 0.2),
            ("viseme_RR", mid_low * 0.3 + low * 0.2),
            ("viseme_PP", low * 0.2),
        ]
    }
}

/// Shape channel name → weight in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct VisemeWeightMap(HashMap<String, f32>);

impl VisemeWeightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weight of `channel`; absent channels are 0.
    pub fn get(&self, channel: &str) -> f32 {
        self.0.get(channel).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, channel: impl Into<String>, weight: f32) {
        self.0.insert(channel.into(), weight.clamp(0.0, 1.0));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-frame spectrum → viseme weights. Deterministic, no side effects.
#[derive(Debug, Clone)]
pub struct VisemeLipSyncEngine {
    smoothing_factor: f32,
    decay_factor: f32,
    activity_floor: f32,
}

impl Default for VisemeLipSyncEngine {
    fn default() -> Self {
        Self::new(&LipSyncConfig::default())
    }
}

impl VisemeLipSyncEngine {
    pub fn new(config: &LipSyncConfig) -> Self {
        Self {
            smoothing_factor: config.smoothing_factor,
            decay_factor: config.decay_factor,
            activity_floor: config.activity_floor,
        }
    }

    /// Advance `previous` by one frame. Channels outside `available` are never written.
    pub fn step(
        &self,
        previous: &VisemeWeightMap,
        spectrum: &[f32],
        sample_rate: u32,
        available: &HashSet<String>,
    ) -> VisemeWeightMap {
        let bands = BandEnergies::from_bins(spectrum, sample_rate);
        let mut next = HashMap::new();

        if bands.activity() >= self.activity_floor {
            for (channel, target) in bands.targets() {
                if !available.contains(channel) {
                    continue;
                }
                let prev = previous.get(channel);
                let weight = lerp(prev, target.clamp(0.0, 1.0), self.smoothing_factor);
                next.insert(channel.to_string(), weight);
            }
        }

        for (channel, prev) in previous.iter() {
            if next.contains_key(channel) || !available.contains(channel) {
                continue;
            }
            next.insert(channel.to_string(), prev * self.decay_factor);
        }

        next.retain(|_, w| {
            *w = w.clamp(0.0, 1.0);
            *w > PRUNE_BELOW
        });
        VisemeWeightMap(next)
    }
}

fn lerp(from: f32, to: f32, t: f32) -> f32 {
    from + (to - from) * t
}

/// Facial-animation target: a named set of scalar shape channels.
pub trait FaceTarget {
    /// Channels this face exposes.
    fn shape_channels(&self) -> HashSet<String>;

    /// Write weights. Names the face does not have are ignored.
    fn apply(&mut self, weights: &VisemeWeightMap);
}

/// Plain in-memory morph-target values, e.g. for a headless renderer or a websocket feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MorphTargets {
    values: BTreeMap<String, f32>,
}

impl MorphTargets {
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: channels.into_iter().map(|c| (c.into(), 0.0)).collect(),
        }
    }

    /// A ReadyPlayerMe avatar exported with ARKit morph targets.
    pub fn ready_player_me() -> Self {
        Self::new(VISEME_CHANNELS)
    }

    pub fn value(&self, channel: &str) -> Option<f32> {
        self.values.get(channel).copied()
    }
}

impl FaceTarget for MorphTargets {
    fn shape_channels(&self) -> HashSet<String> {
        self.values.keys().cloned().collect()
    }

    fn apply(&mut self, weights: &VisemeWeightMap) {
        for (channel, value) in self.values.iter_mut() {
            *value = weights.get(channel);
        }
    }
}

/// Drives a [`FaceTarget`] from whatever the sink is playing, one frame per tick.
pub struct LipSyncDriver<F: FaceTarget> {
    engine: VisemeLipSyncEngine,
    face: F,
    channels: HashSet<String>,
    weights: VisemeWeightMap,
}

impl<F: FaceTarget> LipSyncDriver<F> {
    pub fn new(config: &LipSyncConfig, face: F) -> Self {
        let channels = face.shape_channels();
        debug!("LipSync: {} shape channels on face", channels.len());
        Self {
            engine: VisemeLipSyncEngine::new(config),
            face,
            channels,
            weights: VisemeWeightMap::new(),
        }
    }

    /// Pull the sink's live spectrum and advance one frame. No spectrum counts as silence.
    pub fn tick<S: AudioSink>(&mut self, sink: &S) {
        let spectrum = sink.spectrum();
        self.update(spectrum.as_ref());
    }

    /// Advance one frame from an explicit spectrum.
    pub fn update(&mut self, spectrum: Option<&Spectrum>) {
        let (bins, sample_rate) = match spectrum {
            Some(s) => (s.magnitudes.as_slice(), s.sample_rate),
            None => (&[][..], 0),
        };
        self.weights = self.engine.step(&self.weights, bins, sample_rate, &self.channels);
        self.face.apply(&self.weights);
    }

    /// End of the speaking turn: close the mouth and forget the weights.
    pub fn reset(&mut self) {
        self.weights = VisemeWeightMap::new();
        self.face.apply(&self.weights);
    }

    pub fn weights(&self) -> &VisemeWeightMap {
        &self.weights
    }

    pub fn face(&self) -> &F {
        &self.face
    }

    pub fn face_mut(&mut self) -> &mut F {
        &mut self.face
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 24_000;
    const BINS: usize = 128;

    fn all_channels() -> HashSet<String> {
        VISEME_CHANNELS.iter().map(|s| s.to_string()).collect()
    }

    /// Spectrum with `level` in every bin whose frequency falls in `[lo, hi)`.
    fn band_spectrum(lo: f32, hi: f32, level: f32) -> Vec<f32> {
        let hz = RATE as f32 / (2 * BINS) as f32;
        (0..BINS)
            .map(|i| {
                let f = i as f32 * hz;
                if f >= lo && f < hi {
                    level
                } else {
                    0.0
                }
            })
            .collect()
    }

    #[test]
    fn test_band_mapping_uses_bin_frequency() {
        // 24 kHz over 128 bins = 93.75 Hz per bin.
        let bands = BandEnergies::from_bins(&band_spectrum(300.0, 800.0, 0.8), RATE);
        assert!((bands.mid_low - 0.8).abs() < 1e-6);
        assert_eq!(bands.low, 0.0);
        assert_eq!(bands.high, 0.0);
        assert!((bands.activity() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_zero_spectrum_decays_to_empty() {
        let engine = VisemeLipSyncEngine::default();
        let channels = all_channels();
        let mut weights = VisemeWeightMap::new();
        for ch in VISEME_CHANNELS {
            weights.set(ch, 1.0);
        }

        let silent = vec![0.0; BINS];
        let mut frames = 0;
        while !weights.is_empty() {
            let next = engine.step(&weights, &silent, RATE, &channels);
            for (ch, w) in next.iter() {
                assert!(w < weights.get(ch));
            }
            weights = next;
            frames += 1;
            assert!(frames <= 25, "weights still present after {} frames", frames);
        }
    }

    #[test]
    fn test_mid_low_energy_drives_aa_monotonically() {
        let engine = VisemeLipSyncEngine::default();
        let channels = all_channels();
        let spectrum = band_spectrum(300.0, 800.0, 0.8);

        let mut weights = VisemeWeightMap::new();
        let mut last = 0.0;
        for _ in 0..20 {
            weights = engine.step(&weights, &spectrum, RATE, &channels);
            let aa = weights.get("viseme_aa");
            assert!(aa > last, "aa should rise: {} -> {}", last, aa);
            assert!(aa <= 0.8 + 1e-6);
            last = aa;
        }
        assert!((last - 0.8).abs() < 1e-3);
        assert!(weights.get("viseme_aa") > weights.get("viseme_SS"));
    }

    #[test]
    fn test_missing_channels_are_ignored() {
        let engine = VisemeLipSyncEngine::default();
        let only_jaw: HashSet<String> = ["jawOpen".to_string()].into_iter().collect();
        let weights = engine.step(&VisemeWeightMap::new(), &band_spectrum(80.0, 4000.0, 1.0), RATE, &only_jaw);
        assert_eq!(weights.len(), 1);
        assert!(weights.get("jawOpen") > 0.0);
    }

    #[test]
    fn test_quiet_frame_below_floor_only_decays() {
        let engine = VisemeLipSyncEngine::default();
        let mut prev = VisemeWeightMap::new();
        prev.set("viseme_O", 0.5);
        let whisper = band_spectrum(300.0, 800.0, 0.1); // activity 0.025
        let next = engine.step(&prev, &whisper, RATE, &all_channels());
        assert_eq!(next.len(), 1);
        assert!((next.get("viseme_O") - 0.35).abs() < 1e-6);
    }

    struct SilentSink;

    impl AudioSink for SilentSink {
        fn start(&mut self, _clip: &crate::playback::SpeechClip) -> crate::error::VoiceResult<()> {
            Ok(())
        }
        fn poll(&mut self) -> crate::sink::SinkStatus {
            crate::sink::SinkStatus::Idle
        }
        fn halt(&mut self) {}
        fn spectrum(&self) -> Option<Spectrum> {
            None
        }
    }

    #[test]
    fn test_driver_writes_face_and_resets() {
        let mut driver = LipSyncDriver::new(&LipSyncConfig::default(), MorphTargets::new(["jawOpen", "eyeBlinkLeft"]));
        let speech = Spectrum {
            magnitudes: band_spectrum(80.0, 4000.0, 0.9),
            sample_rate: RATE,
        };
        driver.update(Some(&speech));
        assert!(driver.face().value("jawOpen").unwrap() > 0.0);
        assert_eq!(driver.face().value("eyeBlinkLeft"), Some(0.0));
        assert_eq!(driver.face().value("viseme_aa"), None);

        driver.tick(&SilentSink);
        let decayed = driver.face().value("jawOpen").unwrap();
        assert!(decayed > 0.0);

        driver.reset();
        assert!(driver.weights().is_empty());
        assert_eq!(driver.face().value("jawOpen"), Some(0.0));
    }

    #[test]
    fn test_weight_map_serializes_flat() {
        let mut weights = VisemeWeightMap::new();
        weights.set("jawOpen", 2.0);
        let json = serde_json::to_string(&weights).unwrap();
        assert_eq!(json, r#"{"jawOpen":1.0}"#);
    }
}
