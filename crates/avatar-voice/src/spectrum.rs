//! Spectrum tap shared by VAD (microphone) and lip sync (playback).
//!
//! Uses realfft for the real-signal FFT. Output magnitudes are amplitude-normalized
//! (`2/N`) so a full-scale sine reads roughly the same regardless of window size.

use crate::config::ENERGY_FLOOR_DB;
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::fmt;
use std::sync::Arc;

/// Loudest level of the normalized (`[0, 1]`) scale, matching a browser analyser's default range.
const NORMALIZED_MAX_DB: f32 = -30.0;

/// One frame of magnitude bins plus the sample rate needed to place them in Hz.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub magnitudes: Vec<f32>,
    pub sample_rate: u32,
}

/// Hann-windowed magnitude spectrum over a fixed window length.
pub struct SpectrumAnalyzer {
    fft_size: usize,
    hann_window: Vec<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
}

impl fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("fft_size", &self.fft_size)
            .finish()
    }
}

impl SpectrumAnalyzer {
    /// `fft_size` is clamped to at least 2.
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let hann_window: Vec<f32> = (0..fft_size)
            .map(|i| {
                let x = std::f32::consts::PI * i as f32 / (fft_size - 1) as f32;
                0.5 * (1.0 - (2.0 * x).cos())
            })
            .collect();

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);

        Self {
            fft_size,
            hann_window,
            fft,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of bins returned by `normalized` (DC bin dropped, like a browser analyser).
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Amplitude spectrum (`fft_size / 2 + 1` bins) of the newest `fft_size` samples.
    /// Shorter input is zero-padded.
    pub fn magnitudes(&self, samples: &[f32]) -> Vec<f32> {
        let n_bins = self.fft_size / 2 + 1;
        let start = samples.len().saturating_sub(self.fft_size);
        let mut windowed = vec![0.0f32; self.fft_size];
        for (i, &sample) in samples[start..].iter().enumerate() {
            windowed[i] = sample * self.hann_window[i];
        }

        let mut spectrum = vec![Complex::new(0.0f32, 0.0f32); n_bins];
        if self.fft.process(&mut windowed, &mut spectrum).is_err() {
            return vec![0.0; n_bins];
        }
        let scale = 2.0 / self.fft_size as f32;
        spectrum.iter().map(|c| c.norm() * scale).collect()
    }

    /// Mean bin energy in dB. Zero energy maps to the -100 dB floor.
    pub fn energy_db(&self, samples: &[f32]) -> f32 {
        energy_db(&self.magnitudes(samples))
    }

    /// Bins mapped from [-100, -30] dB onto [0, 1].
    pub fn normalized(&self, samples: &[f32], sample_rate: u32) -> Spectrum {
        let magnitudes = self
            .magnitudes(samples)
            .iter()
            .skip(1)
            .take(self.bin_count())
            .map(|&m| normalize_db(amplitude_to_db(m)))
            .collect();
        Spectrum {
            magnitudes,
            sample_rate,
        }
    }
}

/// Mean of squared magnitudes, in dB, floored at -100.
pub fn energy_db(magnitudes: &[f32]) -> f32 {
    if magnitudes.is_empty() {
        return ENERGY_FLOOR_DB;
    }
    let energy = magnitudes.iter().map(|m| m * m).sum::<f32>() / magnitudes.len() as f32;
    if energy <= 0.0 || !energy.is_finite() {
        return ENERGY_FLOOR_DB;
    }
    (10.0 * energy.log10()).max(ENERGY_FLOOR_DB)
}

fn amplitude_to_db(magnitude: f32) -> f32 {
    if magnitude <= 0.0 {
        return ENERGY_FLOOR_DB;
    }
    (20.0 * magnitude.log10()).max(ENERGY_FLOOR_DB)
}

fn normalize_db(db: f32) -> f32 {
    ((db - ENERGY_FLOOR_DB) / (NORMALIZED_MAX_DB - ENERGY_FLOOR_DB)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, amplitude: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_silence_hits_floor() {
        let analyzer = SpectrumAnalyzer::new(512);
        assert_eq!(analyzer.energy_db(&vec![0.0; 512]), ENERGY_FLOOR_DB);
        assert_eq!(analyzer.energy_db(&[]), ENERGY_FLOOR_DB);
    }

    #[test]
    fn test_tone_is_well_above_floor() {
        let analyzer = SpectrumAnalyzer::new(512);
        let db = analyzer.energy_db(&sine(440.0, 0.5, 16000, 512));
        assert!(db > -60.0, "tone energy {} dB", db);
        assert!(db < 0.0);
    }

    #[test]
    fn test_peak_lands_on_tone_bin() {
        let analyzer = SpectrumAnalyzer::new(256);
        // 16 kHz / 256 = 62.5 Hz per bin; 1000 Hz is bin 16.
        let mags = analyzer.magnitudes(&sine(1000.0, 0.8, 16000, 256));
        let peak = mags
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 16);
    }

    #[test]
    fn test_normalized_range_and_length() {
        let analyzer = SpectrumAnalyzer::new(256);
        let spectrum = analyzer.normalized(&sine(500.0, 0.9, 24000, 256), 24000);
        assert_eq!(spectrum.magnitudes.len(), 128);
        assert_eq!(spectrum.sample_rate, 24000);
        assert!(spectrum.magnitudes.iter().all(|m| (0.0..=1.0).contains(m)));
        assert!(spectrum.magnitudes.iter().any(|&m| m > 0.5));
    }
}
