//! # Acoustic Feature Extraction
//!
//! Deterministic signal-level features computed from a single waveform,
//! independent of any other waveform.
//!
//! ## Invariant:
//! `extract` always returns a complete `FeatureSet` with all five fields
//! finite and numeric: silent, short, or otherwise degenerate input clamps
//! to defined fallback values instead of erroring. The ratio computations in
//! the similarity scorer rely on this.

use crate::transcription::Transcription;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Bounds applied to the signal-to-noise ratio in decibels.
const SNR_DB_MIN: f32 = -100.0;
const SNR_DB_MAX: f32 = 100.0;

/// Pitch search range for the harmonicity analysis, in Hz.
const PITCH_MIN_HZ: f32 = 75.0;
const PITCH_MAX_HZ: f32 = 500.0;

/// Autocorrelation peak below which a frame counts as unvoiced.
const VOICING_THRESHOLD: f32 = 0.3;

/// The five-field acoustic/confidence summary of one audio file.
///
/// Field names match the persisted result payload
/// (`clarity_reference` / `clarity_sample` objects).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    /// Signal-to-noise ratio in dB
    pub snr: f32,
    /// Harmonics-to-noise ratio in dB (0.0 when unvoiced/undetectable)
    pub hnr: f32,
    /// Shannon entropy of the normalized magnitude spectrum, in bits
    pub entropy: f32,
    /// Mean transcription confidence in [0, 1] (0.0 when unavailable)
    pub confidence: f32,
    /// Short-time objective intelligibility of the signal against itself
    pub intelligibility: f32,
}

/// Computes clarity features from a waveform.
pub struct FeatureExtractor {
    planner: std::sync::Mutex<FftPlanner<f32>>,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self {
            planner: std::sync::Mutex::new(FftPlanner::new()),
        }
    }

    /// Extract the full feature set for one waveform.
    ///
    /// ## Parameters:
    /// - **samples**: mono f32 waveform
    /// - **sample_rate**: waveform sample rate in Hz
    /// - **transcription**: the file's transcription, source of the
    ///   confidence field; `None` yields confidence 0.0
    pub fn extract(
        &self,
        samples: &[f32],
        sample_rate: u32,
        transcription: Option<&Transcription>,
    ) -> FeatureSet {
        let snr = finite_or(self.signal_to_noise_ratio(samples), SNR_DB_MIN)
            .clamp(SNR_DB_MIN, SNR_DB_MAX);
        let hnr = finite_or(self.harmonics_to_noise_ratio(samples, sample_rate), 0.0);
        let entropy = finite_or(self.spectral_entropy(samples), 0.0).max(0.0);
        let confidence = transcription
            .map(|t| finite_or(t.confidence, 0.0))
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let intelligibility =
            finite_or(self.self_intelligibility(samples, sample_rate), 0.0).clamp(0.0, 1.0);

        FeatureSet {
            snr,
            hnr,
            entropy,
            confidence,
            intelligibility,
        }
    }

    /// Ratio of mean signal power to the estimated noise floor power, in dB.
    ///
    /// The noise floor is the 10th percentile of the absolute amplitude; the
    /// `1e-6` term keeps the zero-noise case finite so clamping (not an
    /// error) handles clean recordings.
    fn signal_to_noise_ratio(&self, samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return SNR_DB_MIN;
        }

        let mean_power =
            samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32;
        let noise_floor = percentile_abs(samples, 0.10);

        10.0 * (mean_power / (noise_floor * noise_floor + 1e-6)).log10()
    }

    /// Autocorrelation-based harmonicity, averaged over voiced frames.
    ///
    /// Per 40 ms frame the normalized autocorrelation peak `r` in the pitch
    /// lag range gives `10·log10(r / (1 - r))`. Frames whose peak falls
    /// below the voicing threshold are skipped; when no frame is voiced the
    /// result is the defined fallback 0.0.
    fn harmonics_to_noise_ratio(&self, samples: &[f32], sample_rate: u32) -> f32 {
        let frame_len = (sample_rate as usize * 40) / 1000;
        let hop = (sample_rate as usize * 10) / 1000;
        let min_lag = (sample_rate as f32 / PITCH_MAX_HZ) as usize;
        let max_lag = (sample_rate as f32 / PITCH_MIN_HZ) as usize;

        if frame_len == 0 || hop == 0 || samples.len() < frame_len || max_lag >= frame_len {
            return 0.0;
        }

        let mut frame_values = Vec::new();
        let mut start = 0;
        while start + frame_len <= samples.len() {
            let frame = &samples[start..start + frame_len];
            start += hop;

            let mean = frame.iter().sum::<f32>() / frame_len as f32;
            let centered: Vec<f32> = frame.iter().map(|&s| s - mean).collect();
            let energy: f32 = centered.iter().map(|&s| s * s).sum();
            if energy < 1e-9 {
                continue;
            }

            let mut peak = 0.0f32;
            for lag in min_lag..=max_lag {
                let mut acc = 0.0f32;
                for i in 0..frame_len - lag {
                    acc += centered[i] * centered[i + lag];
                }
                let r = acc / energy;
                if r > peak {
                    peak = r;
                }
            }

            if peak > VOICING_THRESHOLD {
                let peak = peak.min(0.999_999);
                frame_values.push(10.0 * (peak / (1.0 - peak)).log10());
            }
        }

        if frame_values.is_empty() {
            return 0.0;
        }
        frame_values.iter().sum::<f32>() / frame_values.len() as f32
    }

    /// Shannon entropy (bits) of the normalized magnitude spectrum.
    fn spectral_entropy(&self, samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }

        let spectrum = self.magnitude_spectrum(samples);
        let total: f32 = spectrum.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }

        -spectrum
            .iter()
            .map(|&s| {
                let p = s / total;
                p * (p + 1e-12).log2()
            })
            .sum::<f32>()
    }

    /// Magnitude spectrum of the whole signal (first half of the FFT).
    fn magnitude_spectrum(&self, samples: &[f32]) -> Vec<f32> {
        let mut buffer: Vec<Complex<f32>> =
            samples.iter().map(|&s| Complex::new(s, 0.0)).collect();

        let fft = {
            let mut planner = self.planner.lock().unwrap();
            planner.plan_fft_forward(buffer.len())
        };
        fft.process(&mut buffer);

        buffer[..buffer.len() / 2 + 1]
            .iter()
            .map(|c| c.norm())
            .collect()
    }

    /// Short-time objective intelligibility of the waveform against itself.
    ///
    /// Third-octave band envelopes over 25.6 ms frames at 10 kHz, correlated
    /// per 30-frame segment between the "clean" and "degraded" signals,
    /// here the same signal. That makes this a clarity proxy: well-modulated
    /// speech scores near 1.0, silence scores 0.0.
    fn self_intelligibility(&self, samples: &[f32], sample_rate: u32) -> f32 {
        const STOI_RATE: u32 = 10_000;
        const FRAME_LEN: usize = 256;
        const HOP: usize = 128;
        const FFT_LEN: usize = 512;
        const NUM_BANDS: usize = 15;
        const SEGMENT_FRAMES: usize = 30;
        const DYN_RANGE_DB: f32 = 40.0;

        let resampled = crate::audio::decode::resample_linear(samples, sample_rate, STOI_RATE);
        if resampled.len() < FRAME_LEN {
            return 0.0;
        }

        // Hann-windowed frame energies, used to drop silent frames.
        let window: Vec<f32> = (0..FRAME_LEN)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (FRAME_LEN - 1) as f32).cos())
            .collect();

        let frame_count = (resampled.len() - FRAME_LEN) / HOP + 1;
        let mut frames: Vec<Vec<f32>> = Vec::with_capacity(frame_count);
        let mut energies = Vec::with_capacity(frame_count);
        for f in 0..frame_count {
            let start = f * HOP;
            let frame: Vec<f32> = resampled[start..start + FRAME_LEN]
                .iter()
                .zip(&window)
                .map(|(&s, &w)| s * w)
                .collect();
            let energy: f32 = frame.iter().map(|&s| s * s).sum();
            energies.push(energy);
            frames.push(frame);
        }

        let max_energy = energies.iter().cloned().fold(0.0f32, f32::max);
        if max_energy <= 0.0 {
            return 0.0;
        }
        let threshold = max_energy / 10f32.powf(DYN_RANGE_DB / 10.0);
        let active: Vec<usize> = (0..frame_count)
            .filter(|&f| energies[f] > threshold)
            .collect();
        if active.len() < SEGMENT_FRAMES {
            return 0.0;
        }

        // Third-octave band edges from 150 Hz upward.
        let bin_hz = STOI_RATE as f32 / FFT_LEN as f32;
        let band_bins: Vec<(usize, usize)> = (0..NUM_BANDS)
            .map(|k| {
                let lo = 150.0 * 2f32.powf(k as f32 / 3.0 - 1.0 / 6.0);
                let hi = 150.0 * 2f32.powf(k as f32 / 3.0 + 1.0 / 6.0);
                let lo_bin = (lo / bin_hz).floor() as usize;
                let hi_bin = ((hi / bin_hz).ceil() as usize).min(FFT_LEN / 2);
                (lo_bin, hi_bin.max(lo_bin + 1))
            })
            .collect();

        let fft = {
            let mut planner = self.planner.lock().unwrap();
            planner.plan_fft_forward(FFT_LEN)
        };

        // Band envelope per active frame.
        let mut envelopes: Vec<Vec<f32>> = Vec::with_capacity(active.len());
        for &f in &active {
            let mut buffer: Vec<Complex<f32>> = frames[f]
                .iter()
                .map(|&s| Complex::new(s, 0.0))
                .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
                .take(FFT_LEN)
                .collect();
            fft.process(&mut buffer);

            let band_env: Vec<f32> = band_bins
                .iter()
                .map(|&(lo, hi)| {
                    buffer[lo..hi]
                        .iter()
                        .map(|c| c.norm_sqr())
                        .sum::<f32>()
                        .sqrt()
                })
                .collect();
            envelopes.push(band_env);
        }

        // Per-band correlation over 30-frame segments; identical inputs give
        // correlation 1 wherever the envelope has any variance.
        let mut total = 0.0f32;
        let mut cells = 0usize;
        let mut segment_start = 0;
        while segment_start + SEGMENT_FRAMES <= envelopes.len() {
            for band in 0..NUM_BANDS {
                let x: Vec<f32> = (0..SEGMENT_FRAMES)
                    .map(|i| envelopes[segment_start + i][band])
                    .collect();
                match normalized_correlation(&x, &x) {
                    Some(r) => {
                        total += r;
                        cells += 1;
                    }
                    // Degenerate cell on both sides of a self-comparison:
                    // the vectors are equal by construction.
                    None => {
                        total += 1.0;
                        cells += 1;
                    }
                }
            }
            segment_start += SEGMENT_FRAMES;
        }

        if cells == 0 {
            return 0.0;
        }
        total / cells as f32
    }
}

/// Pearson-style correlation of two equal-length vectors; `None` when either
/// side has no variance.
fn normalized_correlation(x: &[f32], y: &[f32]) -> Option<f32> {
    let n = x.len() as f32;
    let mean_x = x.iter().sum::<f32>() / n;
    let mean_y = y.iter().sum::<f32>() / n;

    let mut dot = 0.0f32;
    let mut norm_x = 0.0f32;
    let mut norm_y = 0.0f32;
    for i in 0..x.len() {
        let dx = x[i] - mean_x;
        let dy = y[i] - mean_y;
        dot += dx * dy;
        norm_x += dx * dx;
        norm_y += dy * dy;
    }

    let denom = (norm_x * norm_y).sqrt();
    if denom < 1e-12 {
        return None;
    }
    Some(dot / denom)
}

/// Percentile of the absolute amplitude with linear interpolation.
fn percentile_abs(samples: &[f32], fraction: f32) -> f32 {
    let mut magnitudes: Vec<f32> = samples.iter().map(|s| s.abs()).collect();
    magnitudes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let position = fraction * (magnitudes.len() - 1) as f32;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f32;
    magnitudes[lower] * (1.0 - weight) + magnitudes[upper.min(magnitudes.len() - 1)] * weight
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_all_finite(features: &FeatureSet) {
        assert!(features.snr.is_finite());
        assert!(features.hnr.is_finite());
        assert!(features.entropy.is_finite());
        assert!(features.confidence.is_finite());
        assert!(features.intelligibility.is_finite());
    }

    fn voiced_signal(seconds: f32) -> Vec<f32> {
        // 120 Hz fundamental with harmonics and a slow amplitude contour,
        // roughly speech-shaped for the voicing and band analyses.
        let sample_rate = 16_000.0;
        let len = (seconds * sample_rate) as usize;
        (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate;
                let envelope = 0.5 + 0.5 * (2.0 * PI * 3.0 * t).sin().abs();
                envelope
                    * (0.6 * (2.0 * PI * 120.0 * t).sin()
                        + 0.3 * (2.0 * PI * 240.0 * t).sin()
                        + 0.1 * (2.0 * PI * 480.0 * t).sin())
            })
            .collect()
    }

    #[test]
    fn test_silent_input_is_finite() {
        let extractor = FeatureExtractor::new();
        let features = extractor.extract(&vec![0.0; 16_000], 16_000, None);
        assert_all_finite(&features);
        assert_eq!(features.confidence, 0.0);
        assert_eq!(features.hnr, 0.0);
        assert_eq!(features.intelligibility, 0.0);
    }

    #[test]
    fn test_empty_input_is_finite() {
        let extractor = FeatureExtractor::new();
        let features = extractor.extract(&[], 16_000, None);
        assert_all_finite(&features);
    }

    #[test]
    fn test_single_sample_is_finite() {
        let extractor = FeatureExtractor::new();
        let features = extractor.extract(&[0.7], 16_000, None);
        assert_all_finite(&features);
    }

    #[test]
    fn test_voiced_signal_features() {
        let extractor = FeatureExtractor::new();
        let signal = voiced_signal(2.0);
        let features = extractor.extract(&signal, 16_000, None);

        assert_all_finite(&features);
        // A periodic signal has positive SNR and detectable harmonicity.
        assert!(features.snr > 0.0, "snr = {}", features.snr);
        assert!(features.hnr > 0.0, "hnr = {}", features.hnr);
        // Modulated, well-voiced audio is near-perfectly intelligible
        // against itself.
        assert!(
            features.intelligibility > 0.9,
            "intelligibility = {}",
            features.intelligibility
        );
    }

    #[test]
    fn test_confidence_comes_from_transcription() {
        let extractor = FeatureExtractor::new();
        let transcription = Transcription {
            text: "hello".to_string(),
            confidence: 0.87,
        };
        let features = extractor.extract(&voiced_signal(1.0), 16_000, Some(&transcription));
        assert!((features.confidence - 0.87).abs() < 1e-6);
    }

    #[test]
    fn test_entropy_orders_noise_above_tone() {
        let extractor = FeatureExtractor::new();

        let tone: Vec<f32> = (0..16_000)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / 16_000.0).sin())
            .collect();
        // Deterministic pseudo-noise, wideband enough to spread the spectrum.
        let mut seed = 0x12345678u32;
        let noise: Vec<f32> = (0..16_000)
            .map(|_| {
                seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                (seed >> 8) as f32 / 8_388_608.0 - 1.0
            })
            .collect();

        let tone_entropy = extractor.extract(&tone, 16_000, None).entropy;
        let noise_entropy = extractor.extract(&noise, 16_000, None).entropy;
        assert!(
            noise_entropy > tone_entropy,
            "noise {} <= tone {}",
            noise_entropy,
            tone_entropy
        );
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let extractor = FeatureExtractor::new();
        let signal = voiced_signal(1.0);
        let first = extractor.extract(&signal, 16_000, None);
        let second = extractor.extract(&signal, 16_000, None);
        assert_eq!(first, second);
    }

    #[test]
    fn test_percentile_interpolation() {
        let samples = [0.0f32, 1.0, 2.0, 3.0, 4.0];
        assert!((percentile_abs(&samples, 0.5) - 2.0).abs() < 1e-6);
        assert!((percentile_abs(&samples, 0.0) - 0.0).abs() < 1e-6);
        assert!((percentile_abs(&samples, 1.0) - 4.0).abs() < 1e-6);
    }
}
