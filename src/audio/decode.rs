//! # Waveform Loading and Preprocessing
//!
//! Reads WAV files into normalized mono f32 waveforms at the analysis sample
//! rate. All audio entering the pipeline, reference and sample alike,
//! passes through here, so feature extraction and transcription can assume
//! one canonical format.
//!
//! ## Processing Steps:
//! 1. **Decode**: Parse the WAV container and convert PCM to f32
//! 2. **Mixdown**: Average channels to mono
//! 3. **Resample**: Linear interpolation to 16kHz when needed
//! 4. **Sanity check**: Reject empty or structurally broken files

use anyhow::{anyhow, Result};
use std::fs::File;
use std::path::Path;

/// Sample rate every downstream consumer (features, Whisper mel) expects.
pub const ANALYSIS_SAMPLE_RATE: u32 = 16_000;

/// A decoded, analysis-ready waveform.
#[derive(Debug, Clone)]
pub struct Waveform {
    /// Mono samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Always `ANALYSIS_SAMPLE_RATE` after loading
    pub sample_rate: u32,
}

impl Waveform {
    /// Duration of the waveform in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Load a WAV file as a mono 16kHz f32 waveform.
///
/// ## Errors:
/// Fails on unreadable files, unsupported containers, or files that decode
/// to zero samples. Callers wrap the error with their stage context.
pub fn load_waveform(path: &Path) -> Result<Waveform> {
    let mut file = File::open(path)
        .map_err(|e| anyhow!("cannot open audio file {}: {}", path.display(), e))?;

    let (header, data) = wav::read(&mut file)
        .map_err(|e| anyhow!("cannot parse WAV file {}: {}", path.display(), e))?;

    let channels = header.channel_count as usize;
    if channels == 0 {
        return Err(anyhow!("WAV file {} declares zero channels", path.display()));
    }

    let interleaved = to_f32_samples(data)?;
    if interleaved.is_empty() {
        return Err(anyhow!("WAV file {} contains no samples", path.display()));
    }

    let mono = mix_to_mono(&interleaved, channels);
    let samples = if header.sampling_rate == ANALYSIS_SAMPLE_RATE {
        mono
    } else {
        resample_linear(&mono, header.sampling_rate, ANALYSIS_SAMPLE_RATE)
    };

    if samples.is_empty() {
        return Err(anyhow!(
            "WAV file {} resampled to zero samples (rate {})",
            path.display(),
            header.sampling_rate
        ));
    }

    Ok(Waveform {
        samples,
        sample_rate: ANALYSIS_SAMPLE_RATE,
    })
}

/// Convert decoded PCM data of any supported bit depth to f32 in [-1, 1].
fn to_f32_samples(data: wav::BitDepth) -> Result<Vec<f32>> {
    let samples = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples
            .into_iter()
            .map(|s| s as f32 / i16::MAX as f32)
            .collect(),
        wav::BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };
    Ok(samples)
}

/// Average interleaved channels down to a single mono channel.
fn mix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Fidelity is sufficient for the feature ratios and Whisper input here;
/// both recordings in a comparison pass through the same path, so any
/// interpolation artifacts affect reference and sample symmetrically.
/// Also used by the intelligibility analysis to reach its 10 kHz band rate.
pub(crate) fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos.floor() as usize;
        let frac = (src_pos - idx as f64) as f32;

        let current = samples[idx.min(samples.len() - 1)];
        let next = samples[(idx + 1).min(samples.len() - 1)];
        out.push(current + (next - current) * frac);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_to_mono_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        let mono = mix_to_mono(&stereo, 2);
        assert_eq!(mono, vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_mono_passthrough() {
        let samples = [0.1, 0.2, 0.3];
        assert_eq!(mix_to_mono(&samples, 1), samples.to_vec());
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<f32> = (0..3200).map(|i| (i as f32 / 3200.0).sin()).collect();
        let out = resample_linear(&samples, 32_000, 16_000);
        // Downsampling 2:1 keeps half the samples (within rounding).
        assert!((out.len() as i64 - 1600).abs() <= 1);
    }

    #[test]
    fn test_resample_identity_rate() {
        let samples = vec![0.5f32; 100];
        let out = resample_linear(&samples, 16_000, 16_000);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_resample_preserves_constant_signal() {
        let samples = vec![0.25f32; 441];
        let out = resample_linear(&samples, 44_100, 16_000);
        assert!(!out.is_empty());
        for value in out {
            assert!((value - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_load_waveform_roundtrip() {
        // Write a tiny 16kHz mono WAV and read it back.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");

        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, ANALYSIS_SAMPLE_RATE, 16);
        let samples: Vec<i16> = (0..1600)
            .map(|i| ((i as f32 * 0.05).sin() * 10_000.0) as i16)
            .collect();
        let mut file = File::create(&path).unwrap();
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut file).unwrap();

        let waveform = load_waveform(&path).unwrap();
        assert_eq!(waveform.sample_rate, ANALYSIS_SAMPLE_RATE);
        assert_eq!(waveform.samples.len(), 1600);
        assert!(waveform.samples.iter().all(|s| s.abs() <= 1.0));
    }
}
