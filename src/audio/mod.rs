//! # Audio Decoding Module
//!
//! Decodes stored audio files into the waveform representation the analysis
//! pipeline consumes.
//!
//! ## Waveform Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz); files at other rates are resampled
//! - **Channels**: Mono; multi-channel files are mixed down
//! - **Samples**: 32-bit floats in [-1.0, 1.0]

pub mod decode;

pub use decode::{load_waveform, Waveform, ANALYSIS_SAMPLE_RATE};
