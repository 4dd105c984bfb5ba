//! # Analysis Module
//!
//! The acoustic/semantic comparison between a reference recording and a
//! user recording.
//!
//! ## Key Components:
//! - **Feature Extraction**: Signal-level clarity features per waveform
//!   (SNR, HNR, spectral entropy, transcription confidence, intelligibility)
//! - **Similarity Scoring**: Clamped feature ratios + embedding cosine +
//!   transcript similarity combined into one composite index and a 1–5 level
//! - **Suggestion Generation**: External generative-language call that turns
//!   the metric bundle into coaching feedback

pub mod features;
pub mod scoring;
pub mod suggestion;

pub use features::{FeatureExtractor, FeatureSet};
pub use scoring::{MetricsBundle, SimilarityMetrics, SimilarityScorer};
pub use suggestion::{HttpSuggestionClient, StaticSuggestionGenerator, SuggestionGenerator};
