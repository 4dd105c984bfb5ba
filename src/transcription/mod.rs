//! # Transcription Module
//!
//! Speech-to-text transcription using Whisper models via the Candle-rs
//! framework, plus the process-wide model cache that bounds how many of
//! those models are resident at once.
//!
//! ## Key Components:
//! - **Model Loading**: Candle Whisper weights, tokenizer, and mel frontend
//! - **Model Cache**: Reference-counted, memory-bounded cache with scoped handles
//! - **Transcription Service**: Text + confidence + embedding for one audio file
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, good balance for development
//! - **small**: ~244MB, the default for analysis workloads
//! - **medium**: ~769MB, better technical vocabulary
//! - **large**: ~1550MB, best accuracy but slowest
//!
//! ## Candle-rs Integration:
//! Pure Rust inference (no whisper.cpp FFI): safer memory handling, no C++
//! build dependencies, and model unloading is an ordinary drop of the owning
//! reference rather than a garbage-collector hint.

pub mod cache;
pub mod model;
pub mod service;

pub use cache::{CacheStatus, ModelCache, ModelHandle, ModelLoader};
pub use model::{ModelSize, SpeechModel, Transcription};
pub use service::{SpeechAnalysis, TranscriptionService};
