//! # Transcription Service
//!
//! Produces text, confidence, and an embedding for one audio file, borrowing
//! a model from the cache for the minimum necessary scope.
//!
//! ## Scoped Acquisition:
//! The model handle is acquired at the start of `analyze` and dropped at the
//! end of the same call (on success, error, or panic), so a long-running
//! pipeline never pins a model beyond the inference it actually performs.

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::transcription::cache::ModelCache;
use crate::transcription::model::{ModelSize, Transcription};
use std::sync::Arc;

/// Transcript plus embedding for one recording.
#[derive(Debug, Clone)]
pub struct SpeechAnalysis {
    pub transcription: Transcription,
    pub embedding: Vec<f32>,
}

/// Wraps cache-borrowed models into per-file speech analysis.
///
/// The transcription language is fixed configuration: the reference and
/// sample recordings of one course are in the same language, and no
/// auto-detection fallback is attempted.
pub struct TranscriptionService {
    cache: Arc<ModelCache>,
    model_id: String,
    language: String,
}

impl TranscriptionService {
    pub fn new(cache: Arc<ModelCache>, model_id: String, language: String) -> Self {
        Self {
            cache,
            model_id,
            language,
        }
    }

    /// Model/version tag recorded on analysis results.
    pub fn model_version(&self) -> String {
        self.model_id
            .parse::<ModelSize>()
            .map(|size| size.version_tag())
            .unwrap_or_else(|_| self.model_id.clone())
    }

    /// Transcribe and embed one waveform.
    ///
    /// ## Parameters:
    /// - **samples**: mono 16kHz f32 waveform
    /// - **source**: label for error context (which file failed)
    ///
    /// Model-load failures propagate as `ModelLoad` (retryable at task
    /// level); inference failures are wrapped as transcription-stage errors
    /// with the file context attached.
    pub fn analyze(&self, samples: &[f32], source: &str) -> PipelineResult<SpeechAnalysis> {
        let handle = self.cache.acquire(&self.model_id)?;

        let transcription = handle
            .transcribe(samples, &self.language)
            .map_err(|e| PipelineError::stage(Stage::Transcription, Some(source), e))?;

        let embedding = handle
            .embed(samples)
            .map_err(|e| PipelineError::stage(Stage::Transcription, Some(source), e))?;

        tracing::debug!(
            source,
            model = handle.model_id(),
            device = %handle.device(),
            chars = transcription.text.len(),
            confidence = transcription.confidence,
            "Speech analysis complete"
        );

        Ok(SpeechAnalysis {
            transcription,
            embedding,
        })
        // `handle` drops here, releasing the cache reference.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use crate::transcription::cache::{CacheLimits, ModelLoader};
    use crate::transcription::model::SpeechModel;
    use std::time::Duration;

    struct EchoModel;

    impl SpeechModel for EchoModel {
        fn transcribe(&self, _samples: &[f32], language: &str) -> anyhow::Result<Transcription> {
            Ok(Transcription {
                text: format!("lang:{}", language),
                confidence: 0.8,
            })
        }

        fn embed(&self, samples: &[f32]) -> anyhow::Result<Vec<f32>> {
            Ok(vec![samples.len() as f32; 4])
        }

        fn memory_bytes(&self) -> u64 {
            1024
        }
    }

    struct EchoLoader;

    impl ModelLoader for EchoLoader {
        fn load(
            &self,
            _model_id: &str,
            _device: DeviceKind,
        ) -> Result<Arc<dyn SpeechModel>, String> {
            Ok(Arc::new(EchoModel))
        }

        fn estimated_memory_bytes(&self, _model_id: &str) -> u64 {
            1024
        }
    }

    fn test_service() -> TranscriptionService {
        let cache = Arc::new(ModelCache::new(
            Arc::new(EchoLoader),
            CacheLimits {
                max_memory_bytes: 1024 * 1024,
                accelerator_memory_bytes: 1024 * 1024,
                max_idle: Duration::from_secs(60),
                min_headroom_bytes: 0,
            },
            DeviceKind::Cpu,
        ));
        TranscriptionService::new(cache, "small".to_string(), "zh".to_string())
    }

    #[test]
    fn test_analyze_uses_configured_language() {
        let service = test_service();
        let analysis = service.analyze(&[0.0; 1600], "ref.wav").unwrap();
        assert_eq!(analysis.transcription.text, "lang:zh");
        assert_eq!(analysis.embedding.len(), 4);
    }

    #[test]
    fn test_handle_released_after_analyze() {
        let service = test_service();
        let _ = service.analyze(&[0.0; 1600], "ref.wav").unwrap();
        let status = service.cache.status();
        assert_eq!(status.active_entries, 0);
        assert_eq!(status.total_entries, 1);
    }

    #[test]
    fn test_model_version_tag() {
        let service = test_service();
        assert_eq!(service.model_version(), "whisper-small");
    }
}
