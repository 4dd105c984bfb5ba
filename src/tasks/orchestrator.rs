//! # Analysis Orchestrator
//!
//! Drives one analysis task through the pipeline: download both recordings,
//! transcribe and feature-extract them, score the comparison, generate the
//! coaching suggestion, and persist the result, with retry, timeout, and
//! cancellation handling around the whole attempt.
//!
//! ## Guarantees:
//! - The committed PENDING→PROCESSING write happens before any stage runs,
//!   so one worker attempt at a time processes a task.
//! - Cancellation is checked between stages and at the retry boundary;
//!   a cancelled task never advances to the next stage.
//! - Downloaded scratch files are owned by drop guards, so they disappear
//!   on success, failure, cancellation, and timeout alike.
//! - Transient errors retry with exponential backoff; permanent errors and
//!   exhausted retries mark the task COMPLETED with no result and the error
//!   recorded on the task row.

use crate::analysis::features::FeatureExtractor;
use crate::analysis::scoring::{self, MetricsBundle, SimilarityMetrics, SimilarityScorer};
use crate::analysis::suggestion::SuggestionGenerator;
use crate::audio::decode::load_waveform;
use crate::config::RetryConfig;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::state::{AppState, TaskOutcome};
use crate::storage::AudioStorage;
use crate::tasks::queue::{CancellationFlag, QueuedJob};
use crate::tasks::store::TaskRecordStore;
use crate::tasks::task::{AnalysisPayload, AnalysisTask, TaskStatus};
use crate::transcription::TranscriptionService;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How one attempt ended, separating cooperative cancellation from errors.
enum AttemptOutcome {
    Completed(AnalysisPayload),
    Cancelled,
}

/// The background pipeline runner. One instance serves the whole worker
/// pool; all mutable state lives in the collaborators it holds.
pub struct AnalysisOrchestrator {
    store: Arc<dyn TaskRecordStore>,
    storage: Arc<dyn AudioStorage>,
    transcriber: Arc<TranscriptionService>,
    extractor: Arc<FeatureExtractor>,
    suggester: Arc<dyn SuggestionGenerator>,
    state: AppState,
    retry: RetryConfig,
}

impl AnalysisOrchestrator {
    pub fn new(
        store: Arc<dyn TaskRecordStore>,
        storage: Arc<dyn AudioStorage>,
        transcriber: Arc<TranscriptionService>,
        extractor: Arc<FeatureExtractor>,
        suggester: Arc<dyn SuggestionGenerator>,
        state: AppState,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            storage,
            transcriber,
            extractor,
            suggester,
            state,
            retry,
        }
    }

    /// Process one queued job to a terminal state.
    ///
    /// Never panics outward and never leaves the task in PROCESSING: every
    /// path ends in COMPLETED or CANCELLED (or an early return when the task
    /// was already terminal before pickup).
    pub async fn process(&self, job: QueuedJob, cancel: CancellationFlag) {
        let task = match self.store.find_task(job.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %job.task_id, "Job references an unknown task, skipping");
                return;
            }
            Err(e) => {
                error!(task_id = %job.task_id, error = %e, "Failed to load task record");
                return;
            }
        };

        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Cancelled => {
                info!(task_id = %task.task_id, "Task was cancelled before pickup");
                return;
            }
            other => {
                warn!(task_id = %task.task_id, status = %other, "Task is not pending, skipping");
                return;
            }
        }

        // A cancel that raced the queue: the flag is up but the record was
        // still PENDING when the canceller looked.
        if cancel.load(Ordering::SeqCst) {
            if let Err(e) = self.store.update_status(task.task_id, TaskStatus::Cancelled).await {
                debug!(task_id = %task.task_id, error = %e, "Cancel-before-start transition rejected");
            }
            self.state.record_task_finished(TaskOutcome::Cancelled);
            info!(task_id = %task.task_id, "Task cancelled before processing started");
            return;
        }

        if let Err(e) = self.store.update_status(task.task_id, TaskStatus::Processing).await {
            error!(task_id = %task.task_id, error = %e, "Failed to mark task processing");
            return;
        }
        self.state.record_task_started();
        info!(task_id = %task.task_id, queue_id = %job.queue_id, "Analysis task started");
        let started = Instant::now();

        let max_attempts = self.retry.max_retries + 1;
        let mut attempt = 0u32;
        loop {
            if cancel.load(Ordering::SeqCst) {
                self.finish_cancelled(task.task_id).await;
                return;
            }

            let hard_limit = Duration::from_secs(self.retry.hard_time_limit_secs);
            let outcome = match tokio::time::timeout(hard_limit, self.run_attempt(&task, &cancel)).await
            {
                Ok(result) => result,
                // The attempt future was dropped; any in-flight blocking
                // compute finishes detached, its outputs discarded.
                Err(_) => Err(PipelineError::TimedOut {
                    limit_secs: self.retry.hard_time_limit_secs,
                }),
            };

            match outcome {
                Ok(AttemptOutcome::Completed(payload)) => {
                    self.finish_completed(task.task_id, payload, started).await;
                    return;
                }
                Ok(AttemptOutcome::Cancelled) => {
                    self.finish_cancelled(task.task_id).await;
                    return;
                }
                Err(e) => {
                    let retries_left = attempt + 1 < max_attempts;
                    if e.is_transient() && retries_left {
                        attempt += 1;
                        let delay = self.backoff_delay(attempt - 1);
                        warn!(
                            task_id = %task.task_id,
                            attempt,
                            delay_secs = delay.as_secs(),
                            error = %e,
                            "Attempt failed, retrying after backoff"
                        );
                        if let Err(store_err) = self
                            .store
                            .record_retry(task.task_id, attempt, &e.to_string())
                            .await
                        {
                            debug!(task_id = %task.task_id, error = %store_err, "Failed to record retry");
                        }
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    self.finish_failed(task.task_id, &e, attempt).await;
                    return;
                }
            }
        }
    }

    /// One attempt under the soft time limit.
    async fn run_attempt(
        &self,
        task: &AnalysisTask,
        cancel: &CancellationFlag,
    ) -> PipelineResult<AttemptOutcome> {
        let soft_limit = Duration::from_secs(self.retry.soft_time_limit_secs);
        match tokio::time::timeout(soft_limit, self.run_stages(task, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::TimedOut {
                limit_secs: self.retry.soft_time_limit_secs,
            }),
        }
    }

    /// The sequential pipeline stages, with cancellation checkpoints between
    /// them. Scratch files are dropped (and deleted) when this function
    /// returns, whichever way it returns.
    async fn run_stages(
        &self,
        task: &AnalysisTask,
        cancel: &CancellationFlag,
    ) -> PipelineResult<AttemptOutcome> {
        self.progress(task.task_id, 5, Stage::Resolve.label()).await;
        let params = &task.params;
        if !self.storage.exists(&params.reference_audio).await? {
            return Err(PipelineError::FileAccess {
                path: params.reference_audio.clone(),
                message: "reference recording does not exist".to_string(),
                permanent: true,
            });
        }
        if !self.storage.exists(&params.sample_audio).await? {
            return Err(PipelineError::FileAccess {
                path: params.sample_audio.clone(),
                message: "sample recording does not exist".to_string(),
                permanent: true,
            });
        }

        self.progress(task.task_id, 10, Stage::Download.label()).await;
        let reference_file = self.storage.download_to_local(&params.reference_audio).await?;
        let sample_file = self.storage.download_to_local(&params.sample_audio).await?;

        if cancel.load(Ordering::SeqCst) {
            return Ok(AttemptOutcome::Cancelled);
        }

        self.progress(task.task_id, 50, Stage::Transcription.label()).await;
        let reference_path = reference_file.path().to_path_buf();
        let sample_path = sample_file.path().to_path_buf();
        let reference_name = params.reference_audio.clone();
        let sample_name = params.sample_audio.clone();
        let transcriber = Arc::clone(&self.transcriber);
        let extractor = Arc::clone(&self.extractor);

        // The whole compute block is CPU-bound and runs on a blocking
        // thread; cancellation applies at the next checkpoint, not inside
        // a model call.
        let metrics = tokio::task::spawn_blocking(move || -> PipelineResult<MetricsBundle> {
            let reference = load_waveform(&reference_path).map_err(|e| {
                PipelineError::stage(Stage::FeatureExtraction, Some(&reference_name), e)
            })?;
            let sample = load_waveform(&sample_path)
                .map_err(|e| PipelineError::stage(Stage::FeatureExtraction, Some(&sample_name), e))?;
            debug!(
                reference_secs = format!("{:.2}", reference.duration_secs()),
                sample_secs = format!("{:.2}", sample.duration_secs()),
                "Waveforms decoded"
            );

            let reference_speech = transcriber.analyze(&reference.samples, &reference_name)?;
            let sample_speech = transcriber.analyze(&sample.samples, &sample_name)?;

            let reference_features = extractor.extract(
                &reference.samples,
                reference.sample_rate,
                Some(&reference_speech.transcription),
            );
            let sample_features = extractor.extract(
                &sample.samples,
                sample.sample_rate,
                Some(&sample_speech.transcription),
            );

            let transcript_similarity = scoring::transcript_similarity(
                &reference_speech.transcription.text,
                &sample_speech.transcription.text,
            );
            let embedding_similarity = scoring::cosine_similarity(
                &reference_speech.embedding,
                &sample_speech.embedding,
            );

            let (composite_index, level) = SimilarityScorer::score(
                &reference_features,
                &sample_features,
                transcript_similarity,
                embedding_similarity,
            );

            Ok(MetricsBundle {
                similarity: SimilarityMetrics {
                    embedding: embedding_similarity.clamp(0.0, 1.0),
                    wer_similarity: transcript_similarity,
                    ref_text: reference_speech.transcription.text,
                    sample_text: sample_speech.transcription.text,
                },
                clarity_reference: reference_features,
                clarity_sample: sample_features,
                composite_index,
                level,
            })
        })
        .await
        .map_err(|e| {
            PipelineError::stage(Stage::Scoring, None, format!("compute task aborted: {}", e))
        })??;

        if cancel.load(Ordering::SeqCst) {
            return Ok(AttemptOutcome::Cancelled);
        }

        self.progress(task.task_id, 80, Stage::Suggestion.label()).await;
        let suggestion = self.suggester.generate(&metrics).await?;

        Ok(AttemptOutcome::Completed(AnalysisPayload {
            metrics,
            suggestion,
        }))
    }

    async fn finish_completed(&self, task_id: Uuid, payload: AnalysisPayload, started: Instant) {
        self.progress(task_id, 90, Stage::Persist.label()).await;

        let processing_secs = started.elapsed().as_secs_f64();
        let model_version = self.transcriber.model_version();
        if let Err(e) = self
            .store
            .save_result(task_id, payload, &model_version, processing_secs)
            .await
        {
            // A task whose result cannot be persisted ends like any other
            // terminal failure: COMPLETED without a result row.
            error!(task_id = %task_id, error = %e, "Failed to persist analysis result");
            let _ = self.store.set_error(task_id, &format!("result persistence failed: {}", e)).await;
            let _ = self.store.update_status(task_id, TaskStatus::Completed).await;
            self.state.record_task_finished(TaskOutcome::Failed);
            return;
        }

        let _ = self.store.update_status(task_id, TaskStatus::Completed).await;
        self.progress(task_id, 100, "completed").await;
        self.state.record_task_finished(TaskOutcome::Succeeded);
        info!(
            task_id = %task_id,
            processing_secs = format!("{:.2}", processing_secs),
            "Analysis task completed"
        );
    }

    async fn finish_failed(&self, task_id: Uuid, error_value: &PipelineError, retries: u32) {
        error!(
            task_id = %task_id,
            retries,
            error = %error_value,
            "Analysis task failed terminally"
        );
        let _ = self.store.set_error(task_id, &error_value.to_string()).await;
        let _ = self.store.update_status(task_id, TaskStatus::Completed).await;
        self.state.record_task_finished(TaskOutcome::Failed);
    }

    async fn finish_cancelled(&self, task_id: Uuid) {
        info!(task_id = %task_id, "Analysis task cancelled");
        if let Err(e) = self.store.update_status(task_id, TaskStatus::Cancelled).await {
            debug!(task_id = %task_id, error = %e, "Cancel transition rejected");
        }
        self.state.record_task_finished(TaskOutcome::Cancelled);
    }

    async fn progress(&self, task_id: Uuid, percent: u8, step: &str) {
        if let Err(e) = self.store.update_progress(task_id, percent, step).await {
            debug!(task_id = %task_id, error = %e, "Failed to record progress");
        }
    }

    /// Exponential backoff: start interval doubled per consumed retry,
    /// capped at the configured maximum.
    fn backoff_delay(&self, prior_retries: u32) -> Duration {
        let factor = 1u64 << prior_retries.min(16);
        let secs = self
            .retry
            .backoff_start_secs
            .saturating_mul(factor)
            .min(self.retry.backoff_max_secs);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::suggestion::StaticSuggestionGenerator;
    use crate::audio::decode::ANALYSIS_SAMPLE_RATE;
    use crate::config::AppConfig;
    use crate::device::DeviceKind;
    use crate::error::PipelineResult;
    use crate::storage::{LocalAudioStorage, TempAudioFile};
    use crate::tasks::store::InMemoryTaskStore;
    use crate::tasks::task::AnalysisParams;
    use crate::transcription::cache::{CacheLimits, ModelCache, ModelLoader};
    use crate::transcription::model::{SpeechModel, Transcription};
    use async_trait::async_trait;
    use std::f32::consts::PI;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::Mutex;

    struct FixedModel;

    impl SpeechModel for FixedModel {
        fn transcribe(&self, _samples: &[f32], _language: &str) -> anyhow::Result<Transcription> {
            Ok(Transcription {
                text: "the reference sentence".to_string(),
                confidence: 0.9,
            })
        }

        fn embed(&self, _samples: &[f32]) -> anyhow::Result<Vec<f32>> {
            Ok(vec![0.3, 0.5, 0.2, 0.7])
        }

        fn memory_bytes(&self) -> u64 {
            1024
        }
    }

    struct FixedLoader;

    impl ModelLoader for FixedLoader {
        fn load(
            &self,
            _model_id: &str,
            _device: DeviceKind,
        ) -> Result<Arc<dyn SpeechModel>, String> {
            Ok(Arc::new(FixedModel))
        }

        fn estimated_memory_bytes(&self, _model_id: &str) -> u64 {
            1024
        }
    }

    /// Storage double that always fails with a transient error.
    struct FlakyStorage {
        downloads: AtomicU32,
    }

    #[async_trait]
    impl AudioStorage for FlakyStorage {
        async fn exists(&self, _path: &str) -> PipelineResult<bool> {
            Ok(true)
        }

        async fn download_to_local(&self, path: &str) -> PipelineResult<TempAudioFile> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::FileAccess {
                path: path.to_string(),
                message: "connection reset".to_string(),
                permanent: false,
            })
        }

        async fn delete(&self, _path: &str) -> PipelineResult<()> {
            Ok(())
        }
    }

    /// Wraps the filesystem storage and records every scratch path it hands
    /// out, so tests can assert cleanup.
    struct TrackingStorage {
        inner: LocalAudioStorage,
        handed_out: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl AudioStorage for TrackingStorage {
        async fn exists(&self, path: &str) -> PipelineResult<bool> {
            self.inner.exists(path).await
        }

        async fn download_to_local(&self, path: &str) -> PipelineResult<TempAudioFile> {
            let temp = self.inner.download_to_local(path).await?;
            self.handed_out.lock().unwrap().push(temp.path().to_path_buf());
            Ok(temp)
        }

        async fn delete(&self, path: &str) -> PipelineResult<()> {
            self.inner.delete(path).await
        }
    }

    fn write_voiced_wav(dir: &std::path::Path, name: &str) {
        let samples: Vec<i16> = (0..ANALYSIS_SAMPLE_RATE as usize * 2)
            .map(|i| {
                let t = i as f32 / ANALYSIS_SAMPLE_RATE as f32;
                let envelope = 0.5 + 0.5 * (2.0 * PI * 3.0 * t).sin().abs();
                let value = envelope
                    * (0.6 * (2.0 * PI * 120.0 * t).sin()
                        + 0.3 * (2.0 * PI * 240.0 * t).sin());
                (value * 20_000.0) as i16
            })
            .collect();

        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, ANALYSIS_SAMPLE_RATE, 16);
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut file).unwrap();
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            backoff_start_secs: 0,
            backoff_max_secs: 0,
            soft_time_limit_secs: 30,
            hard_time_limit_secs: 60,
        }
    }

    fn test_transcriber() -> Arc<TranscriptionService> {
        let cache = Arc::new(ModelCache::new(
            Arc::new(FixedLoader),
            CacheLimits {
                max_memory_bytes: 1024 * 1024,
                accelerator_memory_bytes: 1024 * 1024,
                max_idle: Duration::from_secs(60),
                min_headroom_bytes: 0,
            },
            DeviceKind::Cpu,
        ));
        Arc::new(TranscriptionService::new(
            cache,
            "small".to_string(),
            "zh".to_string(),
        ))
    }

    fn orchestrator_with(
        store: Arc<InMemoryTaskStore>,
        storage: Arc<dyn AudioStorage>,
        retry: RetryConfig,
    ) -> AnalysisOrchestrator {
        AnalysisOrchestrator::new(
            store,
            storage,
            test_transcriber(),
            Arc::new(FeatureExtractor::new()),
            Arc::new(StaticSuggestionGenerator),
            AppState::new(AppConfig::default()),
            retry,
        )
    }

    fn unraised_flag() -> CancellationFlag {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test]
    async fn test_identical_files_complete_at_level_one() {
        let dir = tempfile::tempdir().unwrap();
        write_voiced_wav(dir.path(), "ref.wav");

        let store = Arc::new(InMemoryTaskStore::new());
        let storage = Arc::new(TrackingStorage {
            inner: LocalAudioStorage::new(dir.path()),
            handed_out: Mutex::new(Vec::new()),
        });
        let orchestrator = orchestrator_with(Arc::clone(&store), Arc::clone(&storage) as _, fast_retry());

        let task = store
            .create_task(Uuid::new_v4(), AnalysisParams::new("ref.wav", "ref.wav"))
            .await
            .unwrap();
        let job = QueuedJob {
            task_id: task.task_id,
            queue_id: Uuid::new_v4(),
        };

        orchestrator.process(job, unraised_flag()).await;

        let finished = store.find_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        assert!(finished.error_message.is_none());
        assert_eq!(finished.progress, 100);

        let result = store.find_result(task.task_id).await.unwrap().unwrap();
        let metrics = &result.payload.metrics;
        assert!(metrics.similarity.embedding > 0.99);
        assert!((metrics.similarity.wer_similarity - 1.0).abs() < 1e-6);
        assert!(metrics.composite_index >= 0.85);
        assert_eq!(metrics.level, 1);
        assert_eq!(result.model_version, "whisper-small");
        assert!(!result.payload.suggestion.is_empty());

        // Every scratch file handed to the pipeline is gone.
        let handed_out = storage.handed_out.lock().unwrap();
        assert_eq!(handed_out.len(), 2);
        for path in handed_out.iter() {
            assert!(!path.exists(), "scratch file leaked: {}", path.display());
        }
    }

    #[tokio::test]
    async fn test_transient_download_failure_retries_then_fails() {
        let store = Arc::new(InMemoryTaskStore::new());
        let storage = Arc::new(FlakyStorage {
            downloads: AtomicU32::new(0),
        });
        let orchestrator =
            orchestrator_with(Arc::clone(&store), Arc::clone(&storage) as _, fast_retry());

        let task = store
            .create_task(Uuid::new_v4(), AnalysisParams::new("ref.wav", "sample.wav"))
            .await
            .unwrap();
        let job = QueuedJob {
            task_id: task.task_id,
            queue_id: Uuid::new_v4(),
        };

        orchestrator.process(job, unraised_flag()).await;

        // Initial attempt plus three retries, one download call each (the
        // reference download fails first).
        assert_eq!(storage.downloads.load(Ordering::SeqCst), 4);

        let finished = store.find_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        assert_eq!(finished.retry_count, 3);
        assert!(finished.error_message.is_some());
        assert!(store.find_result(task.task_id).await.unwrap().is_none());
    }

    /// Reference downloads succeed, sample downloads fail transiently; the
    /// reference scratch file from each partial attempt must not leak.
    struct HalfFlakyStorage {
        inner: LocalAudioStorage,
        failing_path: String,
        handed_out: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl AudioStorage for HalfFlakyStorage {
        async fn exists(&self, path: &str) -> PipelineResult<bool> {
            if path == self.failing_path {
                return Ok(true);
            }
            self.inner.exists(path).await
        }

        async fn download_to_local(&self, path: &str) -> PipelineResult<TempAudioFile> {
            if path == self.failing_path {
                return Err(PipelineError::FileAccess {
                    path: path.to_string(),
                    message: "connection reset".to_string(),
                    permanent: false,
                });
            }
            let temp = self.inner.download_to_local(path).await?;
            self.handed_out.lock().unwrap().push(temp.path().to_path_buf());
            Ok(temp)
        }

        async fn delete(&self, path: &str) -> PipelineResult<()> {
            self.inner.delete(path).await
        }
    }

    #[tokio::test]
    async fn test_partial_attempt_leaves_no_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        write_voiced_wav(dir.path(), "ref.wav");

        let store = Arc::new(InMemoryTaskStore::new());
        let storage = Arc::new(HalfFlakyStorage {
            inner: LocalAudioStorage::new(dir.path()),
            failing_path: "sample.wav".to_string(),
            handed_out: Mutex::new(Vec::new()),
        });
        let orchestrator =
            orchestrator_with(Arc::clone(&store), Arc::clone(&storage) as _, fast_retry());

        let task = store
            .create_task(Uuid::new_v4(), AnalysisParams::new("ref.wav", "sample.wav"))
            .await
            .unwrap();
        let job = QueuedJob {
            task_id: task.task_id,
            queue_id: Uuid::new_v4(),
        };

        orchestrator.process(job, unraised_flag()).await;

        let finished = store.find_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        assert_eq!(finished.retry_count, 3);
        assert!(store.find_result(task.task_id).await.unwrap().is_none());

        // One reference download per attempt, all cleaned up on failure.
        let handed_out = storage.handed_out.lock().unwrap();
        assert_eq!(handed_out.len(), 4);
        for path in handed_out.iter() {
            assert!(!path.exists(), "scratch file leaked: {}", path.display());
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        write_voiced_wav(dir.path(), "ref.wav");

        let store = Arc::new(InMemoryTaskStore::new());
        let storage = Arc::new(LocalAudioStorage::new(dir.path()));
        let orchestrator =
            orchestrator_with(Arc::clone(&store), storage as _, fast_retry());

        let task = store
            .create_task(Uuid::new_v4(), AnalysisParams::new("ref.wav", "missing.wav"))
            .await
            .unwrap();
        let job = QueuedJob {
            task_id: task.task_id,
            queue_id: Uuid::new_v4(),
        };

        orchestrator.process(job, unraised_flag()).await;

        let finished = store.find_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        // Permanent failure consumed no retries.
        assert_eq!(finished.retry_count, 0);
        assert!(store.find_result(task.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_pending_task_never_processes() {
        let store = Arc::new(InMemoryTaskStore::new());
        let storage = Arc::new(FlakyStorage {
            downloads: AtomicU32::new(0),
        });
        let orchestrator =
            orchestrator_with(Arc::clone(&store), Arc::clone(&storage) as _, fast_retry());

        let task = store
            .create_task(Uuid::new_v4(), AnalysisParams::new("ref.wav", "sample.wav"))
            .await
            .unwrap();
        store
            .update_status(task.task_id, TaskStatus::Cancelled)
            .await
            .unwrap();

        let job = QueuedJob {
            task_id: task.task_id,
            queue_id: Uuid::new_v4(),
        };
        orchestrator.process(job, unraised_flag()).await;

        let after = store.find_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Cancelled);
        assert!(after.started_at.is_none());
        assert_eq!(storage.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_raised_flag_cancels_before_stages() {
        let store = Arc::new(InMemoryTaskStore::new());
        let storage = Arc::new(FlakyStorage {
            downloads: AtomicU32::new(0),
        });
        let orchestrator =
            orchestrator_with(Arc::clone(&store), Arc::clone(&storage) as _, fast_retry());

        let task = store
            .create_task(Uuid::new_v4(), AnalysisParams::new("ref.wav", "sample.wav"))
            .await
            .unwrap();
        let job = QueuedJob {
            task_id: task.task_id,
            queue_id: Uuid::new_v4(),
        };

        let flag = Arc::new(AtomicBool::new(true));
        orchestrator.process(job, flag).await;

        let after = store.find_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Cancelled);
        assert_eq!(storage.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_suggestion_failure_fails_the_attempt() {
        struct FailingSuggester;

        #[async_trait]
        impl SuggestionGenerator for FailingSuggester {
            async fn generate(&self, _metrics: &MetricsBundle) -> PipelineResult<String> {
                Err(PipelineError::Suggestion("service unavailable".to_string()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        write_voiced_wav(dir.path(), "ref.wav");

        let store = Arc::new(InMemoryTaskStore::new());
        let orchestrator = AnalysisOrchestrator::new(
            Arc::clone(&store) as _,
            Arc::new(LocalAudioStorage::new(dir.path())),
            test_transcriber(),
            Arc::new(FeatureExtractor::new()),
            Arc::new(FailingSuggester),
            AppState::new(AppConfig::default()),
            RetryConfig {
                max_retries: 1,
                ..fast_retry()
            },
        );

        let task = store
            .create_task(Uuid::new_v4(), AnalysisParams::new("ref.wav", "ref.wav"))
            .await
            .unwrap();
        let job = QueuedJob {
            task_id: task.task_id,
            queue_id: Uuid::new_v4(),
        };

        orchestrator.process(job, unraised_flag()).await;

        let finished = store.find_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        assert!(finished
            .error_message
            .as_deref()
            .unwrap()
            .contains("Suggestion"));
        assert!(store.find_result(task.task_id).await.unwrap().is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let store = Arc::new(InMemoryTaskStore::new());
        let storage = Arc::new(FlakyStorage {
            downloads: AtomicU32::new(0),
        });
        let orchestrator = orchestrator_with(
            store,
            storage as _,
            RetryConfig {
                max_retries: 5,
                backoff_start_secs: 60,
                backoff_max_secs: 300,
                soft_time_limit_secs: 30,
                hard_time_limit_secs: 60,
            },
        );

        assert_eq!(orchestrator.backoff_delay(0), Duration::from_secs(60));
        assert_eq!(orchestrator.backoff_delay(1), Duration::from_secs(120));
        assert_eq!(orchestrator.backoff_delay(2), Duration::from_secs(240));
        // Capped at the configured maximum.
        assert_eq!(orchestrator.backoff_delay(3), Duration::from_secs(300));
        assert_eq!(orchestrator.backoff_delay(10), Duration::from_secs(300));
    }
}
