//! # Whisper Model Management
//!
//! Loading and inference for Whisper models using Candle-rs.
//!
//! ## Model Loading Process:
//! 1. Download model files from HuggingFace if not cached locally
//! 2. Load model weights and tokenizer
//! 3. Initialize model on the requested device
//!
//! Loading is synchronous: it runs on worker threads (under
//! `spawn_blocking`) and under the model-cache lock, which serializes
//! redundant loads of the same model.
//!
//! ## Inference Outputs:
//! Each transcription carries a confidence score derived from a logistic
//! transform of the average token log-probability, and the model also
//! exposes a mean-pooled encoder embedding used for acoustic similarity.

use crate::device::{DeviceKind, DeviceManager};
use anyhow::{anyhow, Result};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::sync::Mutex;
use tokenizers::Tokenizer;

/// Number of samples in the fixed Whisper input window (30 s at 16 kHz).
const INPUT_WINDOW_SAMPLES: usize = 30 * 16_000;

/// Cap on greedy decode length per window.
const MAX_DECODE_TOKENS: usize = 224;

/// Available Whisper model sizes.
///
/// ## Trade-offs:
/// - **Size vs Accuracy**: Larger models are more accurate but slower
/// - **Memory vs Speed**: More memory usage for better performance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// Get the HuggingFace model repository name.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }

    /// Get the approximate resident size in MB.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 39,
            ModelSize::Base => 74,
            ModelSize::Small => 244,
            ModelSize::Medium => 769,
            ModelSize::Large => 1550,
        }
    }

    /// Version tag recorded on analysis results.
    pub fn version_tag(&self) -> String {
        format!("whisper-{}", self)
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// One transcription of one audio window.
#[derive(Debug, Clone)]
pub struct Transcription {
    /// The transcribed text
    pub text: String,
    /// Confidence score in [0, 1]
    pub confidence: f32,
}

/// Inference operations the cache and pipeline need from a loaded model.
///
/// Implemented by `WhisperModel` in production and by stubs in tests, so
/// cache and orchestrator behavior can be exercised without model weights.
pub trait SpeechModel: Send + Sync {
    /// Transcribe an audio window to text with a confidence score.
    fn transcribe(&self, samples: &[f32], language: &str) -> Result<Transcription>;

    /// Mean-pooled encoder embedding of the audio window.
    fn embed(&self, samples: &[f32]) -> Result<Vec<f32>>;

    /// Estimated resident size in bytes.
    fn memory_bytes(&self) -> u64;
}

/// A loaded Whisper model ready for transcription.
///
/// ## Thread Safety:
/// Candle's encoder/decoder cache activations internally and take `&mut`,
/// so inference is serialized through an interior mutex. The cache shares
/// one instance across workers; concurrent transcriptions queue on the
/// mutex rather than duplicating the weights.
pub struct WhisperModel {
    model: Mutex<m::model::Whisper>,
    device: Device,
    size: ModelSize,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    num_mel_bins: usize,
}

impl WhisperModel {
    /// Load a Whisper model from HuggingFace onto the given device.
    ///
    /// ## Loading Process:
    /// 1. Resolve the HuggingFace API client (honoring HF_TOKEN / HF_HUB_CACHE)
    /// 2. Download config.json, tokenizer.json, and model.safetensors (cached locally)
    /// 3. Build the mel filter bank for the model's bin count
    /// 4. Initialize model weights on the device
    pub fn load(size: ModelSize, device: Device, kind: DeviceKind) -> Result<Self> {
        tracing::info!("Loading Whisper {} model on {}...", size, kind);
        let start_time = std::time::Instant::now();

        let api = {
            use hf_hub::api::sync::{Api, ApiBuilder};

            let mut builder = ApiBuilder::new().with_progress(false);
            if let Ok(token) = std::env::var("HF_TOKEN") {
                builder = builder.with_token(Some(token));
            }
            if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
                builder = builder.with_cache_dir(cache_dir.into());
            }

            match builder.build() {
                Ok(api) => api,
                Err(e) => {
                    tracing::warn!("HuggingFace ApiBuilder failed ({}), trying Api::new()", e);
                    Api::new().map_err(|e2| {
                        anyhow!(
                            "HuggingFace API initialization failed (builder: {}, default: {})",
                            e,
                            e2
                        )
                    })?
                }
            }
        };

        let repo = api.model(size.repo_name().to_string());

        let config_filename = repo
            .get("config.json")
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let model_filename = repo
            .get("model.safetensors")
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_filename)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let num_mel_bins = config.num_mel_bins as usize;
        let mel_filters = mel_filter_bank(num_mel_bins, m::N_FFT / 2 + 1, 16_000.0);

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[model_filename], m::DTYPE, &device)?
        };
        let model = m::model::Whisper::load(&vb, config)?;

        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model: Mutex::new(model),
            device,
            size,
            tokenizer,
            mel_filters,
            num_mel_bins,
        })
    }

    /// Pad or trim samples to the fixed 30-second window and compute the
    /// log-mel spectrogram tensor (1, n_mels, n_frames).
    fn mel_spectrogram(&self, samples: &[f32]) -> Result<Tensor> {
        let mut window = vec![0.0f32; INPUT_WINDOW_SAMPLES];
        let copy_len = samples.len().min(INPUT_WINDOW_SAMPLES);
        window[..copy_len].copy_from_slice(&samples[..copy_len]);

        let mel = {
            let model = self.model.lock().unwrap();
            m::audio::pcm_to_mel(&model.config, &window, &self.mel_filters)
        };
        let n_frames = mel.len() / self.num_mel_bins;
        let mel = Tensor::from_vec(mel, (1, self.num_mel_bins, n_frames), &self.device)?;
        Ok(mel)
    }

    fn token_id(&self, token: &str) -> Result<u32> {
        self.tokenizer
            .token_to_id(token)
            .ok_or_else(|| anyhow!("Tokenizer has no id for token {}", token))
    }

    /// Check for immediate or short-pattern token repetition, which greedy
    /// decoding produces on degenerate audio.
    fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
        // The new token would be the third identical token in a row.
        if tokens.len() >= 2 && tokens[tokens.len() - 2..].iter().all(|&t| t == new_token) {
            return true;
        }
        // The new token would complete a repeated 3-gram.
        if tokens.len() >= 5 {
            let last = [tokens[tokens.len() - 2], tokens[tokens.len() - 1], new_token];
            let prev = &tokens[tokens.len() - 5..tokens.len() - 2];
            if prev == &last[..] {
                return true;
            }
        }
        false
    }
}

impl SpeechModel for WhisperModel {
    /// Transcribe audio to text.
    ///
    /// ## Audio Requirements:
    /// - Sample rate: 16kHz, mono, f32 in [-1.0, 1.0]
    /// - Longer inputs are trimmed to the 30-second window
    ///
    /// The confidence score is `logistic(mean token log-probability)` over
    /// the emitted tokens, or 0.0 when nothing was emitted.
    fn transcribe(&self, samples: &[f32], language: &str) -> Result<Transcription> {
        if samples.is_empty() {
            return Err(anyhow!("Audio data is empty"));
        }

        let mel = self.mel_spectrogram(samples)?;

        let sot = self.token_id(m::SOT_TOKEN)?;
        let eot = self.token_id(m::EOT_TOKEN)?;
        let transcribe = self.token_id(m::TRANSCRIBE_TOKEN)?;
        let no_timestamps = self.token_id(m::NO_TIMESTAMPS_TOKEN)?;

        let mut tokens = vec![sot];
        match self.tokenizer.token_to_id(&format!("<|{}|>", language)) {
            Some(lang_token) => tokens.push(lang_token),
            None => tracing::warn!("No language token for '{}', proceeding without", language),
        }
        tokens.push(transcribe);
        tokens.push(no_timestamps);
        let prefix_len = tokens.len();

        let mut model = self.model.lock().unwrap();
        let audio_features = model.encoder.forward(&mel, true)?;

        let mut sum_logprob = 0f64;
        let mut emitted: Vec<u32> = Vec::new();

        for i in 0..MAX_DECODE_TOKENS {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &audio_features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;

            let probs = candle_nn::ops::softmax(&logits, 0)?;
            let probs: Vec<f32> = probs.to_vec1()?;
            let (next_token, prob) = probs
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(idx, p)| (idx as u32, *p))
                .ok_or_else(|| anyhow!("Decoder produced empty logits"))?;

            if next_token == eot {
                break;
            }
            if Self::is_repetitive(&emitted, next_token) {
                tracing::debug!("Stopping decode on repetitive output");
                break;
            }

            sum_logprob += (prob.max(1e-10) as f64).ln();
            tokens.push(next_token);
            emitted.push(next_token);
        }
        drop(model);

        let confidence = if emitted.is_empty() {
            0.0
        } else {
            let avg_logprob = sum_logprob / emitted.len() as f64;
            logistic(avg_logprob) as f32
        };

        let text = self
            .tokenizer
            .decode(&tokens[prefix_len..], true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        Ok(Transcription {
            text: text.trim().to_string(),
            confidence,
        })
    }

    /// Mean-pooled encoder embedding, used for acoustic cosine similarity
    /// between a reference and a sample recording.
    fn embed(&self, samples: &[f32]) -> Result<Vec<f32>> {
        if samples.is_empty() {
            return Err(anyhow!("Audio data is empty"));
        }

        let mel = self.mel_spectrogram(samples)?;
        let mut model = self.model.lock().unwrap();
        let features = model.encoder.forward(&mel, true)?;
        // (1, frames, d_model) -> (d_model,)
        let pooled = features.mean(1)?.i(0)?;
        let embedding: Vec<f32> = pooled.to_vec1()?;
        Ok(embedding)
    }

    fn memory_bytes(&self) -> u64 {
        self.size.size_mb() as u64 * 1024 * 1024
    }
}

/// Logistic transform mapping an average log-probability into (0, 1).
fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Triangular mel filter bank over `n_freqs` FFT bins, row-major
/// `[n_mels][n_freqs]`, matching the layout `pcm_to_mel` expects.
fn mel_filter_bank(n_mels: usize, n_freqs: usize, sample_rate: f32) -> Vec<f32> {
    let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let mel_to_hz = |mel: f32| 700.0 * (10f32.powf(mel / 2595.0) - 1.0);

    let f_max = sample_rate / 2.0;
    let mel_max = hz_to_mel(f_max);

    // n_mels + 2 equally spaced points on the mel scale, converted back to
    // FFT bin positions.
    let bin_of = |mel: f32| mel_to_hz(mel) / f_max * (n_freqs - 1) as f32;
    let points: Vec<f32> = (0..n_mels + 2)
        .map(|i| bin_of(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for mel_idx in 0..n_mels {
        let (left, center, right) = (points[mel_idx], points[mel_idx + 1], points[mel_idx + 2]);
        for freq in 0..n_freqs {
            let f = freq as f32;
            let weight = if f > left && f < center {
                (f - left) / (center - left)
            } else if f >= center && f < right {
                (right - f) / (right - center)
            } else {
                0.0
            };
            filters[mel_idx * n_freqs + freq] = weight;
        }
    }
    filters
}

/// Production `ModelLoader`: loads candle Whisper weights for the model id
/// (a `ModelSize` name) onto the requested device.
pub struct WhisperLoader;

impl crate::transcription::cache::ModelLoader for WhisperLoader {
    fn load(
        &self,
        model_id: &str,
        device: DeviceKind,
    ) -> Result<std::sync::Arc<dyn SpeechModel>, String> {
        let size: ModelSize = model_id
            .parse()
            .map_err(|e: anyhow::Error| e.to_string())?;
        let candle_device = DeviceManager::create(device)?;
        let model = WhisperModel::load(size, candle_device, device).map_err(|e| e.to_string())?;
        Ok(std::sync::Arc::new(model))
    }

    fn estimated_memory_bytes(&self, model_id: &str) -> u64 {
        model_id
            .parse::<ModelSize>()
            .map(|size| size.size_mb() as u64 * 1024 * 1024)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("small".parse::<ModelSize>().unwrap(), ModelSize::Small);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert!("invalid".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_version_tag() {
        assert_eq!(ModelSize::Small.version_tag(), "whisper-small");
    }

    #[test]
    fn test_logistic_bounds() {
        assert!(logistic(0.0) - 0.5 < 1e-9);
        assert!(logistic(-10.0) < 0.01);
        assert!(logistic(10.0) > 0.99);
    }

    #[test]
    fn test_repetition_detection() {
        assert!(WhisperModel::is_repetitive(&[5, 5, 5], 5));
        assert!(WhisperModel::is_repetitive(&[1, 2, 3, 1, 2], 3));
        assert!(!WhisperModel::is_repetitive(&[1, 2, 3], 4));
        assert!(!WhisperModel::is_repetitive(&[1, 2], 2));
    }

    #[test]
    fn test_mel_filter_bank_shape_and_coverage() {
        let n_mels = 80;
        let n_freqs = 201;
        let filters = mel_filter_bank(n_mels, n_freqs, 16_000.0);
        assert_eq!(filters.len(), n_mels * n_freqs);

        // Every filter row has some nonzero weight.
        for mel_idx in 0..n_mels {
            let row = &filters[mel_idx * n_freqs..(mel_idx + 1) * n_freqs];
            assert!(row.iter().any(|&w| w > 0.0), "empty filter row {}", mel_idx);
        }

        // All weights are within [0, 1].
        assert!(filters.iter().all(|&w| (0.0..=1.0).contains(&w)));
    }
}
