//! # Suggestion Generation
//!
//! Turns the computed metric bundle into human-readable coaching feedback by
//! calling an external generative-language service.
//!
//! Only the request/response contract is owned here: a structured metric
//! bundle goes in, a free-text suggestion comes back. The call carries its
//! own timeout and failures surface as `PipelineError::Suggestion`, which
//! the orchestrator currently treats as fatal to the attempt (retryable).

use crate::analysis::scoring::MetricsBundle;
use crate::config::SuggestionConfig;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Produces coaching feedback from a metric bundle.
#[async_trait]
pub trait SuggestionGenerator: Send + Sync {
    async fn generate(&self, metrics: &MetricsBundle) -> PipelineResult<String>;
}

/// HTTP client for a Gemini-style `generateContent` endpoint.
pub struct HttpSuggestionClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl HttpSuggestionClient {
    /// Build the client from configuration, reading the API key from the
    /// configured environment variable.
    ///
    /// Fails fast at startup when the key is missing, rather than failing
    /// every task at the suggestion stage.
    pub fn from_config(config: &SuggestionConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!(
                "Suggestion API key environment variable {} is not set",
                config.api_key_env
            )
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    /// Coaching prompt handed to the generative service.
    fn build_prompt(metrics: &MetricsBundle) -> String {
        format!(
            "You are a speech therapist. Based on the following pronunciation \
             analysis, give 3-5 actionable articulation practice suggestions:\n\
             1. Embedding similarity: {:.3}; transcript similarity: {:.3}\n\
             2. Reference clarity: SNR={:.1}, HNR={:.1}\n   \
             Sample clarity: SNR={:.1}, HNR={:.1}\n\
             3. Composite index={:.3} -> Level {}\n",
            metrics.similarity.embedding,
            metrics.similarity.wer_similarity,
            metrics.clarity_reference.snr,
            metrics.clarity_reference.hnr,
            metrics.clarity_sample.snr,
            metrics.clarity_sample.hnr,
            metrics.composite_index,
            metrics.level
        )
    }
}

#[async_trait]
impl SuggestionGenerator for HttpSuggestionClient {
    async fn generate(&self, metrics: &MetricsBundle) -> PipelineResult<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.endpoint, self.model, self.api_key
        );

        let body = json!({
            "contents": [{
                "parts": [{ "text": Self::build_prompt(metrics) }]
            }]
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Suggestion(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Suggestion(format!(
                "service returned HTTP {}",
                status
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Suggestion(format!("invalid response body: {}", e)))?;

        let text = payload
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipelineError::Suggestion("response carried no candidate text".to_string())
            })?;

        Ok(text.trim().to_string())
    }
}

/// Deterministic generator used in tests and in development runs where no
/// API key is configured; phrases the level without an external call.
pub struct StaticSuggestionGenerator;

#[async_trait]
impl SuggestionGenerator for StaticSuggestionGenerator {
    async fn generate(&self, metrics: &MetricsBundle) -> PipelineResult<String> {
        let text = match metrics.level {
            1 => "Excellent match with the reference recording. Keep practicing at this pace.",
            2 => "Close to the reference. Focus on sustaining volume through sentence endings.",
            3 => "Understandable with noticeable differences. Slow down and emphasize each syllable.",
            4 => "Large gap from the reference. Practice shorter phrases and record in a quieter room.",
            _ => "Very large gap from the reference. Repeat the reference sentence word by word before attempting the full sentence.",
        };
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::features::FeatureSet;
    use crate::analysis::scoring::SimilarityMetrics;

    fn bundle(level: u8) -> MetricsBundle {
        MetricsBundle {
            similarity: SimilarityMetrics {
                embedding: 0.9,
                wer_similarity: 0.8,
                ref_text: "ref".to_string(),
                sample_text: "sample".to_string(),
            },
            clarity_reference: FeatureSet {
                snr: 20.0,
                hnr: 10.0,
                entropy: 8.0,
                confidence: 0.9,
                intelligibility: 1.0,
            },
            clarity_sample: FeatureSet {
                snr: 15.0,
                hnr: 8.0,
                entropy: 9.0,
                confidence: 0.8,
                intelligibility: 1.0,
            },
            composite_index: 0.8,
            level,
        }
    }

    #[test]
    fn test_prompt_carries_metrics() {
        let prompt = HttpSuggestionClient::build_prompt(&bundle(2));
        assert!(prompt.contains("0.900"));
        assert!(prompt.contains("Level 2"));
        assert!(prompt.contains("SNR=20.0"));
    }

    #[tokio::test]
    async fn test_static_generator_varies_by_level() {
        let generator = StaticSuggestionGenerator;
        let best = generator.generate(&bundle(1)).await.unwrap();
        let worst = generator.generate(&bundle(5)).await.unwrap();
        assert_ne!(best, worst);
        assert!(!best.is_empty());
    }
}
