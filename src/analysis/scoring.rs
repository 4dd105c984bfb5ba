//! # Similarity Scoring
//!
//! Combines two feature sets (reference, sample) and the transcript/embedding
//! similarity measurements into one bounded composite index and a discrete
//! 1–5 proficiency level.
//!
//! Everything here is pure and side-effect-free: identical inputs always
//! yield the identical `(index, level)`. The weights are deliberately named
//! constants rather than learned parameters.

use crate::analysis::features::FeatureSet;
use serde::{Deserialize, Serialize};

/// Fixed weights of the composite index. They sum to 1.0.
const W_SNR: f32 = 0.15;
const W_HNR: f32 = 0.10;
const W_ENTROPY: f32 = 0.15;
const W_CONFIDENCE: f32 = 0.15;
const W_INTELLIGIBILITY: f32 = 0.15;
const W_EMBEDDING: f32 = 0.20;
const W_WER: f32 = 0.10;

/// Level thresholds: a monotone step function from index to band.
const LEVEL_1_MIN: f32 = 0.85;
const LEVEL_2_MIN: f32 = 0.65;
const LEVEL_3_MIN: f32 = 0.45;
const LEVEL_4_MIN: f32 = 0.25;

/// Transcript/embedding similarity between the two recordings.
///
/// Field names match the persisted result payload (`similarity` object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityMetrics {
    /// Embedding cosine similarity, clamped to [0, 1]
    pub embedding: f32,
    /// 1 − word-error-rate, clamped to [0, 1]
    pub wer_similarity: f32,
    /// Reference transcript
    pub ref_text: String,
    /// Sample transcript
    pub sample_text: String,
}

/// The full metric bundle of one comparison: everything the suggestion
/// service and the persisted result carry except the suggestion text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsBundle {
    pub similarity: SimilarityMetrics,
    pub clarity_reference: FeatureSet,
    pub clarity_sample: FeatureSet,
    pub composite_index: f32,
    pub level: u8,
}

/// Stateless scorer owning the index weights and level boundaries.
pub struct SimilarityScorer;

impl SimilarityScorer {
    /// Compute the composite index and level for one comparison.
    ///
    /// ## Ratio Direction:
    /// Sample-to-reference for SNR, HNR, confidence, and intelligibility
    /// (matching the reference recording is "good"); reference-to-sample for
    /// entropy, since lower sample entropy relative to the reference means a
    /// cleaner spectrum. Each ratio is clipped to [0, 1] and a zero
    /// denominator yields 0.
    pub fn score(
        reference: &FeatureSet,
        sample: &FeatureSet,
        transcript_similarity: f32,
        embedding_similarity: f32,
    ) -> (f32, u8) {
        let ratios = [
            normalize_ratio(sample.snr, reference.snr),
            normalize_ratio(sample.hnr, reference.hnr),
            normalize_ratio(reference.entropy, sample.entropy),
            normalize_ratio(sample.confidence, reference.confidence),
            normalize_ratio(sample.intelligibility, reference.intelligibility),
        ];

        let embedding = embedding_similarity.clamp(0.0, 1.0);
        let transcript = transcript_similarity.clamp(0.0, 1.0);

        let index = ratios[0] * W_SNR
            + ratios[1] * W_HNR
            + ratios[2] * W_ENTROPY
            + ratios[3] * W_CONFIDENCE
            + ratios[4] * W_INTELLIGIBILITY
            + embedding * W_EMBEDDING
            + transcript * W_WER;
        let index = index.clamp(0.0, 1.0);

        (index, classify_level(index))
    }
}

/// Clamped ratio in [0, 1]; a non-positive denominator yields 0.
pub fn normalize_ratio(numerator: f32, denominator: f32) -> f32 {
    if denominator > 0.0 {
        (numerator / denominator).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Map a composite index to its ordinal band, 1 (best) to 5 (worst).
pub fn classify_level(index: f32) -> u8 {
    if index >= LEVEL_1_MIN {
        1
    } else if index >= LEVEL_2_MIN {
        2
    } else if index >= LEVEL_3_MIN {
        3
    } else if index >= LEVEL_4_MIN {
        4
    } else {
        5
    }
}

/// Word-error-rate between a reference and a hypothesis transcript:
/// word-level Levenshtein distance over the reference length.
///
/// An empty reference with a non-empty hypothesis counts as total error;
/// two empty transcripts are a perfect match.
pub fn word_error_rate(reference: &str, hypothesis: &str) -> f32 {
    let ref_words: Vec<&str> = reference.split_whitespace().collect();
    let hyp_words: Vec<&str> = hypothesis.split_whitespace().collect();

    if ref_words.is_empty() {
        return if hyp_words.is_empty() { 0.0 } else { 1.0 };
    }

    let distance = levenshtein(&ref_words, &hyp_words);
    distance as f32 / ref_words.len() as f32
}

/// Transcript similarity: `1 − WER`, clamped to [0, 1] since insertions can
/// push WER above 1.
pub fn transcript_similarity(reference: &str, hypothesis: &str) -> f32 {
    (1.0 - word_error_rate(reference, hypothesis)).clamp(0.0, 1.0)
}

/// Cosine similarity of two embeddings; zero-norm inputs yield 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    let denom = (norm_a * norm_b).sqrt();
    if denom < 1e-12 {
        return 0.0;
    }
    dot / denom
}

/// Word-level edit distance with the standard dynamic-programming rows.
fn levenshtein(reference: &[&str], hypothesis: &[&str]) -> usize {
    let mut previous: Vec<usize> = (0..=hypothesis.len()).collect();
    let mut current = vec![0usize; hypothesis.len() + 1];

    for (i, ref_word) in reference.iter().enumerate() {
        current[0] = i + 1;
        for (j, hyp_word) in hypothesis.iter().enumerate() {
            let substitution = previous[j] + usize::from(ref_word != hyp_word);
            let insertion = current[j] + 1;
            let deletion = previous[j + 1] + 1;
            current[j + 1] = substitution.min(insertion).min(deletion);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[hypothesis.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(snr: f32, hnr: f32, entropy: f32, confidence: f32, intelligibility: f32) -> FeatureSet {
        FeatureSet {
            snr,
            hnr,
            entropy,
            confidence,
            intelligibility,
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let total = W_SNR + W_HNR + W_ENTROPY + W_CONFIDENCE + W_INTELLIGIBILITY + W_EMBEDDING + W_WER;
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_score_is_pure() {
        let reference = features(20.0, 12.0, 8.0, 0.9, 0.95);
        let sample = features(15.0, 10.0, 9.0, 0.8, 0.9);

        let first = SimilarityScorer::score(&reference, &sample, 0.8, 0.9);
        let second = SimilarityScorer::score(&reference, &sample, 0.8, 0.9);
        assert_eq!(first, second);
    }

    #[test]
    fn test_perfect_inputs_yield_level_one() {
        let reference = features(20.0, 12.0, 8.0, 0.9, 1.0);
        // Identical features, perfect similarities.
        let (index, level) = SimilarityScorer::score(&reference, &reference, 1.0, 1.0);
        assert!((index - 1.0).abs() < 1e-6);
        assert_eq!(level, 1);
    }

    #[test]
    fn test_worst_inputs_yield_level_five() {
        let reference = features(20.0, 12.0, 8.0, 0.9, 1.0);
        let silent = features(0.0, 0.0, 0.0, 0.0, 0.0);
        let (index, level) = SimilarityScorer::score(&reference, &silent, 0.0, 0.0);
        // Entropy ratio has a zero denominator (sample entropy 0) and
        // everything else is zero.
        assert_eq!(index, 0.0);
        assert_eq!(level, 5);
    }

    #[test]
    fn test_index_always_bounded() {
        let reference = features(10.0, 5.0, 4.0, 0.5, 0.5);
        // Sample "better" than reference on every axis plus out-of-range
        // similarities must still clamp to 1.0.
        let sample = features(100.0, 50.0, 1.0, 1.0, 1.0);
        let (index, _) = SimilarityScorer::score(&reference, &sample, 2.0, 1.5);
        assert!((0.0..=1.0).contains(&index));

        let (index, _) = SimilarityScorer::score(&reference, &sample, -3.0, -1.0);
        assert!((0.0..=1.0).contains(&index));
    }

    #[test]
    fn test_level_boundaries() {
        assert_eq!(classify_level(1.0), 1);
        assert_eq!(classify_level(0.85), 1);
        assert_eq!(classify_level(0.84), 2);
        assert_eq!(classify_level(0.65), 2);
        assert_eq!(classify_level(0.45), 3);
        assert_eq!(classify_level(0.25), 4);
        assert_eq!(classify_level(0.24), 5);
        assert_eq!(classify_level(0.0), 5);
    }

    #[test]
    fn test_level_monotone_in_index() {
        let mut previous_level = 1u8;
        // Sweep downward: the level can only get worse (larger).
        for step in (0..=100).rev() {
            let index = step as f32 / 100.0;
            let level = classify_level(index);
            assert!(level >= previous_level);
            previous_level = level;
        }
    }

    #[test]
    fn test_normalize_ratio_edge_cases() {
        assert_eq!(normalize_ratio(5.0, 10.0), 0.5);
        assert_eq!(normalize_ratio(20.0, 10.0), 1.0);
        assert_eq!(normalize_ratio(-5.0, 10.0), 0.0);
        assert_eq!(normalize_ratio(5.0, 0.0), 0.0);
        assert_eq!(normalize_ratio(5.0, -1.0), 0.0);
    }

    #[test]
    fn test_word_error_rate() {
        assert_eq!(word_error_rate("the quick brown fox", "the quick brown fox"), 0.0);
        assert_eq!(word_error_rate("a b c d", "a x c d"), 0.25);
        assert_eq!(word_error_rate("", ""), 0.0);
        assert_eq!(word_error_rate("", "something"), 1.0);
        // All words wrong.
        assert_eq!(word_error_rate("a b", "x y"), 1.0);
    }

    #[test]
    fn test_transcript_similarity_clamps() {
        // More insertions than reference words push WER above 1; the
        // similarity clamps at 0 instead of going negative.
        assert_eq!(transcript_similarity("a", "x y z"), 0.0);
        assert_eq!(transcript_similarity("same text", "same text"), 1.0);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
