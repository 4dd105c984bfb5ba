//! # Analysis Task Records
//!
//! The task record, its status state machine, and the result row persisted
//! on successful completion.

use crate::analysis::scoring::MetricsBundle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task status, a finite state machine.
///
/// ## Transitions:
/// - `Pending → Processing` (worker pickup)
/// - `Pending → Cancelled`, `Processing → Cancelled` (explicit cancellation)
/// - `Processing → Completed` (all stages done, or retries exhausted)
///
/// `Completed` covers both success and terminal failure; the two are
/// distinguished by the presence of an `AnalysisResult` row plus the task's
/// `error_message`. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task kind. Only audio analysis exists today; the enum keeps the record
/// shape stable when other analysis kinds arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "audio_analysis")]
    AudioAnalysis,
}

/// The parameter bag of one analysis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisParams {
    /// Storage reference of the reference recording
    pub reference_audio: String,
    /// Storage reference of the user's recording
    pub sample_audio: String,
    /// Opaque analysis options, passed through unchanged
    #[serde(default)]
    pub options: serde_json::Value,
}

impl AnalysisParams {
    pub fn new(reference_audio: impl Into<String>, sample_audio: impl Into<String>) -> Self {
        Self {
            reference_audio: reference_audio.into(),
            sample_audio: sample_audio.into(),
            options: serde_json::Value::Null,
        }
    }
}

/// One analysis request and its execution bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    /// Locally generated task identity
    pub task_id: Uuid,
    /// Assigned when the task is accepted onto the queue; absent before
    pub queue_id: Option<Uuid>,
    pub user_id: Uuid,
    pub kind: TaskKind,
    pub params: AnalysisParams,
    pub status: TaskStatus,

    /// Progress percent (0–100) and the label of the stage in flight
    pub progress: u8,
    pub current_step: Option<String>,

    /// Number of retries consumed by the orchestrator
    pub retry_count: u32,
    /// Last error, recorded when retries are exhausted (logs-facing; there
    /// is no separate FAILED status)
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisTask {
    pub fn new(user_id: Uuid, params: AnalysisParams) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            queue_id: None,
            user_id,
            kind: TaskKind::AudioAnalysis,
            params,
            status: TaskStatus::Pending,
            progress: 0,
            current_step: None,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// The persisted payload of a successful analysis.
///
/// Serializes to the stable result shape: `similarity`,
/// `clarity_reference`, `clarity_sample`, `composite_index`, `level`, and
/// `suggestion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPayload {
    #[serde(flatten)]
    pub metrics: MetricsBundle,
    pub suggestion: String,
}

/// One-to-one with a completed task; created exactly once, immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub result_id: Uuid,
    pub task_id: Uuid,
    pub payload: AnalysisPayload,
    /// Model/version tag the analysis ran with
    pub model_version: String,
    /// Wall-clock processing duration of the successful attempt
    pub processing_secs: f64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_pending() {
        let task = AnalysisTask::new(Uuid::new_v4(), AnalysisParams::new("ref.wav", "sample.wav"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.queue_id.is_none());
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for terminal in [TaskStatus::Completed, TaskStatus::Cancelled] {
            for next in [
                TaskStatus::Pending,
                TaskStatus::Processing,
                TaskStatus::Completed,
                TaskStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn test_payload_serialization_shape() {
        use crate::analysis::features::FeatureSet;
        use crate::analysis::scoring::SimilarityMetrics;

        let payload = AnalysisPayload {
            metrics: MetricsBundle {
                similarity: SimilarityMetrics {
                    embedding: 0.95,
                    wer_similarity: 1.0,
                    ref_text: "a".to_string(),
                    sample_text: "a".to_string(),
                },
                clarity_reference: FeatureSet {
                    snr: 20.0,
                    hnr: 10.0,
                    entropy: 8.0,
                    confidence: 0.9,
                    intelligibility: 1.0,
                },
                clarity_sample: FeatureSet {
                    snr: 18.0,
                    hnr: 9.0,
                    entropy: 8.5,
                    confidence: 0.85,
                    intelligibility: 1.0,
                },
                composite_index: 0.91,
                level: 1,
            },
            suggestion: "keep going".to_string(),
        };

        let value = serde_json::to_value(&payload).unwrap();
        // The flattened bundle puts every stable field at the top level.
        assert!(value.get("similarity").is_some());
        assert!(value.get("clarity_reference").is_some());
        assert!(value.get("clarity_sample").is_some());
        assert!(value.get("composite_index").is_some());
        assert!(value.get("level").is_some());
        assert!(value.get("suggestion").is_some());
        assert!(value.pointer("/similarity/wer_similarity").is_some());
        assert!(value.pointer("/clarity_reference/snr").is_some());
    }
}
