//! # Error Handling
//!
//! Two error layers live here:
//!
//! - `AppError`: errors surfaced by the HTTP ops routes, converted to JSON
//!   responses via `ResponseError`.
//! - `PipelineError`: the analysis-pipeline taxonomy. Every variant is
//!   classified as transient (retried with backoff by the orchestrator) or
//!   permanent (fails the task immediately). Cancellation is signalled
//!   out-of-band and is never represented as an error.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by the HTTP ops surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **Conflict**: Request is valid but the task state forbids it (409 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (store failures, queue breakdown, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Request conflicts with the current task state (e.g. cancelling a terminal task)
    Conflict(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
        }
    }
}

/// Converts `AppError` values into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "No task with id ...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::Conflict(msg) => (
                actix_web::http::StatusCode::CONFLICT,
                "conflict",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Pipeline stage labels used for error context and progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Download,
    FeatureExtraction,
    Transcription,
    Scoring,
    Suggestion,
    Persist,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::Download => "download",
            Stage::FeatureExtraction => "feature_extraction",
            Stage::Transcription => "transcription",
            Stage::Scoring => "scoring",
            Stage::Suggestion => "suggestion",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Errors raised by the analysis pipeline.
///
/// The orchestrator consults `is_transient()` to decide whether an attempt
/// is retried: transient errors go through the backoff loop, permanent ones
/// terminate the task on the spot.
#[derive(Debug)]
pub enum PipelineError {
    /// Model failed to load on every attempted device. The cache already
    /// performed its single accelerator-to-CPU fallback before raising this.
    ModelLoad(String),

    /// Source audio missing or unreadable from the storage collaborator.
    /// `permanent` is true when the file genuinely does not exist.
    FileAccess {
        path: String,
        message: String,
        permanent: bool,
    },

    /// A pipeline stage failed unexpectedly, wrapped with stage and file context.
    Stage {
        stage: Stage,
        file: Option<String>,
        message: String,
    },

    /// The external suggestion-generation call failed.
    Suggestion(String),

    /// The attempt exceeded the soft time limit and was cancelled gracefully.
    TimedOut { limit_secs: u64 },
}

impl PipelineError {
    /// Whether the orchestrator should retry the attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::ModelLoad(_) => true,
            PipelineError::FileAccess { permanent, .. } => !permanent,
            PipelineError::Stage { .. } => true,
            PipelineError::Suggestion(_) => true,
            PipelineError::TimedOut { .. } => true,
        }
    }

    /// Helper for wrapping a stage failure with its file context.
    pub fn stage(stage: Stage, file: Option<&str>, err: impl fmt::Display) -> Self {
        PipelineError::Stage {
            stage,
            file: file.map(|f| f.to_string()),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::ModelLoad(msg) => write!(f, "Model load failed: {}", msg),
            PipelineError::FileAccess {
                path,
                message,
                permanent,
            } => write!(
                f,
                "File access failed ({}): {}: {}",
                if *permanent { "permanent" } else { "transient" },
                path,
                message
            ),
            PipelineError::Stage {
                stage,
                file,
                message,
            } => match file {
                Some(file) => write!(f, "Stage {} failed on {}: {}", stage, file, message),
                None => write!(f, "Stage {} failed: {}", stage, message),
            },
            PipelineError::Suggestion(msg) => {
                write!(f, "Suggestion generation failed: {}", msg)
            }
            PipelineError::TimedOut { limit_secs } => {
                write!(f, "Attempt exceeded soft time limit of {}s", limit_secs)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::ModelLoad("no device".into()).is_transient());
        assert!(PipelineError::TimedOut { limit_secs: 10 }.is_transient());
        assert!(PipelineError::FileAccess {
            path: "a.wav".into(),
            message: "connection reset".into(),
            permanent: false,
        }
        .is_transient());
        assert!(!PipelineError::FileAccess {
            path: "a.wav".into(),
            message: "no such object".into(),
            permanent: true,
        }
        .is_transient());
    }

    #[test]
    fn test_stage_display_includes_context() {
        let err = PipelineError::stage(Stage::Transcription, Some("sample.wav"), "decode failed");
        let text = err.to_string();
        assert!(text.contains("transcription"));
        assert!(text.contains("sample.wav"));
    }
}
