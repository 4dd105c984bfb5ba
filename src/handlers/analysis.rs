//! # Analysis Task REST API Handlers
//!
//! The thin HTTP surface over the analysis subsystem: submit a comparison,
//! poll its status, cancel it.
//!
//! ## Available Endpoints:
//! - `POST /api/v1/analysis` - Submit an audio analysis task
//! - `GET /api/v1/analysis/{task_id}` - Task status plus result when completed
//! - `POST /api/v1/analysis/{task_id}/cancel` - Request cancellation

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::tasks::queue::AnalysisQueue;
use crate::tasks::store::TaskRecordStore;
use crate::tasks::task::{AnalysisParams, AnalysisResult, AnalysisTask, TaskStatus};
use crate::transcription::ModelCache;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Service handles shared with the HTTP handlers.
pub struct Services {
    pub store: Arc<dyn TaskRecordStore>,
    pub queue: Arc<AnalysisQueue>,
    pub cache: Arc<ModelCache>,
}

/// Request body for submitting an analysis.
#[derive(Debug, Deserialize)]
pub struct SubmitAnalysisRequest {
    /// Owning user
    pub user_id: Uuid,
    /// Storage reference of the reference recording
    pub reference_audio: String,
    /// Storage reference of the user's recording
    pub sample_audio: String,
    /// Opaque analysis options
    pub options: Option<serde_json::Value>,
}

/// Response body for a submitted analysis.
#[derive(Debug, Serialize)]
pub struct SubmitAnalysisResponse {
    pub task_id: Uuid,
    pub queue_id: Uuid,
    pub status: TaskStatus,
}

/// Task status view returned by the status endpoint.
#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: Uuid,
    pub queue_id: Option<Uuid>,
    pub status: TaskStatus,
    pub progress: u8,
    pub current_step: Option<String>,
    pub retry_count: u32,
    /// True only for a COMPLETED task with a persisted result; a COMPLETED
    /// task without one exhausted its retries (see `error_message`).
    pub succeeded: bool,
    pub error_message: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultView>,
}

#[derive(Debug, Serialize)]
pub struct ResultView {
    #[serde(flatten)]
    pub payload: serde_json::Value,
    pub model_version: String,
    pub processing_secs: f64,
}

impl TaskStatusResponse {
    fn from_records(task: AnalysisTask, result: Option<AnalysisResult>) -> Self {
        Self {
            task_id: task.task_id,
            queue_id: task.queue_id,
            status: task.status,
            progress: task.progress,
            current_step: task.current_step,
            retry_count: task.retry_count,
            succeeded: task.status == TaskStatus::Completed && result.is_some(),
            error_message: task.error_message,
            created_at: task.created_at,
            completed_at: task.completed_at,
            result: result.map(|r| ResultView {
                payload: serde_json::to_value(&r.payload).unwrap_or(serde_json::Value::Null),
                model_version: r.model_version,
                processing_secs: r.processing_secs,
            }),
        }
    }
}

/// Submit an audio analysis task.
///
/// ## Endpoint: `POST /api/v1/analysis`
///
/// Creates the PENDING record, enqueues the job onto the analysis queue,
/// and records the assigned queue id. The status does not change at queue
/// acceptance; the worker's pickup moves it to PROCESSING.
pub async fn submit_analysis(
    services: web::Data<Services>,
    app_state: web::Data<AppState>,
    request: web::Json<SubmitAnalysisRequest>,
) -> AppResult<HttpResponse> {
    let request = request.into_inner();
    if request.reference_audio.trim().is_empty() || request.sample_audio.trim().is_empty() {
        return Err(AppError::BadRequest(
            "reference_audio and sample_audio must be non-empty".to_string(),
        ));
    }

    let mut params = AnalysisParams::new(request.reference_audio, request.sample_audio);
    if let Some(options) = request.options {
        params.options = options;
    }

    let task = services
        .store
        .create_task(request.user_id, params)
        .await
        .map_err(|e| AppError::Internal(format!("failed to create task: {}", e)))?;

    let queue_id = services
        .queue
        .enqueue(task.task_id)
        .await
        .map_err(|e| AppError::Internal(format!("failed to enqueue task: {}", e)))?;

    services
        .store
        .set_queue_id(task.task_id, queue_id)
        .await
        .map_err(|e| AppError::Internal(format!("failed to record queue id: {}", e)))?;

    app_state.record_task_submitted();
    tracing::info!(task_id = %task.task_id, queue_id = %queue_id, "Analysis task submitted");

    Ok(HttpResponse::Accepted().json(SubmitAnalysisResponse {
        task_id: task.task_id,
        queue_id,
        status: task.status,
    }))
}

/// Task status plus, when completed successfully, the result payload.
///
/// ## Endpoint: `GET /api/v1/analysis/{task_id}`
pub async fn get_analysis_status(
    services: web::Data<Services>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let task_id = path.into_inner();
    let task = services
        .store
        .find_task(task_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("No task with id {}", task_id)))?;

    let result = if task.status == TaskStatus::Completed {
        services
            .store
            .find_result(task_id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
    } else {
        None
    };

    Ok(HttpResponse::Ok().json(TaskStatusResponse::from_records(task, result)))
}

/// Request cancellation of a task.
///
/// ## Endpoint: `POST /api/v1/analysis/{task_id}/cancel`
///
/// A PENDING task is cancelled immediately; a PROCESSING task has its flag
/// raised and the worker moves it to CANCELLED at the next stage boundary.
/// Terminal tasks return 409.
pub async fn cancel_analysis(
    services: web::Data<Services>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let task_id = path.into_inner();
    let task = services
        .store
        .find_task(task_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("No task with id {}", task_id)))?;

    match task.status {
        TaskStatus::Pending => {
            services
                .store
                .update_status(task_id, TaskStatus::Cancelled)
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
            services.queue.cancel(task_id);
            Ok(HttpResponse::Ok().json(json!({
                "task_id": task_id,
                "status": TaskStatus::Cancelled,
            })))
        }
        TaskStatus::Processing => {
            services.queue.cancel(task_id);
            Ok(HttpResponse::Accepted().json(json!({
                "task_id": task_id,
                "status": TaskStatus::Processing,
                "message": "cancellation requested, task will stop at the next stage boundary",
            })))
        }
        terminal => Err(AppError::Conflict(format!(
            "Task {} is already {}",
            task_id, terminal
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_response_marks_success_only_with_result() {
        let store = InMemoryStoreFixture::new().await;

        // Completed without a result reads as not-succeeded.
        let response = TaskStatusResponse::from_records(store.completed_no_result.clone(), None);
        assert_eq!(response.status, TaskStatus::Completed);
        assert!(!response.succeeded);
        assert!(response.result.is_none());
    }

    struct InMemoryStoreFixture {
        completed_no_result: AnalysisTask,
    }

    impl InMemoryStoreFixture {
        async fn new() -> Self {
            use crate::tasks::store::InMemoryTaskStore;

            let store = InMemoryTaskStore::new();
            let task = store
                .create_task(Uuid::new_v4(), AnalysisParams::new("r.wav", "s.wav"))
                .await
                .unwrap();
            store
                .update_status(task.task_id, TaskStatus::Processing)
                .await
                .unwrap();
            let completed = store
                .update_status(task.task_id, TaskStatus::Completed)
                .await
                .unwrap();

            Self {
                completed_no_result: completed,
            }
        }
    }
}
