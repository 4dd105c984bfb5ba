//! # Task Record Store
//!
//! Persistence boundary for task status and results. The orchestrator and
//! the HTTP surface only see the trait; an in-memory implementation backs
//! tests and single-node deploys, with the relational store living behind
//! the same contract.
//!
//! ## Store-enforced invariants:
//! - Status updates must follow the task state machine
//! - At most one result row per task, written exactly once

use crate::tasks::task::{
    AnalysisParams, AnalysisPayload, AnalysisResult, AnalysisTask, TaskStatus,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Persistence operations for analysis tasks and results.
#[async_trait]
pub trait TaskRecordStore: Send + Sync {
    /// Insert a new PENDING task for the user.
    async fn create_task(&self, user_id: Uuid, params: AnalysisParams) -> Result<AnalysisTask>;

    /// Record the queue-system id assigned at queue acceptance. Does not
    /// change the task status.
    async fn set_queue_id(&self, task_id: Uuid, queue_id: Uuid) -> Result<()>;

    /// Move the task to a new status, enforcing the state machine. Sets
    /// `started_at` on entry to PROCESSING and `completed_at` on entry to a
    /// terminal state.
    async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<AnalysisTask>;

    /// Record the stage in flight and its progress percent.
    async fn update_progress(&self, task_id: Uuid, progress: u8, step: &str) -> Result<()>;

    /// Record a consumed retry and the error that caused it.
    async fn record_retry(&self, task_id: Uuid, retry_count: u32, error: &str) -> Result<()>;

    /// Record the terminal error of a task that exhausted its retries.
    async fn set_error(&self, task_id: Uuid, error: &str) -> Result<()>;

    /// Persist the result of a successful analysis. Fails if the task
    /// already has a result.
    async fn save_result(
        &self,
        task_id: Uuid,
        payload: AnalysisPayload,
        model_version: &str,
        processing_secs: f64,
    ) -> Result<AnalysisResult>;

    async fn find_task(&self, task_id: Uuid) -> Result<Option<AnalysisTask>>;

    async fn find_task_by_queue_id(&self, queue_id: Uuid) -> Result<Option<AnalysisTask>>;

    async fn find_result(&self, task_id: Uuid) -> Result<Option<AnalysisResult>>;

    /// Retention sweep: delete terminal-state tasks (and their results)
    /// older than the given age. Returns how many tasks were deleted.
    async fn delete_terminal_older_than(&self, age: Duration) -> Result<usize>;
}

/// In-memory store over two locked maps.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, AnalysisTask>>,
    results: RwLock<HashMap<Uuid, AnalysisResult>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRecordStore for InMemoryTaskStore {
    async fn create_task(&self, user_id: Uuid, params: AnalysisParams) -> Result<AnalysisTask> {
        let task = AnalysisTask::new(user_id, params);
        let mut tasks = self.tasks.write().unwrap();
        tasks.insert(task.task_id, task.clone());
        debug!(task_id = %task.task_id, "Created analysis task");
        Ok(task)
    }

    async fn set_queue_id(&self, task_id: Uuid, queue_id: Uuid) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| anyhow!("No task with id {}", task_id))?;
        task.queue_id = Some(queue_id);
        Ok(())
    }

    async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<AnalysisTask> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| anyhow!("No task with id {}", task_id))?;

        if !task.status.can_transition_to(status) {
            return Err(anyhow!(
                "Invalid status transition {} -> {} for task {}",
                task.status,
                status,
                task_id
            ));
        }

        task.status = status;
        match status {
            TaskStatus::Processing => task.started_at = Some(Utc::now()),
            s if s.is_terminal() => task.completed_at = Some(Utc::now()),
            _ => {}
        }

        debug!(task_id = %task_id, status = %status, "Task status updated");
        Ok(task.clone())
    }

    async fn update_progress(&self, task_id: Uuid, progress: u8, step: &str) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| anyhow!("No task with id {}", task_id))?;
        task.progress = progress.min(100);
        task.current_step = Some(step.to_string());
        Ok(())
    }

    async fn record_retry(&self, task_id: Uuid, retry_count: u32, error: &str) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| anyhow!("No task with id {}", task_id))?;
        task.retry_count = retry_count;
        task.error_message = Some(error.to_string());
        Ok(())
    }

    async fn set_error(&self, task_id: Uuid, error: &str) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| anyhow!("No task with id {}", task_id))?;
        task.error_message = Some(error.to_string());
        Ok(())
    }

    async fn save_result(
        &self,
        task_id: Uuid,
        payload: AnalysisPayload,
        model_version: &str,
        processing_secs: f64,
    ) -> Result<AnalysisResult> {
        {
            let tasks = self.tasks.read().unwrap();
            if !tasks.contains_key(&task_id) {
                return Err(anyhow!("No task with id {}", task_id));
            }
        }

        let mut results = self.results.write().unwrap();
        if results.contains_key(&task_id) {
            return Err(anyhow!("Task {} already has a result", task_id));
        }

        let result = AnalysisResult {
            result_id: Uuid::new_v4(),
            task_id,
            payload,
            model_version: model_version.to_string(),
            processing_secs,
            created_at: Utc::now(),
        };
        results.insert(task_id, result.clone());
        debug!(task_id = %task_id, "Analysis result saved");
        Ok(result)
    }

    async fn find_task(&self, task_id: Uuid) -> Result<Option<AnalysisTask>> {
        let tasks = self.tasks.read().unwrap();
        Ok(tasks.get(&task_id).cloned())
    }

    async fn find_task_by_queue_id(&self, queue_id: Uuid) -> Result<Option<AnalysisTask>> {
        let tasks = self.tasks.read().unwrap();
        Ok(tasks
            .values()
            .find(|task| task.queue_id == Some(queue_id))
            .cloned())
    }

    async fn find_result(&self, task_id: Uuid) -> Result<Option<AnalysisResult>> {
        let results = self.results.read().unwrap();
        Ok(results.get(&task_id).cloned())
    }

    async fn delete_terminal_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - age;
        let mut tasks = self.tasks.write().unwrap();
        let mut results = self.results.write().unwrap();

        let expired: Vec<Uuid> = tasks
            .values()
            .filter(|task| {
                task.status.is_terminal()
                    && task.completed_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|task| task.task_id)
            .collect();

        for task_id in &expired {
            tasks.remove(task_id);
            results.remove(task_id);
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Retention sweep deleted expired tasks");
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::features::FeatureSet;
    use crate::analysis::scoring::{MetricsBundle, SimilarityMetrics};

    fn params() -> AnalysisParams {
        AnalysisParams::new("ref.wav", "sample.wav")
    }

    fn payload() -> AnalysisPayload {
        let clarity = FeatureSet {
            snr: 20.0,
            hnr: 10.0,
            entropy: 8.0,
            confidence: 0.9,
            intelligibility: 1.0,
        };
        AnalysisPayload {
            metrics: MetricsBundle {
                similarity: SimilarityMetrics {
                    embedding: 1.0,
                    wer_similarity: 1.0,
                    ref_text: "a".to_string(),
                    sample_text: "a".to_string(),
                },
                clarity_reference: clarity,
                clarity_sample: clarity,
                composite_index: 1.0,
                level: 1,
            },
            suggestion: "good".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let store = InMemoryTaskStore::new();
        let task = store.create_task(Uuid::new_v4(), params()).await.unwrap();

        let found = store.find_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Pending);
        assert!(store.find_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_id_does_not_change_status() {
        let store = InMemoryTaskStore::new();
        let task = store.create_task(Uuid::new_v4(), params()).await.unwrap();

        let queue_id = Uuid::new_v4();
        store.set_queue_id(task.task_id, queue_id).await.unwrap();

        let found = store.find_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Pending);
        assert_eq!(found.queue_id, Some(queue_id));

        let by_queue = store.find_task_by_queue_id(queue_id).await.unwrap().unwrap();
        assert_eq!(by_queue.task_id, task.task_id);
    }

    #[tokio::test]
    async fn test_status_transitions_enforced() {
        let store = InMemoryTaskStore::new();
        let task = store.create_task(Uuid::new_v4(), params()).await.unwrap();

        // Pending cannot jump straight to Completed.
        assert!(store
            .update_status(task.task_id, TaskStatus::Completed)
            .await
            .is_err());

        let processing = store
            .update_status(task.task_id, TaskStatus::Processing)
            .await
            .unwrap();
        assert!(processing.started_at.is_some());

        let completed = store
            .update_status(task.task_id, TaskStatus::Completed)
            .await
            .unwrap();
        assert!(completed.completed_at.is_some());

        // Terminal states reject any further transition.
        assert!(store
            .update_status(task.task_id, TaskStatus::Cancelled)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_result_saved_exactly_once() {
        let store = InMemoryTaskStore::new();
        let task = store.create_task(Uuid::new_v4(), params()).await.unwrap();

        store
            .save_result(task.task_id, payload(), "whisper-small", 1.5)
            .await
            .unwrap();
        let second = store
            .save_result(task.task_id, payload(), "whisper-small", 1.5)
            .await;
        assert!(second.is_err());

        let result = store.find_result(task.task_id).await.unwrap().unwrap();
        assert_eq!(result.model_version, "whisper-small");
    }

    #[tokio::test]
    async fn test_retention_sweep_only_touches_old_terminal_tasks() {
        let store = InMemoryTaskStore::new();

        let pending = store.create_task(Uuid::new_v4(), params()).await.unwrap();
        let done = store.create_task(Uuid::new_v4(), params()).await.unwrap();
        store
            .update_status(done.task_id, TaskStatus::Processing)
            .await
            .unwrap();
        store
            .update_status(done.task_id, TaskStatus::Completed)
            .await
            .unwrap();

        // Nothing is older than a day yet.
        assert_eq!(
            store.delete_terminal_older_than(Duration::days(1)).await.unwrap(),
            0
        );

        // With a zero cutoff the completed task expires, the pending one stays.
        assert_eq!(
            store
                .delete_terminal_older_than(Duration::seconds(-1))
                .await
                .unwrap(),
            1
        );
        assert!(store.find_task(done.task_id).await.unwrap().is_none());
        assert!(store.find_task(pending.task_id).await.unwrap().is_some());
    }
}
