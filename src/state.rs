//! # Application State Management
//!
//! Shared state accessed by the HTTP ops handlers, the middleware, and the
//! analysis workers.
//!
//! ## Thread Safety Pattern:
//! All mutable data sits behind `Arc<RwLock<T>>`: many readers (status
//! checks, metrics snapshots) or one writer (counter updates) at a time.
//! The worker pool and every HTTP handler hold clones of the same state.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (read-mostly after startup)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and task counters, updated by middleware and workers
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the process started (never changes, safe to share directly)
    pub start_time: Instant,
}

/// Counters collected across HTTP requests and analysis tasks.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since start
    pub request_count: u64,

    /// Total number of HTTP errors since start
    pub error_count: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    /// Analysis tasks accepted onto the queue
    pub tasks_submitted: u64,

    /// Tasks that reached COMPLETED with a persisted result
    pub tasks_succeeded: u64,

    /// Tasks that reached COMPLETED after exhausting retries (no result)
    pub tasks_failed: u64,

    /// Tasks that reached CANCELLED
    pub tasks_cancelled: u64,

    /// Tasks currently in PROCESSING
    pub tasks_in_flight: u32,
}

/// Performance metrics for a specific HTTP endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately so other threads are not
    /// blocked while the caller works with the snapshot.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_task_submitted(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.tasks_submitted += 1;
    }

    /// Called when a worker moves a task into PROCESSING.
    pub fn record_task_started(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.tasks_in_flight += 1;
    }

    /// Called when a task leaves PROCESSING, with its terminal outcome.
    pub fn record_task_finished(&self, outcome: TaskOutcome) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.tasks_in_flight > 0 {
            metrics.tasks_in_flight -= 1;
        }
        match outcome {
            TaskOutcome::Succeeded => metrics.tasks_succeeded += 1,
            TaskOutcome::Failed => metrics.tasks_failed += 1,
            TaskOutcome::Cancelled => metrics.tasks_cancelled += 1,
        }
    }

    /// Get a snapshot of current metrics (used by the metrics endpoint).
    ///
    /// Clones the data so the read lock is not held while the response is
    /// serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
            tasks_submitted: metrics.tasks_submitted,
            tasks_succeeded: metrics.tasks_succeeded,
            tasks_failed: metrics.tasks_failed,
            tasks_cancelled: metrics.tasks_cancelled,
            tasks_in_flight: metrics.tasks_in_flight,
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Terminal outcome of a processed task, for metrics accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_counters() {
        let state = AppState::new(AppConfig::default());

        state.record_task_submitted();
        state.record_task_started();
        state.record_task_finished(TaskOutcome::Succeeded);
        state.record_task_started();
        state.record_task_finished(TaskOutcome::Failed);

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.tasks_submitted, 1);
        assert_eq!(snapshot.tasks_succeeded, 1);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.tasks_in_flight, 0);
    }

    #[test]
    fn test_in_flight_never_underflows() {
        let state = AppState::new(AppConfig::default());
        state.record_task_finished(TaskOutcome::Cancelled);
        assert_eq!(state.get_metrics_snapshot().tasks_in_flight, 0);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = snapshot.endpoint_metrics.get("GET /health").unwrap();
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }
}
