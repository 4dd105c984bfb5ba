//! # Health and Metrics Endpoints
//!
//! Liveness plus operational detail for the worker process: request and
//! task counters, process memory, and live model-cache diagnostics.

use crate::handlers::analysis::Services;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(
    state: web::Data<AppState>,
    services: web::Data<Services>,
) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let cache = services.cache.status();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "speech-analysis-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "queue": {
            "name": config.worker.queue_name,
            "workers": config.worker.concurrency,
            "tasks_in_flight": metrics.tasks_in_flight
        },
        "tasks": {
            "submitted": metrics.tasks_submitted,
            "succeeded": metrics.tasks_succeeded,
            "failed": metrics.tasks_failed,
            "cancelled": metrics.tasks_cancelled
        },
        "memory": get_memory_info(),
        "models": {
            "configured": config.models.whisper_model,
            "preferred_device": cache.preferred_device,
            "loaded_entries": cache.total_entries,
            "active_entries": cache.active_entries,
            "total_memory_mb": cache.total_memory_mb
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "tasks": {
            "submitted": metrics.tasks_submitted,
            "succeeded": metrics.tasks_succeeded,
            "failed": metrics.tasks_failed,
            "cancelled": metrics.tasks_cancelled,
            "in_flight": metrics.tasks_in_flight
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
        let mut vm_rss = 0;
        let mut vm_size = 0;

        for line in status.lines() {
            if line.starts_with("VmRSS:") {
                if let Some(kb_str) = line.split_whitespace().nth(1) {
                    vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                }
            } else if line.starts_with("VmSize:") {
                if let Some(kb_str) = line.split_whitespace().nth(1) {
                    vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                }
            }
        }

        return json!({
            "resident_memory_bytes": vm_rss,
            "virtual_memory_bytes": vm_size,
            "available": true
        });
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Process memory info not available on this platform"
    })
}
