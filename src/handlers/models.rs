//! # Model Cache REST API Handlers
//!
//! Observability and ops control over the model cache.
//!
//! ## Available Endpoints:
//! - `GET /api/v1/models/status` - Per-entry cache diagnostics
//! - `POST /api/v1/models/evict` - Force-evict all unused entries

use crate::error::AppResult;
use crate::handlers::analysis::Services;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Cache diagnostics: device, per-entry memory, idle time, and active flags.
///
/// ## Endpoint: `GET /api/v1/models/status`
///
/// ## Response:
/// ```json
/// {
///   "preferred_device": "cpu",
///   "total_entries": 1,
///   "active_entries": 0,
///   "total_memory_mb": 244,
///   "max_memory_mb": 4096,
///   "entries": [
///     {
///       "model_id": "small",
///       "device": "cpu",
///       "memory_mb": 244,
///       "idle_secs": 12,
///       "reference_count": 0,
///       "is_active": false
///     }
///   ]
/// }
/// ```
pub async fn model_cache_status(services: web::Data<Services>) -> AppResult<HttpResponse> {
    let status = services.cache.status();
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "preferred_device": status.preferred_device,
        "total_entries": status.total_entries,
        "active_entries": status.active_entries,
        "total_memory_mb": status.total_memory_mb,
        "max_memory_mb": status.max_memory_mb,
        "entries": status.entries,
    })))
}

/// Force-evict every cache entry without a live reference.
///
/// ## Endpoint: `POST /api/v1/models/evict`
///
/// Ops relief valve for memory pressure; entries with live references are
/// untouched and report back in the response.
pub async fn evict_unused_models(services: web::Data<Services>) -> AppResult<HttpResponse> {
    let evicted = services.cache.evict_all_unused();
    let status = services.cache.status();

    tracing::info!(evicted, "Manual cache eviction requested");
    Ok(HttpResponse::Ok().json(json!({
        "evicted": evicted,
        "remaining_entries": status.total_entries,
        "active_entries": status.active_entries,
    })))
}
