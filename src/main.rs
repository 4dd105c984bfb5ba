//! # Speech Analysis Backend - Worker Process Entry Point
//!
//! Boots the asynchronous audio-analysis worker: the model cache, the
//! analysis queue and its worker pool, the maintenance sweeps, and the thin
//! HTTP surface for submission, status, cancellation, and observability.
//!
//! ## Process Lifecycle:
//! 1. **Load configuration** from config.toml and environment variables
//! 2. **Construct the model cache** once and pass it by handle (no global
//!    singleton), then prewarm the default model so the first task skips
//!    the cold-load latency
//! 3. **Start the worker pool** consuming the analysis queue
//! 4. **Start the maintenance sweeps**: idle model eviction and task
//!    retention cleanup
//! 5. **Serve HTTP** until SIGINT/SIGTERM, then drain the queue and
//!    force-evict all unused models

mod analysis;    // Feature extraction, scoring, suggestion generation
mod audio;       // WAV decode and resampling
mod config;      // Configuration management
mod device;      // Compute-device detection and selection
mod error;       // HTTP and pipeline error types
mod handlers;    // HTTP request handlers
mod health;      // Health and metrics endpoints
mod middleware;  // Request logging and metrics middleware
mod state;       // Shared application state
mod storage;     // Audio storage collaborator
mod tasks;       // Task records, store, queue, orchestrator
mod transcription; // Whisper models, model cache, transcription service

use crate::analysis::features::FeatureExtractor;
use crate::analysis::suggestion::{
    HttpSuggestionClient, StaticSuggestionGenerator, SuggestionGenerator,
};
use crate::handlers::analysis::Services;
use crate::storage::LocalAudioStorage;
use crate::tasks::orchestrator::AnalysisOrchestrator;
use crate::tasks::queue::{spawn_workers, AnalysisQueue};
use crate::tasks::store::{InMemoryTaskStore, TaskRecordStore};
use crate::transcription::cache::{CacheLimits, ModelCache};
use crate::transcription::model::WhisperLoader;
use crate::transcription::service::TranscriptionService;
use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal raised by the SIGINT/SIGTERM handlers.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speech-analysis-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} / queue '{}' x{} workers",
        config.server.host, config.server.port, config.worker.queue_name, config.worker.concurrency
    );

    let app_state = AppState::new(config.clone());

    // One cache per worker process, passed by handle everywhere.
    let preferred_device = device::preferred_kind_from_string(&config.models.device);
    let cache = Arc::new(ModelCache::new(
        Arc::new(WhisperLoader),
        CacheLimits::from_config(&config.cache),
        preferred_device,
    ));

    // Prewarm the configured model off the async runtime; a failure here is
    // logged and the model loads on demand instead.
    {
        let cache = Arc::clone(&cache);
        let model_id = config.models.whisper_model.clone();
        tokio::task::spawn_blocking(move || cache.prewarm(&model_id))
            .await
            .ok();
    }

    let store: Arc<dyn TaskRecordStore> = Arc::new(InMemoryTaskStore::new());
    let storage = Arc::new(LocalAudioStorage::new(config.storage.root_dir.clone()));
    let transcriber = Arc::new(TranscriptionService::new(
        Arc::clone(&cache),
        config.models.whisper_model.clone(),
        config.models.language.clone(),
    ));

    let suggester: Arc<dyn SuggestionGenerator> =
        match HttpSuggestionClient::from_config(&config.suggestion) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                warn!(
                    error = %e,
                    "Suggestion service not configured, falling back to static suggestions"
                );
                Arc::new(StaticSuggestionGenerator)
            }
        };

    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        Arc::clone(&store),
        storage,
        transcriber,
        Arc::new(FeatureExtractor::new()),
        suggester,
        app_state.clone(),
        config.retry.clone(),
    ));

    let (queue, receiver) = AnalysisQueue::new(&config.worker.queue_name, config.worker.queue_capacity);
    let worker_handles = spawn_workers(
        Arc::clone(&queue),
        receiver,
        orchestrator,
        config.worker.concurrency,
    );

    let maintenance_handles = spawn_maintenance(
        Arc::clone(&cache),
        Arc::clone(&store),
        &config,
    );

    let services = web::Data::new(Services {
        store: Arc::clone(&store),
        queue: Arc::clone(&queue),
        cache: Arc::clone(&cache),
    });

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    setup_signal_handlers();
    info!("Starting HTTP server on {}", bind_addr);

    let state_for_server = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(state_for_server.clone()))
            .app_data(services.clone())
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/analysis", web::post().to(handlers::submit_analysis))
                    .route("/analysis/{task_id}", web::get().to(handlers::get_analysis_status))
                    .route(
                        "/analysis/{task_id}/cancel",
                        web::post().to(handlers::cancel_analysis),
                    )
                    .route("/models/status", web::get().to(handlers::model_cache_status))
                    .route("/models/evict", web::post().to(handlers::evict_unused_models)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Drain: no new jobs, let workers finish what they hold, then release
    // every model the cache still owns.
    info!("Draining analysis queue...");
    queue.close();
    for handle in maintenance_handles {
        handle.abort();
    }
    for handle in worker_handles {
        if let Err(e) = handle.await {
            warn!("Worker task ended abnormally: {}", e);
        }
    }
    let evicted = cache.evict_all_unused();
    info!(evicted, "Worker shutdown complete");

    Ok(())
}

/// Periodic maintenance: the model-cache idle sweep and the task retention
/// sweep (terminal tasks older than the configured age).
fn spawn_maintenance(
    cache: Arc<ModelCache>,
    store: Arc<dyn TaskRecordStore>,
    config: &AppConfig,
) -> Vec<tokio::task::JoinHandle<()>> {
    let cache_interval = Duration::from_secs(config.cache.sweep_interval_secs);
    let retention_interval = Duration::from_secs(config.retention.sweep_interval_secs);
    let retention_age = chrono::Duration::days(config.retention.max_age_days);

    let cache_sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cache_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let max_idle = cache.max_idle();
            let cache = Arc::clone(&cache);
            // Eviction can drop large buffers; keep it off the reactor.
            tokio::task::spawn_blocking(move || cache.evict_idle(max_idle))
                .await
                .ok();
        }
    });

    let retention_sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(retention_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match store.delete_terminal_older_than(retention_age).await {
                Ok(0) => {}
                Ok(count) => info!(count, "Retention sweep removed expired tasks"),
                Err(e) => warn!(error = %e, "Retention sweep failed"),
            }
        }
    });

    vec![cache_sweep, retention_sweep]
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` controls verbosity; the default keeps this crate at debug and
/// the web framework at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_analysis_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Install SIGTERM/SIGINT handlers that raise the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag without blocking other tasks.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
