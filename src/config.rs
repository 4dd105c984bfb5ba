//! # Configuration Management
//!
//! Loads and validates application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_WORKER_CONCURRENCY, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, models, cache,
/// worker, retry, suggestion, retention, storage) keeps each subsystem's
/// knobs together and makes partial overrides via environment variables
/// predictable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub cache: CacheConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub suggestion: SuggestionConfig,
    pub retention: RetentionConfig,
    pub storage: StorageConfig,
}

/// HTTP ops-surface configuration.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech-recognition model configuration.
///
/// ## Fields:
/// - `whisper_model`: Which Whisper variant to use ("tiny", "base", "small", "medium", "large")
/// - `language`: Transcription language (ISO 639-1); no auto-detection fallback
/// - `device`: Device preference ("auto", "cpu", "cuda", "metal")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub whisper_model: String,
    pub language: String,
    pub device: String,
}

/// Model-cache memory and lifecycle limits.
///
/// ## Fields:
/// - `max_memory_mb`: Total memory budget for loaded models
/// - `accelerator_memory_mb`: Byte budget for entries resident on an accelerator
/// - `max_idle_secs`: Idle time after which an unreferenced entry is evictable
/// - `sweep_interval_secs`: Period of the background idle-eviction sweep
/// - `min_headroom_mb`: Minimum free system RAM required before a new load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_memory_mb: u64,
    pub accelerator_memory_mb: u64,
    pub max_idle_secs: u64,
    pub sweep_interval_secs: u64,
    pub min_headroom_mb: u64,
}

/// Analysis worker-pool configuration.
///
/// ## Fields:
/// - `concurrency`: Number of worker tasks consuming the analysis queue
/// - `queue_name`: Name of the analysis queue (routing label in logs/metrics)
/// - `queue_capacity`: Bounded queue depth before submission backpressure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub queue_name: String,
    pub queue_capacity: usize,
}

/// Retry and timeout policy for analysis tasks.
///
/// Transient failures are retried with exponential backoff: the interval
/// starts at `backoff_start_secs`, doubles per attempt, and is capped at
/// `backoff_max_secs`. The soft time limit cancels an attempt gracefully
/// (and counts as transient); the hard limit bounds the whole attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_start_secs: u64,
    pub backoff_max_secs: u64,
    pub soft_time_limit_secs: u64,
    pub hard_time_limit_secs: u64,
}

/// External suggestion-generation service configuration.
///
/// ## Fields:
/// - `endpoint`: Base URL of the generative-language API
/// - `model`: Model resource name used in the request path
/// - `api_key_env`: Environment variable holding the API key (never stored in config files)
/// - `timeout_secs`: Per-request timeout for the HTTP call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
}

/// Retention sweep configuration for terminal-state task records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub max_age_days: i64,
    pub sweep_interval_secs: u64,
}

/// Audio storage configuration for the filesystem-backed collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                whisper_model: "small".to_string(),
                language: "zh".to_string(),
                device: "auto".to_string(),
            },
            cache: CacheConfig {
                max_memory_mb: 4096,
                accelerator_memory_mb: 6144,
                max_idle_secs: 1800,
                sweep_interval_secs: 300,
                min_headroom_mb: 1024,
            },
            worker: WorkerConfig {
                concurrency: 2,
                queue_name: "audio_analysis".to_string(),
                queue_capacity: 256,
            },
            retry: RetryConfig {
                max_retries: 3,
                backoff_start_secs: 60,
                backoff_max_secs: 300,
                soft_time_limit_secs: 1500,
                hard_time_limit_secs: 1800,
            },
            suggestion: SuggestionConfig {
                endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                model: "gemini-1.5-flash-latest".to_string(),
                api_key_env: "SUGGESTION_API_KEY".to_string(),
                timeout_secs: 30,
            },
            retention: RetentionConfig {
                max_age_days: 7,
                sweep_interval_secs: 3600,
            },
            storage: StorageConfig {
                root_dir: "./audio-store".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_PORT=3000`: Override server port
    /// - `APP_MODELS_WHISPER_MODEL=medium`: Override whisper model
    /// - `APP_WORKER_CONCURRENCY=4`: Override worker pool size
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup prevents runtime failures
    /// deep inside a worker attempt, where they would be retried pointlessly.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.worker.concurrency == 0 {
            return Err(anyhow::anyhow!("Worker concurrency must be greater than 0"));
        }

        if self.worker.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Queue capacity must be greater than 0"));
        }

        if self.cache.max_memory_mb == 0 {
            return Err(anyhow::anyhow!("Model cache memory budget must be greater than 0"));
        }

        if self.retry.backoff_start_secs == 0 {
            return Err(anyhow::anyhow!("Retry backoff start interval must be greater than 0"));
        }

        if self.retry.soft_time_limit_secs >= self.retry.hard_time_limit_secs {
            return Err(anyhow::anyhow!(
                "Soft time limit ({}) must be below the hard time limit ({})",
                self.retry.soft_time_limit_secs,
                self.retry.hard_time_limit_secs
            ));
        }

        if self.retention.max_age_days <= 0 {
            return Err(anyhow::anyhow!("Retention max age must be at least one day"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.worker.queue_name, "audio_analysis");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_time_limit_ordering() {
        let mut config = AppConfig::default();
        config.retry.soft_time_limit_secs = 2000;
        config.retry.hard_time_limit_secs = 1800;
        assert!(config.validate().is_err());
    }
}
