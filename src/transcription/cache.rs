//! # Model Cache
//!
//! Thread-safe, reference-counted, memory-bounded cache of loaded speech
//! models. Hands out ready-to-use model instances while bounding total
//! memory use and avoiding redundant loads.
//!
//! ## Key Properties:
//! - **One lock**: every mutating operation (acquire/release/evict) runs
//!   under a single mutex over the cache interior; concurrent requests for
//!   the same model serialize and reuse one load.
//! - **Scoped handles**: `acquire` returns a `ModelHandle` whose `Drop`
//!   releases the reference on every exit path, so a panicking caller still
//!   returns its slot once unwound.
//! - **Refcount safety**: an entry with a live reference is never evicted,
//!   by the idle sweep or by forced eviction.
//! - **Explicit reclamation**: eviction drops the owning `Arc`; freeing
//!   model memory is ordinary ownership, not a collector hint. Accelerator
//!   memory release runs as an explicit post-eviction hook.
//!
//! The cache is constructed once per worker process in `main` and passed
//! around by `Arc`; there is deliberately no global singleton.

use crate::device::DeviceKind;
use crate::error::{PipelineError, PipelineResult};
use crate::transcription::model::SpeechModel;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Loads a model for a given identifier onto a given device.
///
/// The production implementation is `WhisperLoader` (candle weights from the
/// hub); tests inject a stub so cache behavior is exercised without any
/// model download.
pub trait ModelLoader: Send + Sync {
    /// Load the model onto the requested device. The error string carries
    /// the device-specific failure reason for the fallback log line.
    fn load(&self, model_id: &str, device: DeviceKind) -> Result<Arc<dyn SpeechModel>, String>;

    /// Estimated resident size of the model before loading it, used for
    /// admission checks.
    fn estimated_memory_bytes(&self, model_id: &str) -> u64;
}

/// Memory and lifecycle limits, taken from `CacheConfig` at construction.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    pub max_memory_bytes: u64,
    pub accelerator_memory_bytes: u64,
    pub max_idle: Duration,
    pub min_headroom_bytes: u64,
}

impl CacheLimits {
    pub fn from_config(config: &crate::config::CacheConfig) -> Self {
        Self {
            max_memory_bytes: config.max_memory_mb * 1024 * 1024,
            accelerator_memory_bytes: config.accelerator_memory_mb * 1024 * 1024,
            max_idle: Duration::from_secs(config.max_idle_secs),
            min_headroom_bytes: config.min_headroom_mb * 1024 * 1024,
        }
    }
}

/// One loaded model instance plus its bookkeeping fields.
///
/// Only the bookkeeping fields (`last_used`, `refcount`) mutate after
/// creation; the model itself and its device are fixed for the entry's
/// lifetime.
struct CacheEntry {
    model: Arc<dyn SpeechModel>,
    device: DeviceKind,
    last_used: Instant,
    memory_bytes: u64,
    refcount: u32,
}

impl CacheEntry {
    fn is_active(&self) -> bool {
        self.refcount > 0
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }
}

/// Result of one load attempt, made explicit so the accelerator-to-CPU
/// fallback is ordinary control flow rather than exception catching.
enum LoadAttempt {
    Loaded(Arc<dyn SpeechModel>, DeviceKind),
    Failed(String),
}

/// Thread-safe, memory-bounded cache of loaded speech models.
pub struct ModelCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    loader: Arc<dyn ModelLoader>,
    limits: CacheLimits,
    preferred_device: DeviceKind,
}

impl ModelCache {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        limits: CacheLimits,
        preferred_device: DeviceKind,
    ) -> Self {
        info!(
            device = %preferred_device,
            max_memory_mb = limits.max_memory_bytes / (1024 * 1024),
            "Model cache initialized"
        );
        Self {
            entries: Mutex::new(HashMap::new()),
            loader,
            limits,
            preferred_device,
        }
    }

    /// Acquire a scoped handle to the model for `model_id`.
    ///
    /// ## Behavior:
    /// - Cache hit: bump the reference count, refresh last-used, return.
    /// - Cache miss: run the idle sweep, check memory availability (forcing
    ///   eviction of unused entries when short), then load: preferred
    ///   device first, one logged fallback to CPU on any device-specific
    ///   failure.
    ///
    /// Loads are serialized under the cache lock, so two workers requesting
    /// the same missing model produce exactly one load.
    pub fn acquire(self: &Arc<Self>, model_id: &str) -> PipelineResult<ModelHandle> {
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get_mut(model_id) {
            entry.refcount += 1;
            entry.last_used = Instant::now();
            debug!(model_id, refcount = entry.refcount, "Model cache hit");
            return Ok(ModelHandle {
                cache: Arc::clone(self),
                model_id: model_id.to_string(),
                model: Arc::clone(&entry.model),
                device: entry.device,
            });
        }

        // Opportunistic sweep before admitting a new entry.
        let swept = Self::evict_idle_locked(&mut entries, self.limits.max_idle);
        if !swept.is_empty() {
            debug!(count = swept.len(), "Swept idle models before load");
            self.after_eviction(&swept);
        }

        let estimate = self.loader.estimated_memory_bytes(model_id);
        self.ensure_capacity_locked(&mut entries, estimate);

        let start = Instant::now();
        let (model, device) = match self.load_with_fallback(model_id) {
            LoadAttempt::Loaded(model, device) => (model, device),
            LoadAttempt::Failed(reason) => {
                return Err(PipelineError::ModelLoad(format!(
                    "{}: {}",
                    model_id, reason
                )));
            }
        };

        let memory_bytes = model.memory_bytes();
        info!(
            model_id,
            device = %device,
            memory_mb = memory_bytes / (1024 * 1024),
            load_secs = start.elapsed().as_secs_f64(),
            "Model loaded"
        );

        entries.insert(
            model_id.to_string(),
            CacheEntry {
                model: Arc::clone(&model),
                device,
                last_used: Instant::now(),
                memory_bytes,
                refcount: 1,
            },
        );

        Ok(ModelHandle {
            cache: Arc::clone(self),
            model_id: model_id.to_string(),
            model,
            device,
        })
    }

    /// Decrement the reference count for `model_id`.
    ///
    /// Called by `ModelHandle::drop`; the entry becomes eligible for
    /// eviction once the count reaches zero.
    fn release(&self, model_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(model_id) {
            entry.refcount = entry.refcount.saturating_sub(1);
            debug!(model_id, refcount = entry.refcount, "Model reference released");
        }
    }

    /// Evict zero-reference entries idle longer than `max_idle`.
    ///
    /// Invoked opportunistically before new loads and by the periodic sweep
    /// task. Returns the number of entries evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let evicted = Self::evict_idle_locked(&mut entries, max_idle);
        drop(entries);
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted idle models");
            self.after_eviction(&evicted);
        }
        evicted.len()
    }

    /// Force-evict every entry without a live reference.
    ///
    /// Used under memory pressure and at worker shutdown. Returns the number
    /// of entries evicted.
    pub fn evict_all_unused(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let evicted = Self::evict_matching_locked(&mut entries, |_| true);
        drop(entries);
        if !evicted.is_empty() {
            warn!(count = evicted.len(), "Force-evicted all unused models");
            self.after_eviction(&evicted);
        }
        evicted.len()
    }

    /// Load-and-release the model once so the first task does not pay the
    /// cold-load latency. Failure is reported, not fatal: the model will be
    /// loaded on demand instead.
    pub fn prewarm(self: &Arc<Self>, model_id: &str) {
        info!(model_id, "Prewarming model");
        match self.acquire(model_id) {
            Ok(handle) => {
                drop(handle);
                info!(model_id, "Model prewarm complete");
            }
            Err(e) => {
                warn!(model_id, error = %e, "Model prewarm failed");
            }
        }
    }

    /// Per-entry diagnostics for the ops surface.
    pub fn status(&self) -> CacheStatus {
        let entries = self.entries.lock().unwrap();
        let now = Instant::now();

        let entry_statuses: Vec<EntryStatus> = entries
            .iter()
            .map(|(model_id, entry)| EntryStatus {
                model_id: model_id.clone(),
                device: entry.device.to_string(),
                memory_mb: entry.memory_bytes / (1024 * 1024),
                idle_secs: entry.idle_for(now).as_secs(),
                reference_count: entry.refcount,
                is_active: entry.is_active(),
            })
            .collect();

        let total_memory_bytes: u64 = entries.values().map(|e| e.memory_bytes).sum();
        CacheStatus {
            preferred_device: self.preferred_device.to_string(),
            total_entries: entries.len(),
            active_entries: entries.values().filter(|e| e.is_active()).count(),
            total_memory_mb: total_memory_bytes / (1024 * 1024),
            max_memory_mb: self.limits.max_memory_bytes / (1024 * 1024),
            entries: entry_statuses,
        }
    }

    /// The configured idle threshold, for the periodic sweep task.
    pub fn max_idle(&self) -> Duration {
        self.limits.max_idle
    }

    /// Make room for a new entry of `estimate` bytes.
    ///
    /// Order of escalation mirrors the admission policy: check system RAM
    /// headroom and the model-memory budget; when a targeted amount must be
    /// freed, evict zero-reference entries least-recently-used first; when
    /// headroom is still short, force-evict everything unused. If all
    /// remaining entries are active the load proceeds anyway and the
    /// operating system arbitrates, matching the reference behavior of
    /// warn-and-continue rather than failing the task.
    fn ensure_capacity_locked(&self, entries: &mut HashMap<String, CacheEntry>, estimate: u64) {
        let budget = if self.preferred_device.is_accelerator() {
            self.limits.accelerator_memory_bytes.min(self.limits.max_memory_bytes)
        } else {
            self.limits.max_memory_bytes
        };

        let resident: u64 = entries.values().map(|e| e.memory_bytes).sum();
        if resident + estimate > budget {
            let target = (resident + estimate) - budget;
            let evicted = Self::evict_lru_locked(entries, target);
            if !evicted.is_empty() {
                warn!(
                    freed = evicted.len(),
                    target_bytes = target,
                    "Evicted least-recently-used models to admit new load"
                );
                self.after_eviction(&evicted);
            }
        }

        if let Some(available) = system_available_memory() {
            if available < self.limits.min_headroom_bytes + estimate {
                warn!(
                    available_mb = available / (1024 * 1024),
                    "Low system memory headroom, force-evicting unused models"
                );
                let evicted = Self::evict_matching_locked(entries, |_| true);
                self.after_eviction(&evicted);
            }
        }

        let still_resident: u64 = entries.values().map(|e| e.memory_bytes).sum();
        if still_resident + estimate > budget {
            warn!(
                resident_mb = still_resident / (1024 * 1024),
                estimate_mb = estimate / (1024 * 1024),
                budget_mb = budget / (1024 * 1024),
                "Model budget exceeded by active entries, loading anyway"
            );
        }
    }

    /// One load attempt with at most one accelerator-to-CPU fallback.
    fn load_with_fallback(&self, model_id: &str) -> LoadAttempt {
        let preferred = self.preferred_device;

        match self.loader.load(model_id, preferred) {
            Ok(model) => LoadAttempt::Loaded(model, preferred),
            Err(reason) if preferred.is_accelerator() => {
                warn!(
                    model_id,
                    device = %preferred,
                    error = %reason,
                    "Device load failed, falling back to CPU for this load"
                );
                match self.loader.load(model_id, DeviceKind::Cpu) {
                    Ok(model) => LoadAttempt::Loaded(model, DeviceKind::Cpu),
                    Err(cpu_reason) => LoadAttempt::Failed(format!(
                        "{} load failed ({}); CPU fallback failed ({})",
                        preferred, reason, cpu_reason
                    )),
                }
            }
            Err(reason) => LoadAttempt::Failed(reason),
        }
    }

    fn evict_idle_locked(
        entries: &mut HashMap<String, CacheEntry>,
        max_idle: Duration,
    ) -> Vec<(String, DeviceKind)> {
        let now = Instant::now();
        Self::evict_matching_locked(entries, |entry| entry.idle_for(now) > max_idle)
    }

    /// Remove zero-reference entries matching the predicate. Active entries
    /// are never candidates regardless of the predicate.
    fn evict_matching_locked<F>(
        entries: &mut HashMap<String, CacheEntry>,
        predicate: F,
    ) -> Vec<(String, DeviceKind)>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let victims: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_active() && predicate(entry))
            .map(|(key, _)| key.clone())
            .collect();

        let mut evicted = Vec::with_capacity(victims.len());
        for key in victims {
            if let Some(entry) = entries.remove(&key) {
                debug!(model_id = %key, device = %entry.device, "Evicted model");
                evicted.push((key, entry.device));
                // Dropping `entry.model` here releases the last cache-owned
                // reference; memory returns once any outstanding handles drop.
            }
        }
        evicted
    }

    /// Evict zero-reference entries least-recently-used first until at least
    /// `target_bytes` have been freed or no candidates remain.
    fn evict_lru_locked(
        entries: &mut HashMap<String, CacheEntry>,
        target_bytes: u64,
    ) -> Vec<(String, DeviceKind)> {
        let mut candidates: Vec<(String, Instant, u64)> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_active())
            .map(|(key, entry)| (key.clone(), entry.last_used, entry.memory_bytes))
            .collect();
        candidates.sort_by_key(|(_, last_used, _)| *last_used);

        let mut freed = 0u64;
        let mut evicted = Vec::new();
        for (key, _, memory_bytes) in candidates {
            if freed >= target_bytes {
                break;
            }
            if let Some(entry) = entries.remove(&key) {
                freed += memory_bytes;
                debug!(model_id = %key, freed_bytes = memory_bytes, "LRU-evicted model");
                evicted.push((key, entry.device));
            }
        }
        evicted
    }

    /// Post-eviction hook: explicit point where accelerator memory release
    /// happens once candle buffers drop. Logged so operators can correlate
    /// accelerator memory dips with evictions.
    fn after_eviction(&self, evicted: &[(String, DeviceKind)]) {
        for (model_id, device) in evicted {
            if device.is_accelerator() {
                debug!(model_id = %model_id, device = %device, "Released accelerator memory");
            }
        }
    }
}

/// Scoped, borrowed reference to a cached model.
///
/// Dereferences to the model; dropping the handle releases the cache
/// reference on every exit path, including panics unwinding through the
/// holder.
pub struct ModelHandle {
    cache: Arc<ModelCache>,
    model_id: String,
    model: Arc<dyn SpeechModel>,
    device: DeviceKind,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.model_id)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl ModelHandle {
    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Deref for ModelHandle {
    type Target = dyn SpeechModel;

    fn deref(&self) -> &Self::Target {
        self.model.as_ref()
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.cache.release(&self.model_id);
    }
}

/// Cache diagnostics for the ops surface.
#[derive(Debug, Serialize)]
pub struct CacheStatus {
    pub preferred_device: String,
    pub total_entries: usize,
    pub active_entries: usize,
    pub total_memory_mb: u64,
    pub max_memory_mb: u64,
    pub entries: Vec<EntryStatus>,
}

#[derive(Debug, Serialize)]
pub struct EntryStatus {
    pub model_id: String,
    pub device: String,
    pub memory_mb: u64,
    pub idle_secs: u64,
    pub reference_count: u32,
    pub is_active: bool,
}

/// Available system memory in bytes, from /proc/meminfo.
///
/// Returns `None` when the information is unavailable (non-Linux hosts,
/// restricted mounts); the caller treats that as "no headroom constraint",
/// matching the reference behavior of allowing the load when the check
/// itself fails.
fn system_available_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .ok()?;
            return Some(kb * 1024);
        }
    }
    None
}
