//! # Device Detection and Selection
//!
//! Handles detection and selection of compute devices (CPU/GPU) for model
//! inference. The model cache re-evaluates the device per load attempt, so
//! no process-wide detection result is cached here: a failed accelerator
//! load falls back to CPU for that load only, not for the process.

use candle_core::Device;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    /// Automatically select the best available device
    Auto,
    /// Force CPU usage
    Cpu,
    /// Force CUDA GPU usage (will fallback to CPU if not available)
    Cuda,
    /// Force Metal GPU usage (will fallback to CPU if not available)
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

impl Default for DevicePreference {
    fn default() -> Self {
        DevicePreference::Auto
    }
}

/// Device identity recorded on cache entries and surfaced by diagnostics.
///
/// Kept separate from `candle_core::Device` so cache bookkeeping and tests
/// never depend on an accelerator actually being present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceKind {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceKind {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, DeviceKind::Cpu)
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            DeviceKind::Metal(ordinal) => write!(f, "metal:{}", ordinal),
        }
    }
}

/// Device detection and selection utilities
pub struct DeviceManager;

impl DeviceManager {
    /// Resolve a preference to the device kind a load should attempt first.
    pub fn preferred_kind(preference: DevicePreference) -> DeviceKind {
        match preference {
            DevicePreference::Auto => Self::detect_best_kind(),
            DevicePreference::Cpu => DeviceKind::Cpu,
            DevicePreference::Cuda => {
                if Self::is_cuda_available() {
                    DeviceKind::Cuda(0)
                } else {
                    DeviceKind::Cpu
                }
            }
            DevicePreference::Metal => {
                if Self::is_metal_available() {
                    DeviceKind::Metal(0)
                } else {
                    DeviceKind::Cpu
                }
            }
        }
    }

    /// Detect the best available device kind.
    fn detect_best_kind() -> DeviceKind {
        info!("Detecting best available compute device...");

        if Self::is_cuda_available() {
            info!("Selected CUDA GPU for model inference");
            return DeviceKind::Cuda(0);
        }

        if Self::is_metal_available() {
            info!("Selected Metal GPU for model inference");
            return DeviceKind::Metal(0);
        }

        info!("Using CPU for model inference (no GPU acceleration available)");
        DeviceKind::Cpu
    }

    /// Materialize a candle device for the given kind.
    ///
    /// Device construction can fail even when detection succeeded earlier
    /// (driver state changes, exhausted accelerator memory), so this returns
    /// a `Result` and the caller decides on fallback.
    pub fn create(kind: DeviceKind) -> Result<Device, String> {
        match kind {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Cuda(ordinal) => Device::new_cuda(ordinal)
                .map_err(|e| format!("CUDA device {} unavailable: {}", ordinal, e)),
            DeviceKind::Metal(ordinal) => Device::new_metal(ordinal)
                .map_err(|e| format!("Metal device {} unavailable: {}", ordinal, e)),
        }
    }

    fn is_cuda_available() -> bool {
        match Device::new_cuda(0) {
            Ok(_) => {
                debug!("CUDA device 0 available");
                true
            }
            Err(e) => {
                debug!("CUDA not available: {}", e);
                false
            }
        }
    }

    fn is_metal_available() -> bool {
        match Device::new_metal(0) {
            Ok(_) => {
                debug!("Metal device 0 available");
                true
            }
            Err(e) => {
                debug!("Metal not available: {}", e);
                false
            }
        }
    }
}

/// Resolve a config string to the first device kind a load should try.
pub fn preferred_kind_from_string(device_str: &str) -> DeviceKind {
    match device_str.parse::<DevicePreference>() {
        Ok(preference) => DeviceManager::preferred_kind(preference),
        Err(_) => {
            warn!("Invalid device preference '{}', using auto", device_str);
            DeviceManager::preferred_kind(DevicePreference::Auto)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("cpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("cuda".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("invalid".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_always_materializes() {
        let device = DeviceManager::create(DeviceKind::Cpu);
        assert!(device.is_ok());
    }

    #[test]
    fn test_device_kind_display() {
        assert_eq!(DeviceKind::Cpu.to_string(), "cpu");
        assert_eq!(DeviceKind::Cuda(0).to_string(), "cuda:0");
        assert!(!DeviceKind::Cpu.is_accelerator());
        assert!(DeviceKind::Cuda(0).is_accelerator());
    }
}
