//! Engine configuration and host memory detection.
//!
//! # Environment Variables
//!
//! - `F3D_MEM_MB` - Memory ceiling per chunk in megabytes (all devices)
//! - `F3D_MAX_SLICES` - Slice cap applied to every device
//! - `F3D_SAMPLE_FOOTPRINT` - Bytes per voxel used in chunk sizing
//! - `F3D_CPU_CEILING_MB` - Memory ceiling for CPU-like devices

use std::env;
use std::sync::OnceLock;

/// Bytes per voxel assumed by chunk sizing.
pub const DEFAULT_SAMPLE_FOOTPRINT: usize = 8;

/// Ceiling for CPU-like devices (80 MiB).
pub const CPU_MEMORY_CEILING: u64 = 10 * 1024 * 1024 * 8;

/// Assumed host RAM when `sys_info` cannot report it.
const FALLBACK_HOST_MEMORY: u64 = 8 << 30;

static HOST_MEMORY: OnceLock<u64> = OnceLock::new();

/// Host RAM in bytes, queried once per process.
pub fn system_memory() -> u64 {
    *HOST_MEMORY.get_or_init(|| match sys_info::mem_info() {
        Ok(info) => info.total.saturating_mul(1024),
        Err(_) => FALLBACK_HOST_MEMORY,
    })
}

/// Engine-wide settings.
///
/// # Example
///
/// ```rust
/// use f3d_compute::EngineConfig;
///
/// let config = EngineConfig::default().with_max_slices(16).with_verbose(true);
/// assert_eq!(config.max_slices, Some(16));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Bytes per voxel per slice when sizing chunks.
    pub sample_footprint: usize,
    /// Slice cap applied to every device.
    pub max_slices: Option<usize>,
    /// Overrides the device-derived memory ceiling.
    pub memory_ceiling: Option<u64>,
    /// Memory ceiling for CPU-like devices.
    pub cpu_memory_ceiling: u64,
    /// Log every chunk at `info` level instead of `debug`.
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_footprint: DEFAULT_SAMPLE_FOOTPRINT,
            max_slices: None,
            memory_ceiling: None,
            cpu_memory_ceiling: CPU_MEMORY_CEILING,
            verbose: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `F3D_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`.
    ///
    /// Unparseable or zero values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| -> Option<u64> {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|&v| v > 0)
        };

        let mut config = Self::default();
        if let Some(mb) = parse("F3D_MEM_MB") {
            config.memory_ceiling = Some(mb.saturating_mul(1024 * 1024));
        }
        if let Some(n) = parse("F3D_MAX_SLICES") {
            config.max_slices = usize::try_from(n).ok();
        }
        if let Some(n) = parse("F3D_SAMPLE_FOOTPRINT") {
            config.sample_footprint = usize::try_from(n).unwrap_or(DEFAULT_SAMPLE_FOOTPRINT);
        }
        if let Some(mb) = parse("F3D_CPU_CEILING_MB") {
            config.cpu_memory_ceiling = mb.saturating_mul(1024 * 1024);
        }
        config
    }

    /// Sets the global slice cap.
    pub fn with_max_slices(mut self, slices: usize) -> Self {
        self.max_slices = Some(slices);
        self
    }

    /// Sets the memory ceiling override in bytes.
    pub fn with_memory_ceiling(mut self, bytes: u64) -> Self {
        self.memory_ceiling = Some(bytes);
        self
    }

    /// Sets the per-voxel footprint.
    pub fn with_sample_footprint(mut self, bytes: usize) -> Self {
        self.sample_footprint = bytes.max(1);
        self
    }

    /// Enables per-chunk logging at `info` level.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Renders a byte count with a binary unit for log fields.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64); 3] = [("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10)];
    match UNITS.iter().find(|&&(_, size)| bytes >= size) {
        Some(&("KB", size)) => format!("{} KB", bytes / size),
        Some(&(unit, size)) => format!("{:.1} {unit}", bytes as f64 / size as f64),
        None => format!("{bytes} B"),
    }
}
