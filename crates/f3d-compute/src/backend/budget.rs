//! Device memory budgeting and work-group sizing.
//!
//! A chunk of `n` slices costs `width * height * n * footprint` bytes on the
//! device, where the footprint covers the input, output and scratch buffers
//! plus driver overhead. [`DeviceBudget`] turns a device's reported memory
//! into the largest `n` that fits.
//!
//! # Example
//!
//! ```rust
//! use f3d_compute::backend::{CpuDevice, ComputeDevice, DeviceBudget};
//! use f3d_core::VolumeDims;
//!
//! let device = CpuDevice::new();
//! let budget = DeviceBudget::default();
//! let depth = budget.max_chunk_depth(device.info(), VolumeDims::new(100, 64, 64), Some(10));
//! assert!(depth >= 1 && depth <= 10);
//! ```

use f3d_core::VolumeDims;

use super::DeviceInfo;
use crate::config::{CPU_MEMORY_CEILING, DEFAULT_SAMPLE_FOOTPRINT, EngineConfig};

/// Fraction of the largest allocation a chunk may occupy.
const ALLOC_FRACTION: f64 = 0.5;

/// Upper bound on the tile edge of a 2-D work-group.
const MAX_TILE_EDGE: usize = 16;

/// Chunk-depth calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBudget {
    /// Bytes per voxel per chunk slice.
    pub sample_footprint: usize,
    /// Overrides the device-derived memory ceiling when set.
    pub memory_override: Option<u64>,
    /// Ceiling applied to CPU-like devices.
    pub cpu_ceiling: u64,
    /// Slice cap applied to every device.
    pub global_cap: Option<usize>,
}

impl Default for DeviceBudget {
    fn default() -> Self {
        Self {
            sample_footprint: DEFAULT_SAMPLE_FOOTPRINT,
            memory_override: None,
            cpu_ceiling: CPU_MEMORY_CEILING,
            global_cap: None,
        }
    }
}

impl DeviceBudget {
    /// Budget parameters taken from an engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            sample_footprint: config.sample_footprint,
            memory_override: config.memory_ceiling,
            cpu_ceiling: config.cpu_memory_ceiling,
            global_cap: config.max_slices,
        }
    }

    /// Bytes a single chunk may occupy on `info`.
    ///
    /// The override replaces the device-derived value; CPU-like devices are
    /// clamped to `cpu_ceiling` either way.
    pub fn memory_ceiling(&self, info: &DeviceInfo) -> u64 {
        let ceiling = self.memory_override.unwrap_or_else(|| {
            let alloc = (info.max_mem_alloc as f64 * ALLOC_FRACTION) as u64;
            alloc.min((isize::MAX as u64) >> 1)
        });
        if info.is_cpu_like() {
            ceiling.min(self.cpu_ceiling)
        } else {
            ceiling
        }
    }

    /// Largest chunk depth (in slices) the device can hold.
    ///
    /// Returns 0 only when a slice is empty (`width * height == 0`).
    /// Otherwise the result lies in `[1, depth]` and never exceeds `cap` or
    /// the global cap.
    pub fn max_chunk_depth(&self, info: &DeviceInfo, dims: VolumeDims, cap: Option<usize>) -> usize {
        Self::chunk_depth_for(
            self.memory_ceiling(info),
            dims,
            self.sample_footprint,
            min_cap(cap, self.global_cap),
        )
    }

    /// Core formula: `floor(ceiling / (w * h * footprint))` clamped to
    /// `[1, depth]`, then limited by `cap`.
    pub fn chunk_depth_for(ceiling: u64, dims: VolumeDims, footprint: usize, cap: Option<usize>) -> usize {
        let plane = dims.slice_len() as u64;
        if plane == 0 {
            return 0;
        }
        let per_slice = plane.saturating_mul(footprint.max(1) as u64);
        let fit = usize::try_from(ceiling / per_slice).unwrap_or(usize::MAX);
        let slices = fit.clamp(1, dims.depth.max(1));
        match cap {
            Some(cap) if cap < slices => cap.max(1),
            _ => slices,
        }
    }
}

fn min_cap(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Rounds `global` up to the next multiple of `group`.
#[inline]
pub fn round_up(group: usize, global: usize) -> usize {
    if group == 0 {
        return global;
    }
    global.div_ceil(group) * group
}

/// Global and local work sizes for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGroup {
    /// Number of axes in use (1 or 2).
    pub dims: usize,
    /// Global size per axis; unused axes are 1.
    pub global: [usize; 2],
    /// Local size per axis; unused axes are 1.
    pub local: [usize; 2],
}

impl WorkGroup {
    /// Sizes a dispatch over `extent` on `info`.
    ///
    /// A 3-element extent `[w, h, d]` gives a 1-D range of `w * h * d`
    /// items with `local = max_work_group_size`. A 2-element extent `[w, h]`
    /// gives a 2-D range with square tiles of edge
    /// `min(sqrt(max_work_group_size), 16)`. Returns `None` for zero extents,
    /// a zero work-group capability or other extent lengths.
    pub fn compute(info: &DeviceInfo, extent: &[usize]) -> Option<Self> {
        if info.max_work_group_size == 0 || extent.iter().any(|&e| e == 0) {
            return None;
        }
        match *extent {
            [w, h, d] => {
                let local = info.max_work_group_size;
                let items = w.checked_mul(h)?.checked_mul(d)?;
                Some(Self {
                    dims: 1,
                    global: [round_up(local, items), 1],
                    local: [local, 1],
                })
            }
            [w, h] => {
                let edge = ((info.max_work_group_size as f64).sqrt() as usize).clamp(1, MAX_TILE_EDGE);
                Some(Self {
                    dims: 2,
                    global: [round_up(edge, w), round_up(edge, h)],
                    local: [edge, edge],
                })
            }
            _ => None,
        }
    }

    /// Total work items.
    #[inline]
    pub fn items(&self) -> usize {
        self.global[0] * self.global[1]
    }

    /// True if every global axis is a multiple of its local axis.
    pub fn is_aligned(&self) -> bool {
        self.global
            .iter()
            .zip(self.local.iter())
            .all(|(&g, &l)| l > 0 && g % l == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceKind;

    fn device(kind: DeviceKind, max_alloc: u64, wg: usize) -> DeviceInfo {
        DeviceInfo {
            name: "test".into(),
            kind,
            global_mem: max_alloc * 4,
            max_mem_alloc: max_alloc,
            max_work_group_size: wg,
            available: true,
        }
    }

    #[test]
    fn test_cpu_ceiling_clamps() {
        let budget = DeviceBudget::default();
        let cpu = device(DeviceKind::Cpu, 1 << 40, 256);
        assert_eq!(budget.memory_ceiling(&cpu), CPU_MEMORY_CEILING);

        let gpu = device(DeviceKind::Gpu, 1 << 30, 256);
        assert_eq!(budget.memory_ceiling(&gpu), 1 << 29);
    }

    #[test]
    fn test_chunk_depth_formula() {
        let dims = VolumeDims::new(1000, 100, 100);
        // 10_000 voxels * 8 bytes = 80_000 bytes per slice
        assert_eq!(DeviceBudget::chunk_depth_for(800_000, dims, 8, None), 10);
        // Never below one slice
        assert_eq!(DeviceBudget::chunk_depth_for(10, dims, 8, None), 1);
        // Never above depth
        assert_eq!(DeviceBudget::chunk_depth_for(u64::MAX, dims, 8, None), 1000);
        // Cap wins when smaller
        assert_eq!(DeviceBudget::chunk_depth_for(800_000, dims, 8, Some(3)), 3);
        assert_eq!(DeviceBudget::chunk_depth_for(800_000, dims, 8, Some(30)), 10);
    }

    #[test]
    fn test_empty_plane_gives_zero() {
        let dims = VolumeDims::new(10, 0, 100);
        assert_eq!(DeviceBudget::chunk_depth_for(1 << 30, dims, 8, None), 0);
    }

    #[test]
    fn test_global_and_device_caps_combine() {
        let budget = DeviceBudget {
            global_cap: Some(5),
            ..DeviceBudget::default()
        };
        let gpu = device(DeviceKind::Gpu, 1 << 30, 256);
        let dims = VolumeDims::new(100, 16, 16);
        assert_eq!(budget.max_chunk_depth(&gpu, dims, None), 5);
        assert_eq!(budget.max_chunk_depth(&gpu, dims, Some(2)), 2);
        assert_eq!(budget.max_chunk_depth(&gpu, dims, Some(50)), 5);
    }

    #[test]
    fn test_memory_override() {
        let budget = DeviceBudget {
            memory_override: Some(16 * 16 * 8 * 4),
            ..DeviceBudget::default()
        };
        let gpu = device(DeviceKind::Gpu, 1 << 30, 256);
        assert_eq!(budget.max_chunk_depth(&gpu, VolumeDims::new(100, 16, 16), None), 4);
    }

    #[test]
    fn test_memory_override_still_clamped_on_cpu() {
        let budget = DeviceBudget {
            memory_override: Some(1 << 34),
            ..DeviceBudget::default()
        };
        let cpu = device(DeviceKind::Cpu, 1 << 40, 256);
        assert_eq!(budget.memory_ceiling(&cpu), CPU_MEMORY_CEILING);

        let gpu = device(DeviceKind::Gpu, 1 << 30, 256);
        assert_eq!(budget.memory_ceiling(&gpu), 1 << 34);

        let small = DeviceBudget {
            memory_override: Some(1 << 20),
            ..DeviceBudget::default()
        };
        assert_eq!(small.memory_ceiling(&cpu), 1 << 20);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(16, 100), 112);
        assert_eq!(round_up(16, 96), 96);
        assert_eq!(round_up(1, 7), 7);
        assert_eq!(round_up(0, 7), 7);
    }

    #[test]
    fn test_work_group_linear() {
        let info = device(DeviceKind::Gpu, 1 << 30, 256);
        let wg = WorkGroup::compute(&info, &[10, 10, 3]).unwrap();
        assert_eq!(wg.dims, 1);
        assert_eq!(wg.local, [256, 1]);
        assert_eq!(wg.global, [512, 1]);
        assert!(wg.is_aligned());
    }

    #[test]
    fn test_work_group_planar() {
        let info = device(DeviceKind::Gpu, 1 << 30, 1024);
        let wg = WorkGroup::compute(&info, &[100, 20]).unwrap();
        assert_eq!(wg.local, [16, 16]);
        assert_eq!(wg.global, [112, 32]);

        let small = device(DeviceKind::Gpu, 1 << 30, 64);
        let wg = WorkGroup::compute(&small, &[100, 20]).unwrap();
        assert_eq!(wg.local, [8, 8]);
        assert_eq!(wg.global, [104, 24]);
    }

    #[test]
    fn test_work_group_rejects_degenerate() {
        let info = device(DeviceKind::Gpu, 1 << 30, 256);
        assert!(WorkGroup::compute(&info, &[0, 10]).is_none());
        assert!(WorkGroup::compute(&info, &[10]).is_none());
        let none = device(DeviceKind::Gpu, 1 << 30, 0);
        assert!(WorkGroup::compute(&none, &[10, 10]).is_none());
    }
}
