//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use f3d_compute::backend::{CommandQueue, ComputeDevice, DeviceInfo};
use f3d_compute::{ComputeResult, CpuDevice, DeviceSet};
use f3d_core::{Volume, VolumeDims};

/// Deterministic pseudo-random volume.
pub fn noise(dims: VolumeDims, seed: u32) -> Volume {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    Volume::from_fn(dims, |_, _, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        (state >> 24) as u8
    })
    .unwrap()
}

/// Binary volume with roughly `percent` of the voxels set to 255.
pub fn binary(dims: VolumeDims, seed: u32, percent: u8) -> Volume {
    let src = noise(dims, seed);
    let data = src
        .data()
        .iter()
        .map(|&v| if (v as u32 * 100 / 256) < percent as u32 { 255 } else { 0 })
        .collect();
    Volume::new(dims, data).unwrap()
}

/// Host devices named `CPU-0`, `CPU-1`, ... with the given caps.
pub fn capped_cpus(caps: &[usize]) -> (Vec<Arc<CpuDevice>>, DeviceSet) {
    let devices: Vec<Arc<CpuDevice>> = (0..caps.len())
        .map(|i| Arc::new(CpuDevice::named(format!("CPU-{i}"))))
        .collect();
    let set = DeviceSet::Capped(
        devices
            .iter()
            .zip(caps)
            .map(|(d, &cap)| (Arc::clone(d) as Arc<dyn ComputeDevice>, cap))
            .collect(),
    );
    (devices, set)
}

/// Asserts every device released everything it allocated exactly once.
pub fn assert_clean(devices: &[Arc<CpuDevice>]) {
    for device in devices {
        assert_eq!(device.live_buffers(), 0, "live buffers on {}", device.info().name);
        assert_eq!(device.live_bytes(), 0, "live bytes on {}", device.info().name);
        assert_eq!(device.leaked_buffers(), 0, "leaked buffers on {}", device.info().name);
        assert_eq!(device.stale_releases(), 0, "double releases on {}", device.info().name);
    }
}

/// Host device that counts the queues created on it.
pub struct CountingDevice {
    pub inner: CpuDevice,
    pub queues: AtomicUsize,
}

impl CountingDevice {
    pub fn new() -> Self {
        Self {
            inner: CpuDevice::named("CPU-counting"),
            queues: AtomicUsize::new(0),
        }
    }

    pub fn queues(&self) -> usize {
        self.queues.load(Ordering::Acquire)
    }
}

impl ComputeDevice for CountingDevice {
    fn info(&self) -> &DeviceInfo {
        self.inner.info()
    }

    fn create_queue(&self) -> ComputeResult<Box<dyn CommandQueue>> {
        self.queues.fetch_add(1, Ordering::AcqRel);
        self.inner.create_queue()
    }
}
