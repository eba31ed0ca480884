//! Compute devices and their command queues.
//!
//! The engine talks to a device only through [`ComputeDevice`] and
//! [`CommandQueue`]: create a queue, allocate buffers, copy host <-> device,
//! build a program by name, dispatch a named kernel over a work range, wait
//! for the queue to drain and release buffers.
//!
//! # Architecture
//!
//! ```text
//! DeviceSet ──> resolve() ──> Vec<DeviceSlot { device, cap }>
//!                                   │
//!                                   └── ComputeDevice
//!                                           └── CommandQueue (one per worker)
//!                                                   +-- CpuQueue (rayon kernels)
//! ```
//!
//! Only the host-memory CPU runtime ships with this crate. GPU runtimes plug
//! in by implementing the two traits.

mod budget;
mod cpu;

use std::fmt;
use std::sync::Arc;

pub use budget::{DeviceBudget, WorkGroup, round_up};
pub use cpu::CpuDevice;

use crate::{ComputeError, ComputeResult};

/// Broad device class, used for memory budgeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceKind {
    /// Host processor. Shares ordinary process memory.
    #[default]
    Cpu,
    /// Discrete or integrated GPU.
    Gpu,
    /// Any other accelerator.
    Accelerator,
}

impl DeviceKind {
    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Accelerator => "accelerator",
        }
    }
}

/// Capabilities reported by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Label used in logs and result chunks.
    pub name: String,
    /// Device class.
    pub kind: DeviceKind,
    /// Total device memory in bytes.
    pub global_mem: u64,
    /// Largest single allocation in bytes.
    pub max_mem_alloc: u64,
    /// Largest work-group the device accepts.
    pub max_work_group_size: usize,
    /// Whether the device can run work right now.
    pub available: bool,
}

impl DeviceInfo {
    /// True for devices that draw from ordinary process memory.
    #[inline]
    pub fn is_cpu_like(&self) -> bool {
        self.kind == DeviceKind::Cpu || self.name.contains("CPU")
    }
}

/// Opaque handle to a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    id: u64,
    len: usize,
}

impl BufferHandle {
    /// Creates a handle; used by device runtimes.
    pub fn new(id: u64, len: usize) -> Self {
        Self { id, len }
    }

    /// Runtime-specific identifier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-sized buffers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Handle to a program built on a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramHandle {
    id: u64,
    name: String,
}

impl ProgramHandle {
    /// Creates a handle; used by device runtimes.
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }

    /// Runtime-specific identifier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Program name it was built from.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Argument bound to a kernel slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    /// Device buffer.
    Buffer(BufferHandle),
    /// 32-bit signed integer.
    Int(i32),
    /// 32-bit float.
    Float(f32),
}

impl KernelArg {
    /// Integer argument from a size, failing on overflow.
    pub fn size(value: usize) -> ComputeResult<Self> {
        i32::try_from(value)
            .map(KernelArg::Int)
            .map_err(|_| ComputeError::Dispatch(format!("kernel argument {value} exceeds i32")))
    }
}

/// A compute device.
pub trait ComputeDevice: Send + Sync {
    /// Device capabilities.
    fn info(&self) -> &DeviceInfo;

    /// Creates an execution queue owned by one worker.
    fn create_queue(&self) -> ComputeResult<Box<dyn CommandQueue>>;
}

/// In-order execution queue on one device.
///
/// Every call is synchronous from the caller's point of view once
/// [`finish`](CommandQueue::finish) returns.
pub trait CommandQueue: Send {
    /// Capabilities of the owning device.
    fn device_info(&self) -> &DeviceInfo;

    /// Allocates a zeroed buffer of `len` bytes.
    fn allocate(&mut self, len: usize) -> ComputeResult<BufferHandle>;

    /// Copies host bytes into `buffer` at `offset`.
    fn write(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]) -> ComputeResult<()>;

    /// Copies `out.len()` bytes from `buffer` at `offset` to the host.
    fn read(&mut self, buffer: BufferHandle, offset: usize, out: &mut [u8]) -> ComputeResult<()>;

    /// Device-side copy of the first `len` bytes of `src` into `dst`.
    fn copy(&mut self, src: BufferHandle, dst: BufferHandle, len: usize) -> ComputeResult<()>;

    /// Builds the named program.
    fn build_program(&mut self, name: &str) -> ComputeResult<ProgramHandle>;

    /// Releases a program built on this queue.
    fn release_program(&mut self, program: ProgramHandle);

    /// Enqueues `kernel` from `program` over `range` with `args` bound in order.
    fn dispatch(
        &mut self,
        program: &ProgramHandle,
        kernel: &str,
        args: &[KernelArg],
        range: &WorkGroup,
    ) -> ComputeResult<()>;

    /// Blocks until all enqueued work has completed.
    fn finish(&mut self) -> ComputeResult<()>;

    /// Frees a buffer.
    fn release(&mut self, buffer: BufferHandle);
}

/// A device paired with an optional slice cap.
#[derive(Clone)]
pub struct DeviceSlot {
    /// The device.
    pub device: Arc<dyn ComputeDevice>,
    /// Upper bound on slices per chunk for this device.
    pub cap: Option<usize>,
}

impl fmt::Debug for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSlot")
            .field("device", &self.device.info().name)
            .field("cap", &self.cap)
            .finish()
    }
}

/// Devices participating in a run.
#[derive(Clone)]
pub enum DeviceSet {
    /// One device.
    Single(Arc<dyn ComputeDevice>),
    /// Several devices sharing work equally.
    List(Vec<Arc<dyn ComputeDevice>>),
    /// Devices with per-device slice caps for proportional sharing.
    Capped(Vec<(Arc<dyn ComputeDevice>, usize)>),
}

impl DeviceSet {
    /// The host CPU as a single device.
    pub fn cpu() -> Self {
        Self::Single(Arc::new(CpuDevice::new()))
    }

    /// Validates the set and flattens it to worker slots.
    ///
    /// Fails with [`ComputeError::Configuration`] on an empty set, an
    /// unavailable device or a zero cap.
    pub fn resolve(&self) -> ComputeResult<Vec<DeviceSlot>> {
        let slots: Vec<DeviceSlot> = match self {
            Self::Single(device) => vec![DeviceSlot { device: Arc::clone(device), cap: None }],
            Self::List(devices) => devices
                .iter()
                .map(|d| DeviceSlot { device: Arc::clone(d), cap: None })
                .collect(),
            Self::Capped(devices) => devices
                .iter()
                .map(|(d, cap)| DeviceSlot { device: Arc::clone(d), cap: Some(*cap) })
                .collect(),
        };

        if slots.is_empty() {
            return Err(ComputeError::Configuration("device set is empty".into()));
        }
        for slot in &slots {
            let info = slot.device.info();
            if !info.available {
                return Err(ComputeError::Configuration(format!(
                    "device '{}' is not available",
                    info.name
                )));
            }
            if slot.cap == Some(0) {
                return Err(ComputeError::Configuration(format!(
                    "device '{}' has a zero slice cap",
                    info.name
                )));
            }
        }
        Ok(slots)
    }

    /// Number of devices in the set.
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::List(d) => d.len(),
            Self::Capped(d) => d.len(),
        }
    }

    /// True for an empty list.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Arc<dyn ComputeDevice>> for DeviceSet {
    fn from(device: Arc<dyn ComputeDevice>) -> Self {
        Self::Single(device)
    }
}

impl fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolve() {
            Ok(slots) => f.debug_list().entries(slots.iter()).finish(),
            Err(_) => write!(f, "DeviceSet(<invalid, {} entries>)", self.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(name: &str) -> Arc<dyn ComputeDevice> {
        Arc::new(CpuDevice::named(name))
    }

    #[test]
    fn test_resolve_list_and_caps() {
        let set = DeviceSet::List(vec![cpu("a"), cpu("b")]);
        let slots = set.resolve().unwrap();
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(|s| s.cap.is_none()));

        let set = DeviceSet::Capped(vec![(cpu("a"), 10), (cpu("b"), 100)]);
        let caps: Vec<_> = set.resolve().unwrap().iter().map(|s| s.cap).collect();
        assert_eq!(caps, vec![Some(10), Some(100)]);
    }

    #[test]
    fn test_resolve_rejects_bad_sets() {
        assert!(matches!(
            DeviceSet::List(vec![]).resolve(),
            Err(ComputeError::Configuration(_))
        ));
        assert!(matches!(
            DeviceSet::Capped(vec![(cpu("a"), 0)]).resolve(),
            Err(ComputeError::Configuration(_))
        ));

        let mut info = CpuDevice::named("offline").info().clone();
        info.available = false;
        let offline: Arc<dyn ComputeDevice> = Arc::new(CpuDevice::with_info(info));
        assert!(matches!(
            DeviceSet::Single(offline).resolve(),
            Err(ComputeError::Configuration(_))
        ));
    }

    #[test]
    fn test_kernel_arg_size() {
        assert_eq!(KernelArg::size(7).unwrap(), KernelArg::Int(7));
        assert!(KernelArg::size(usize::MAX).is_err());
    }
}
