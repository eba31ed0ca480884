//! Host-memory device runtime.
//!
//! Buffers live in ordinary `Vec<u8>`s, programs are looked up by name in a
//! static registry of Rust kernels and each dispatch runs synchronously,
//! parallelised with rayon.
//!
//! Buffer accounting is shared by every queue of a device so tests can
//! assert that a run released everything it allocated.

mod kernels;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{trace, warn};

use super::{BufferHandle, CommandQueue, ComputeDevice, DeviceInfo, DeviceKind, KernelArg, ProgramHandle, WorkGroup};
use crate::config::system_memory;
use crate::{ComputeError, ComputeResult};

use kernels::{Invocation, Program, find_program};

/// Largest work-group reported by the host runtime.
const CPU_WORK_GROUP: usize = 1024;

#[derive(Debug, Default)]
struct Counters {
    live: AtomicUsize,
    bytes: AtomicU64,
    leaked: AtomicUsize,
    stale_releases: AtomicUsize,
}

/// The host processor as a compute device.
#[derive(Debug, Clone)]
pub struct CpuDevice {
    info: DeviceInfo,
    counters: Arc<Counters>,
}

impl CpuDevice {
    /// Host device sized from system memory.
    pub fn new() -> Self {
        Self::named("CPU")
    }

    /// Host device with a custom label.
    pub fn named(name: impl Into<String>) -> Self {
        let total = system_memory();
        Self::with_info(DeviceInfo {
            name: name.into(),
            kind: DeviceKind::Cpu,
            global_mem: total,
            max_mem_alloc: total / 4,
            max_work_group_size: CPU_WORK_GROUP,
            available: true,
        })
    }

    /// Host runtime reporting caller-supplied capabilities.
    ///
    /// Useful to emulate a GPU-class memory budget while kernels still run
    /// on the host.
    pub fn with_info(info: DeviceInfo) -> Self {
        Self {
            info,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Buffers currently allocated across all queues of this device.
    pub fn live_buffers(&self) -> usize {
        self.counters.live.load(Ordering::Acquire)
    }

    /// Bytes currently allocated across all queues of this device.
    pub fn live_bytes(&self) -> u64 {
        self.counters.bytes.load(Ordering::Acquire)
    }

    /// Buffers a queue still held when it was dropped.
    pub fn leaked_buffers(&self) -> usize {
        self.counters.leaked.load(Ordering::Acquire)
    }

    /// Release calls for buffers that were not live.
    pub fn stale_releases(&self) -> usize {
        self.counters.stale_releases.load(Ordering::Acquire)
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeDevice for CpuDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_queue(&self) -> ComputeResult<Box<dyn CommandQueue>> {
        Ok(Box::new(CpuQueue {
            info: self.info.clone(),
            counters: Arc::clone(&self.counters),
            buffers: HashMap::new(),
            programs: HashMap::new(),
            next_id: 1,
        }))
    }
}

/// Execution queue of a [`CpuDevice`].
struct CpuQueue {
    info: DeviceInfo,
    counters: Arc<Counters>,
    buffers: HashMap<u64, Vec<u8>>,
    programs: HashMap<u64, &'static Program>,
    next_id: u64,
}

impl CpuQueue {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, handle: BufferHandle) -> ComputeResult<&Vec<u8>> {
        self.buffers
            .get(&handle.id())
            .ok_or_else(|| ComputeError::Dispatch(format!("unknown buffer #{}", handle.id())))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> ComputeResult<&mut Vec<u8>> {
        self.buffers
            .get_mut(&handle.id())
            .ok_or_else(|| ComputeError::Dispatch(format!("unknown buffer #{}", handle.id())))
    }
}

fn span(offset: usize, len: usize, size: usize) -> ComputeResult<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(ComputeError::Dispatch(format!(
            "transfer of {len} bytes at offset {offset} exceeds buffer of {size} bytes"
        ))),
    }
}

impl CommandQueue for CpuQueue {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&mut self, len: usize) -> ComputeResult<BufferHandle> {
        let requested = len as u64;
        if requested > self.info.max_mem_alloc {
            return Err(ComputeError::Allocation {
                requested,
                reason: format!("exceeds max allocation of {} bytes", self.info.max_mem_alloc),
            });
        }
        let before = self.counters.bytes.fetch_add(requested, Ordering::AcqRel);
        if before.saturating_add(requested) > self.info.global_mem {
            self.counters.bytes.fetch_sub(requested, Ordering::AcqRel);
            return Err(ComputeError::Allocation {
                requested,
                reason: format!("device memory exhausted ({} bytes in use)", before),
            });
        }

        let id = self.next_id();
        self.buffers.insert(id, vec![0; len]);
        self.counters.live.fetch_add(1, Ordering::AcqRel);
        trace!(device = %self.info.name, id, len, "allocate");
        Ok(BufferHandle::new(id, len))
    }

    fn write(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]) -> ComputeResult<()> {
        let dst = self.buffer_mut(buffer)?;
        let range = span(offset, data.len(), dst.len())?;
        dst[range].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, buffer: BufferHandle, offset: usize, out: &mut [u8]) -> ComputeResult<()> {
        let src = self.buffer(buffer)?;
        let range = span(offset, out.len(), src.len())?;
        out.copy_from_slice(&src[range]);
        Ok(())
    }

    fn copy(&mut self, src: BufferHandle, dst: BufferHandle, len: usize) -> ComputeResult<()> {
        if src.id() == dst.id() {
            return Ok(());
        }
        // Take the destination out so both can be borrowed.
        let mut target = std::mem::take(self.buffer_mut(dst)?);
        let result = self.buffer(src).and_then(|source| {
            let from = span(0, len, source.len())?;
            let to = span(0, len, target.len())?;
            target[to].copy_from_slice(&source[from]);
            Ok(())
        });
        self.buffers.insert(dst.id(), target);
        result
    }

    fn build_program(&mut self, name: &str) -> ComputeResult<ProgramHandle> {
        let program = find_program(name).ok_or_else(|| ComputeError::Compilation {
            program: name.to_string(),
            reason: "no such program in the host runtime".into(),
        })?;
        let id = self.next_id();
        self.programs.insert(id, program);
        trace!(device = %self.info.name, program = name, "build program");
        Ok(ProgramHandle::new(id, name))
    }

    fn release_program(&mut self, program: ProgramHandle) {
        if self.programs.remove(&program.id()).is_none() {
            warn!(device = %self.info.name, program = program.name(), "release of unknown program");
        }
    }

    fn dispatch(
        &mut self,
        program: &ProgramHandle,
        kernel: &str,
        args: &[KernelArg],
        range: &WorkGroup,
    ) -> ComputeResult<()> {
        let entry = self.programs.get(&program.id()).ok_or_else(|| {
            ComputeError::Dispatch(format!("program '{}' is not built on this queue", program.name()))
        })?;
        let kernel_fn = entry.kernel(kernel).ok_or_else(|| {
            ComputeError::Dispatch(format!("program '{}' has no kernel '{kernel}'", program.name()))
        })?;
        if !range.is_aligned() {
            return Err(ComputeError::Dispatch(format!(
                "global size {:?} is not a multiple of local size {:?}",
                range.global, range.local
            )));
        }

        let mut seen = Vec::new();
        for (index, arg) in args.iter().enumerate() {
            if let KernelArg::Buffer(handle) = arg {
                if seen.contains(&handle.id()) {
                    return Err(ComputeError::Dispatch(format!(
                        "buffer #{} bound twice (argument {index})",
                        handle.id()
                    )));
                }
                self.buffer(*handle)?;
                seen.push(handle.id());
            }
        }

        let slots = args
            .iter()
            .map(|arg| match arg {
                KernelArg::Buffer(handle) => self.buffers.remove(&handle.id()).unwrap_or_default(),
                _ => Vec::new(),
            })
            .collect();
        let mut invocation = Invocation::new(args, slots, *range);
        let result = kernel_fn(&mut invocation);
        for (arg, slot) in args.iter().zip(invocation.into_slots()) {
            if let KernelArg::Buffer(handle) = arg {
                self.buffers.insert(handle.id(), slot);
            }
        }
        trace!(device = %self.info.name, program = program.name(), kernel, ok = result.is_ok(), "dispatch");
        result
    }

    fn finish(&mut self) -> ComputeResult<()> {
        // Dispatches complete before returning.
        Ok(())
    }

    fn release(&mut self, buffer: BufferHandle) {
        match self.buffers.remove(&buffer.id()) {
            Some(data) => {
                self.counters.live.fetch_sub(1, Ordering::AcqRel);
                self.counters.bytes.fetch_sub(data.len() as u64, Ordering::AcqRel);
            }
            None => {
                self.counters.stale_releases.fetch_add(1, Ordering::AcqRel);
                warn!(device = %self.info.name, id = buffer.id(), "release of unknown buffer");
            }
        }
    }
}

impl Drop for CpuQueue {
    fn drop(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        warn!(device = %self.info.name, count = self.buffers.len(), "queue dropped with live buffers");
        for (_, data) in self.buffers.drain() {
            self.counters.live.fetch_sub(1, Ordering::AcqRel);
            self.counters.bytes.fetch_sub(data.len() as u64, Ordering::AcqRel);
            self.counters.leaked.fetch_add(1, Ordering::AcqRel);
        }
    }
}
