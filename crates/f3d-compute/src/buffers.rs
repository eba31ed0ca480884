//! Per-worker device buffers.
//!
//! A [`BufferSet`] owns the `input`, `output` and optional `temp` buffers a
//! worker streams every chunk through. Stages read `input`, write `output`
//! and commit `output` back into `input`, so after a stage both buffers hold
//! its result. The swap between stages then only decides which handle the
//! next stage writes into. Each buffer holds `chunk_depth + 2 * halo` slices.
//!
//! ```text
//! volume:    ... | halo | range | halo | ...
//!                  ^load_start         ^load_end
//! input:     [ start_offset | range.len() | end_offset ]
//! write_back:               ^^^^^^^^^^^^^
//! ```

use f3d_core::{DepthRange, Volume};
use tracing::trace;

use crate::backend::{BufferHandle, CommandQueue};
use crate::{ComputeError, ComputeResult};

/// Placement of one loaded chunk inside the device buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedChunk {
    /// Slices this chunk is responsible for.
    pub range: DepthRange,
    /// Slices actually loaded, halo included.
    pub window: DepthRange,
    /// Halo slices loaded before `range`; 0 at the volume head.
    pub start_offset: usize,
    /// Halo slices loaded after `range`; 0 at the volume tail.
    pub end_offset: usize,
    /// Samples per row.
    pub width: usize,
    /// Rows per slice.
    pub height: usize,
}

impl LoadedChunk {
    /// Slices resident on the device.
    #[inline]
    pub fn slices(&self) -> usize {
        self.window.len()
    }

    /// Samples per slice.
    #[inline]
    pub fn slice_len(&self) -> usize {
        self.width * self.height
    }

    /// Bytes resident on the device.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.slices() * self.slice_len()
    }
}

/// Input, output and scratch buffers of one worker.
///
/// Buffers are released exactly once: by [`release`](BufferSet::release)
/// or, on any other exit path, by `Drop`.
pub struct BufferSet<'q> {
    queue: &'q mut dyn CommandQueue,
    input: BufferHandle,
    output: BufferHandle,
    temp: Option<BufferHandle>,
    slice_len: usize,
    capacity: usize,
    resident: usize,
    released: bool,
}

impl<'q> BufferSet<'q> {
    /// Allocates buffers of `slices * slice_len` bytes each on `queue`.
    ///
    /// On failure every buffer already allocated is released before the
    /// error is returned.
    pub fn allocate(
        queue: &'q mut dyn CommandQueue,
        slice_len: usize,
        slices: usize,
        needs_temp: bool,
    ) -> ComputeResult<Self> {
        let bytes = slice_len.checked_mul(slices).filter(|&b| b > 0).ok_or_else(|| {
            ComputeError::Configuration(format!(
                "cannot size buffers for {slices} slices of {slice_len} samples"
            ))
        })?;

        let count = if needs_temp { 3 } else { 2 };
        let mut held = Vec::with_capacity(count);
        for _ in 0..count {
            match queue.allocate(bytes) {
                Ok(handle) => held.push(handle),
                Err(e) => {
                    for handle in held {
                        queue.release(handle);
                    }
                    return Err(e);
                }
            }
        }
        trace!(device = %queue.device_info().name, bytes, count, "buffer set allocated");

        Ok(Self {
            input: held[0],
            output: held[1],
            temp: held.get(2).copied(),
            queue,
            slice_len,
            capacity: slices,
            resident: bytes,
            released: false,
        })
    }

    /// Queue the buffers live on.
    pub fn queue(&mut self) -> &mut dyn CommandQueue {
        &mut *self.queue
    }

    /// Current input buffer.
    #[inline]
    pub fn input(&self) -> BufferHandle {
        self.input
    }

    /// Current output buffer.
    #[inline]
    pub fn output(&self) -> BufferHandle {
        self.output
    }

    /// Scratch buffer; fails if the set was allocated without one.
    pub fn temp(&self) -> ComputeResult<BufferHandle> {
        self.temp.ok_or_else(|| {
            ComputeError::Configuration("stage needs a temp buffer but none was allocated".into())
        })
    }

    /// True if a scratch buffer was allocated.
    #[inline]
    pub fn has_temp(&self) -> bool {
        self.temp.is_some()
    }

    /// Slices each buffer can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copies `range` plus up to `halo` slices either side into `input`.
    ///
    /// The halo is clamped to the volume, so the head chunk has no leading
    /// halo and the tail chunk no trailing one.
    pub fn load(&mut self, volume: &Volume, range: DepthRange, halo: usize) -> ComputeResult<LoadedChunk> {
        let dims = volume.dims();
        if !range.is_within(dims.depth) {
            return Err(f3d_core::Error::OutOfBounds {
                start: range.start(),
                end: range.end(),
                depth: dims.depth,
            }
            .into());
        }
        let window = range.expand(halo, dims.depth);
        if window.len() > self.capacity {
            return Err(ComputeError::Configuration(format!(
                "chunk {range} with halo {halo} needs {} slices, buffers hold {}",
                window.len(),
                self.capacity
            )));
        }

        let slab = volume.range_slab(window)?;
        self.queue.write(self.input, 0, slab)?;
        self.resident = slab.len();

        Ok(LoadedChunk {
            range,
            window,
            start_offset: range.start() - window.start(),
            end_offset: window.end() - range.end(),
            width: dims.width,
            height: dims.height,
        })
    }

    /// Exchanges the input and output roles.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.input, &mut self.output);
    }

    /// Exchanges the output and temp roles.
    pub fn swap_output_temp(&mut self) -> ComputeResult<()> {
        let temp = self.temp()?;
        self.temp = Some(self.output);
        self.output = temp;
        Ok(())
    }

    /// Copies the resident part of `output` into `input`.
    pub fn commit(&mut self) -> ComputeResult<()> {
        self.queue.copy(self.output, self.input, self.resident)
    }

    /// Reads back the slices of `chunk.range` from `input`, halo stripped.
    pub fn write_back(&mut self, chunk: &LoadedChunk) -> ComputeResult<Vec<u8>> {
        let mut out = vec![0u8; chunk.range.len() * self.slice_len];
        self.queue
            .read(self.input, chunk.start_offset * self.slice_len, &mut out)?;
        Ok(out)
    }

    /// Releases all buffers.
    pub fn release(mut self) {
        self.free();
    }

    fn free(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.queue.release(self.input);
        self.queue.release(self.output);
        if let Some(temp) = self.temp.take() {
            self.queue.release(temp);
        }
    }
}

impl Drop for BufferSet<'_> {
    fn drop(&mut self) {
        self.free();
    }
}

impl std::fmt::Debug for BufferSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSet")
            .field("input", &self.input)
            .field("output", &self.output)
            .field("temp", &self.temp)
            .field("capacity", &self.capacity)
            .field("released", &self.released)
            .finish()
    }
}
