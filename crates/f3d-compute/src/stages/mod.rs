//! Filter stages.
//!
//! A pipeline is an ordered list of [`FilterStage`]s. For every chunk the
//! worker runs each stage on its [`BufferSet`]: a stage reads `input`,
//! writes `output` and finishes by committing `output` back into `input`,
//! so `input` always holds the latest result.
//!
//! # Available Stages
//!
//! | stage       | overlap (z)          | temp buffer |
//! |-------------|----------------------|-------------|
//! | [`Median`]    | 4                  | no  |
//! | [`Bilateral`] | spatial radius     | no  |
//! | [`Fft`]       | 0                  | yes |
//! | [`MaskApply`] | 0                  | no  |
//! | [`Dilate`] / [`Erode`] | mask overlap | yes |
//! | [`Open`] / [`Close`]   | twice the mask overlap | yes |
//! | [`Identity`]  | 0                  | no  |

mod bilateral;
mod config;
mod fft;
mod identity;
mod mask;
mod median;
mod morphology;

pub use bilateral::Bilateral;
pub use config::{PipelineConfig, StageConfig};
pub use fft::{Direction, Fft};
pub use identity::Identity;
pub use mask::MaskApply;
pub use median::Median;
pub use morphology::{Close, Dilate, Erode, Open};

use f3d_core::VolumeDims;

use crate::backend::{CommandQueue, KernelArg, ProgramHandle, WorkGroup};
use crate::buffers::{BufferSet, LoadedChunk};
use crate::{ComputeError, ComputeResult};

/// Halo and scratch requirements of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageInfo {
    /// Neighbours read along x.
    pub overlap_x: usize,
    /// Neighbours read along y.
    pub overlap_y: usize,
    /// Slices read beyond a chunk along z; sizes the halo.
    pub overlap_z: usize,
    /// Whether the stage needs the scratch buffer.
    pub needs_temp: bool,
}

impl StageInfo {
    /// Same overlap on every axis.
    pub const fn uniform(overlap: usize, needs_temp: bool) -> Self {
        Self {
            overlap_x: overlap,
            overlap_y: overlap,
            overlap_z: overlap,
            needs_temp,
        }
    }
}

/// A filter applied to every chunk of a volume.
pub trait FilterStage: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Overlap and scratch requirements.
    fn info(&self) -> StageInfo;

    /// True when the stage holds per-device state (built programs, uploaded
    /// tables) and must be cloned for each worker.
    fn is_stateful(&self) -> bool {
        true
    }

    /// Checks parameters against the volume before any worker starts.
    fn validate(&self, dims: VolumeDims) -> ComputeResult<()> {
        let _ = dims;
        Ok(())
    }

    /// Builds device programs on `queue`.
    fn load_program(&mut self, queue: &mut dyn CommandQueue) -> ComputeResult<()>;

    /// Filters the chunk resident in `buffers`, leaving the result in `input`.
    fn run(&self, buffers: &mut BufferSet<'_>, chunk: &LoadedChunk) -> ComputeResult<()>;

    /// Releases what [`load_program`](FilterStage::load_program) built.
    fn release_program(&mut self, queue: &mut dyn CommandQueue);

    /// Fresh copy of the stage with no device state.
    fn clone_stage(&self) -> Box<dyn FilterStage>;

    /// Serializable description, if the stage has one.
    fn to_config(&self) -> Option<StageConfig> {
        None
    }
}

/// Largest `overlap_z` of a pipeline; the halo each chunk is loaded with.
pub fn max_overlap(pipeline: &[Box<dyn FilterStage>]) -> usize {
    pipeline.iter().map(|s| s.info().overlap_z).max().unwrap_or(0)
}

/// True if any stage needs the scratch buffer.
pub fn needs_temp(pipeline: &[Box<dyn FilterStage>]) -> bool {
    pipeline.iter().any(|s| s.info().needs_temp)
}

/// A program built by name on a worker's queue.
///
/// Cloning yields an unloaded slot, so clones never share device state.
#[derive(Debug)]
pub(crate) struct ProgramSlot {
    name: &'static str,
    handle: Option<ProgramHandle>,
}

impl Clone for ProgramSlot {
    fn clone(&self) -> Self {
        Self::new(self.name)
    }
}

impl ProgramSlot {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self { name, handle: None }
    }

    pub(crate) fn load(&mut self, queue: &mut dyn CommandQueue) -> ComputeResult<()> {
        if self.handle.is_none() {
            self.handle = Some(queue.build_program(self.name)?);
        }
        Ok(())
    }

    pub(crate) fn release(&mut self, queue: &mut dyn CommandQueue) {
        if let Some(handle) = self.handle.take() {
            queue.release_program(handle);
        }
    }

    pub(crate) fn get(&self) -> ComputeResult<&ProgramHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| ComputeError::Dispatch(format!("program '{}' is not loaded", self.name)))
    }
}

/// `width, height, slices` of a chunk as kernel arguments.
pub(crate) fn extent_args(chunk: &LoadedChunk) -> ComputeResult<[KernelArg; 3]> {
    Ok([
        KernelArg::size(chunk.width)?,
        KernelArg::size(chunk.height)?,
        KernelArg::size(chunk.slices())?,
    ])
}

/// Dispatches `kernel` over the chunk's slice plane and waits for it.
pub(crate) fn dispatch(
    buffers: &mut BufferSet<'_>,
    program: &ProgramHandle,
    kernel: &str,
    args: &[KernelArg],
    chunk: &LoadedChunk,
) -> ComputeResult<()> {
    let queue = buffers.queue();
    let range = WorkGroup::compute(queue.device_info(), &[chunk.width, chunk.height]).ok_or_else(|| {
        ComputeError::Dispatch(format!(
            "no work range for a {}x{} slice on '{}'",
            chunk.width,
            chunk.height,
            queue.device_info().name
        ))
    })?;
    queue.dispatch(program, kernel, args, &range)?;
    queue.finish()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers to run one stage over a whole volume on the host runtime.

    use super::*;
    use crate::backend::{ComputeDevice, CpuDevice};
    use f3d_core::{DepthRange, Volume};

    /// Runs `stage` over `volume` as one chunk and returns the result.
    pub(crate) fn run_whole(stage: &mut dyn FilterStage, volume: &Volume) -> ComputeResult<Volume> {
        let device = CpuDevice::new();
        let mut queue = device.create_queue()?;
        let dims = volume.dims();
        stage.validate(dims)?;
        stage.load_program(queue.as_mut())?;
        let result = {
            let mut buffers =
                BufferSet::allocate(queue.as_mut(), dims.slice_len(), dims.depth, stage.info().needs_temp)?;
            let range = DepthRange::new(0, dims.depth)?;
            let chunk = buffers.load(volume, range, 0)?;
            stage.run(&mut buffers, &chunk)?;
            buffers.write_back(&chunk)
        };
        stage.release_program(queue.as_mut());
        assert_eq!(device.live_buffers(), 0);
        Ok(Volume::new(dims, result?)?)
    }
}
