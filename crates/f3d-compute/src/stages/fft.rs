//! Per-slice 2-D Fourier transform.

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{FilterStage, ProgramSlot, StageConfig, StageInfo, dispatch, extent_args};
use crate::ComputeResult;
use crate::backend::{CommandQueue, KernelArg};
use crate::buffers::{BufferSet, LoadedChunk};

/// Transform direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    /// Log-magnitude spectrum, centred and scaled to 8 bits.
    #[default]
    Forward,
    /// Spatial magnitude of a centred spectrum.
    Inverse,
}

impl Direction {
    fn kernel(self) -> &'static str {
        match self {
            Self::Forward => "fft2d_forward",
            Self::Inverse => "fft2d_inverse",
        }
    }
}

/// Slice-wise FFT. Slices are independent, so no halo is needed; the
/// unshifted spectrum is staged in the temp buffer.
#[derive(Debug, Clone)]
pub struct Fft {
    direction: Direction,
    program: ProgramSlot,
}

impl Fft {
    /// Transform in the given direction.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            program: ProgramSlot::new("fft"),
        }
    }

    /// Shorthand for `Fft::new(Direction::Forward)`.
    pub fn forward() -> Self {
        Self::new(Direction::Forward)
    }

    /// Shorthand for `Fft::new(Direction::Inverse)`.
    pub fn inverse() -> Self {
        Self::new(Direction::Inverse)
    }

    /// Configured direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl FilterStage for Fft {
    fn name(&self) -> &str {
        match self.direction {
            Direction::Forward => "FFT",
            Direction::Inverse => "InverseFFT",
        }
    }

    fn info(&self) -> StageInfo {
        StageInfo::uniform(0, true)
    }

    fn load_program(&mut self, queue: &mut dyn CommandQueue) -> ComputeResult<()> {
        self.program.load(queue)
    }

    fn run(&self, buffers: &mut BufferSet<'_>, chunk: &LoadedChunk) -> ComputeResult<()> {
        let program = self.program.get()?;
        let [w, h, d] = extent_args(chunk)?;
        let args = [
            KernelArg::Buffer(buffers.input()),
            KernelArg::Buffer(buffers.output()),
            KernelArg::Buffer(buffers.temp()?),
            w,
            h,
            d,
        ];
        trace!(range = %chunk.range, direction = ?self.direction, "fft");
        dispatch(buffers, program, self.direction.kernel(), &args, chunk)?;
        buffers.commit()
    }

    fn release_program(&mut self, queue: &mut dyn CommandQueue) {
        self.program.release(queue);
    }

    fn clone_stage(&self) -> Box<dyn FilterStage> {
        Box::new(self.clone())
    }

    fn to_config(&self) -> Option<StageConfig> {
        Some(StageConfig::Fft {
            direction: self.direction,
        })
    }
}
