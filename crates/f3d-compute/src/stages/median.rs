//! 3x3x3 median filter.

use tracing::trace;

use super::{FilterStage, ProgramSlot, StageConfig, StageInfo, dispatch, extent_args};
use crate::ComputeResult;
use crate::backend::{CommandQueue, KernelArg};
use crate::buffers::{BufferSet, LoadedChunk};

/// Slices of halo the median kernel is given.
const MEDIAN_OVERLAP: usize = 4;

/// Median over a 3x3x3 window, collapsing along singleton axes.
#[derive(Debug, Clone)]
pub struct Median {
    program: ProgramSlot,
}

impl Median {
    /// Median stage with its program not yet built.
    pub fn new() -> Self {
        Self {
            program: ProgramSlot::new("median"),
        }
    }
}

impl Default for Median {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterStage for Median {
    fn name(&self) -> &str {
        "Median"
    }

    fn info(&self) -> StageInfo {
        StageInfo::uniform(MEDIAN_OVERLAP, false)
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
            w,
            h,
            d,
        ];
        trace!(range = %chunk.range, slices = chunk.slices(), "median");
        dispatch(buffers, program, "median3d", &args, chunk)?;
        buffers.commit()
    }

    fn release_program(&mut self, queue: &mut dyn CommandQueue) {
        self.program.release(queue);
    }

    fn clone_stage(&self) -> Box<dyn FilterStage> {
        Box::new(self.clone())
    }

    fn to_config(&self) -> Option<StageConfig> {
        Some(StageConfig::Median)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::run_whole;
    use f3d_core::{Volume, VolumeDims};

    #[test]
    fn test_median_smooths_salt() {
        let dims = VolumeDims::new(6, 6, 6);
        let vol = Volume::from_fn(dims, |z, y, x| if (z, y, x) == (3, 3, 3) { 255 } else { 40 }).unwrap();
        let out = run_whole(&mut Median::new(), &vol).unwrap();
        assert!(out.data().iter().all(|&v| v == 40));
    }

    #[test]
    fn test_median_clone_unloaded() {
        let stage = Median::new();
        assert!(stage.is_stateful());
        assert_eq!(stage.clone_stage().name(), "Median");
        assert_eq!(stage.info().overlap_z, 4);
    }
}
